/// Drives a work source until either it is exhausted or the stop token is cancelled,
/// whichever happens first. Stop always takes priority over pending work.
///
/// Forms:
///  - `recv "name", stop_rx, work_rx => handle(it) on self`: receive from a channel and
///    pass each item to an async method returning `Result`; a closed channel ends the loop.
///  - `"name", stop_rx, trigger.tick() => handle(it) on self as simple`: for sources that
///    never run dry (e.g. intervals), same error propagation.
///
/// The enclosing function must return `anyhow::Result<()>`.
#[macro_export]
macro_rules! loop_with_stop {
    (recv $task_name:expr, $stop_rx:ident, $work_rx:ident => $work:ident(it) on $self:ident) => {
        $crate::loop_with_stop!($task_name, $stop_rx, $work_rx.recv() => $work(it) on $self as result)
    };

    ($task_name:expr, $stop_rx:ident, $work_rx:ident.$op:ident() => $work:ident(it) on $self:ident as $result_type:ident) => {
        loop {
            let work_fut = $work_rx.$op();
            let stop_fut = $stop_rx.cancelled();

            tokio::select! {
                biased; // Stop should take prio
                _ = stop_fut => {
                    log::trace!("Cancellation signal received by {}.", $task_name);
                    return anyhow::Result::Ok(());
                }
                work_opt = work_fut => {
                    $crate::loop_with_stop!($result_type work_opt for $task_name, $work(it) on $self)
                }
            }
        }
    };

    (result $result_opt:ident for $task_name:expr, $work:ident(it) on $self:ident) => {
        if let Some(work) = $result_opt {
            $self.$work(work).await?;
        } else {
            log::debug!("Sender closed channel for {}", $task_name);
            return anyhow::Result::Ok(());
        }
    };

    (simple $result_simple:ident for $task_name:expr, $work:ident(it) on $self:ident) => {
        $self.$work($result_simple).await?;
    };
}
