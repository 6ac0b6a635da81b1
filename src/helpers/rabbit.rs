pub use handle::{ConfigureRabbit, RabbitHandle};

mod handle;
pub mod receive;
