use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use db_model::persist;
use db_model::ping_store;
use log::debug;
use queue_models::probe_record::ProbeRecord;
use tokio::task;
use tracing::instrument;

/// Durable storage of the latest record per address.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Stores the whole batch at once, replacing records of known addresses. If an address
    /// occurs multiple times, the last occurrence wins.
    async fn upsert(&self, records: &[ProbeRecord]) -> Result<()>;

    /// Everything stored, ordered by address.
    async fn list(&self) -> Result<Vec<ProbeRecord>>;
}

#[async_trait]
impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    async fn upsert(&self, records: &[ProbeRecord]) -> Result<()> {
        self.as_ref().upsert(records).await
    }

    async fn list(&self) -> Result<Vec<ProbeRecord>> {
        self.as_ref().list().await
    }
}

/// Postgres-backed store. Diesel is synchronous, so every call gets its own connection on
/// a blocking thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct DieselStore;

#[async_trait]
impl RecordStore for DieselStore {
    #[instrument(name = "store upsert", skip_all, fields(records = records.len()))]
    async fn upsert(&self, records: &[ProbeRecord]) -> Result<()> {
        let records = records.to_vec();
        let rows = task::spawn_blocking(move || {
            let mut conn = persist::connect("aggregator - flush")?;
            ping_store::upsert_records(&mut conn, &records)
        })
        .await
        .context("upsert task crashed")??;
        debug!("Upserted {} rows.", rows);
        Ok(())
    }

    #[instrument(name = "store list", skip_all)]
    async fn list(&self) -> Result<Vec<ProbeRecord>> {
        task::spawn_blocking(|| {
            let mut conn = persist::connect("aggregator - api")?;
            ping_store::list_records(&mut conn)
        })
        .await
        .context("list task crashed")?
    }
}
