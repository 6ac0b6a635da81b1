use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use queue_models::probe_record::ProbeRecord;

use crate::store::RecordStore;

pub fn record(address: &str, latency_ms: u64) -> ProbeRecord {
    ProbeRecord {
        address: address.to_string(),
        latency: Duration::from_millis(latency_ms),
        observed_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
    }
}

/// Keeps upserted records in memory, remembering the size of every batch it got.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<String, ProbeRecord>>,
    batch_sizes: Mutex<Vec<usize>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    pub fn stored(&self) -> Vec<ProbeRecord> {
        self.rows.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert(&self, records: &[ProbeRecord]) -> Result<()> {
        self.batch_sizes.lock().unwrap().push(records.len());
        if self.failing.load(Ordering::SeqCst) {
            bail!("database is down");
        }
        let mut rows = self.rows.lock().unwrap();
        for record in records {
            rows.insert(record.address.clone(), record.clone());
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProbeRecord>> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("database is down");
        }
        Ok(self.stored())
    }
}
