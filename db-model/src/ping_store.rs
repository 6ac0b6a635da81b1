use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use itertools::Itertools;
use log::debug;
use queue_models::probe_record::ProbeRecord;
use tracing::instrument;

use crate::persist::DieselErrorFixCause;
use crate::schema::pings;

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = pings)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PingRow {
    pub address: String,
    pub latency_micros: i64,
    pub observed_at: DateTime<Utc>,
}

impl From<&ProbeRecord> for PingRow {
    fn from(value: &ProbeRecord) -> Self {
        Self {
            address: value.address.clone(),
            latency_micros: i64::try_from(value.latency.as_micros()).unwrap_or(i64::MAX),
            observed_at: value.observed_at,
        }
    }
}

impl From<PingRow> for ProbeRecord {
    fn from(value: PingRow) -> Self {
        Self {
            address: value.address,
            // Negative values can only come from manual edits
            latency: Duration::from_micros(value.latency_micros.max(0) as u64),
            observed_at: value.observed_at,
        }
    }
}

/// Writes the batch in a single statement, replacing stored values of known addresses.
/// If an address occurs multiple times, the last occurrence wins. An empty batch is a no-op.
#[instrument(skip_all, fields(rows = records.len()))]
pub fn upsert_records(conn: &mut PgConnection, records: &[ProbeRecord]) -> Result<usize> {
    let rows = last_per_address(records);
    if rows.is_empty() {
        return Ok(0);
    }
    debug!("Upserting {} rows for {} records", rows.len(), records.len());

    use crate::schema::pings::dsl::*;
    diesel::insert_into(pings)
        .values(&rows)
        .on_conflict(address)
        .do_update()
        .set((
            latency_micros.eq(excluded(latency_micros)),
            observed_at.eq(excluded(observed_at)),
        ))
        .execute(conn)
        .fix_cause()
        .context("upserting probe records")
}

/// All stored records, ordered by address.
#[instrument(skip_all)]
pub fn list_records(conn: &mut PgConnection) -> Result<Vec<ProbeRecord>> {
    use crate::schema::pings::dsl::*;
    let rows: Vec<PingRow> = pings
        .select(PingRow::as_select())
        .order_by(address.asc())
        .load(conn)
        .fix_cause()
        .context("loading probe records")?;
    Ok(rows.into_iter().map_into().collect())
}

/// Postgres refuses to touch the same row twice in one `ON CONFLICT DO UPDATE`, so
/// duplicates are collapsed up front. Rows keep the position of the last occurrence.
fn last_per_address(records: &[ProbeRecord]) -> Vec<PingRow> {
    let mut rows: Vec<PingRow> = records
        .iter()
        .rev()
        .unique_by(|it| it.address.clone())
        .map_into()
        .collect();
    rows.reverse();
    rows
}

#[cfg(test)]
mod tests {
    use assertor::{assert_that, EqualityAssertion, VecAssertion};
    use chrono::TimeZone;

    use super::*;

    fn record(address: &str, latency_ms: u64, second: u32) -> ProbeRecord {
        ProbeRecord {
            address: address.to_string(),
            latency: Duration::from_millis(latency_ms),
            observed_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, second).unwrap(),
        }
    }

    #[test]
    fn later_duplicate_wins() {
        // given
        let batch = vec![
            record("10.0.0.1", 5, 0),
            record("10.0.0.2", 7, 0),
            record("10.0.0.1", 9, 10),
        ];

        // when
        let rows = last_per_address(&batch);

        // then
        assert_that!(rows).has_length(2);
        assert_that!(rows[0]).is_equal_to(PingRow::from(&record("10.0.0.2", 7, 0)));
        assert_that!(rows[1]).is_equal_to(PingRow::from(&record("10.0.0.1", 9, 10)));
    }

    #[test]
    fn distinct_addresses_keep_order() {
        // given
        let batch = vec![record("10.0.0.3", 1, 0), record("10.0.0.1", 2, 0)];

        // when
        let rows = last_per_address(&batch);

        // then
        let addresses: Vec<&str> = rows.iter().map(|it| it.address.as_str()).collect();
        assert_that!(addresses).is_equal_to(vec!["10.0.0.3", "10.0.0.1"]);
    }

    #[test]
    fn empty_batch_yields_no_rows() {
        assert_that!(last_per_address(&[])).is_empty();
    }

    #[test]
    fn row_conversion_keeps_micros() {
        // given
        let original = ProbeRecord {
            address: "10.0.0.1".to_string(),
            latency: Duration::from_micros(1_234),
            observed_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        };

        // when
        let row = PingRow::from(&original);
        let back = ProbeRecord::from(row.clone());

        // then
        assert_that!(row.latency_micros).is_equal_to(1_234);
        assert_that!(back).is_equal_to(original);
    }

    #[test]
    fn negative_stored_latency_is_clamped() {
        // given
        let row = PingRow {
            address: "10.0.0.1".to_string(),
            latency_micros: -5,
            observed_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        };

        // when
        let record = ProbeRecord::from(row);

        // then
        assert_that!(record.latency).is_equal_to(Duration::ZERO);
    }
}
