use std::fmt::{Display, Formatter};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TypeRoutedMessage;

/// A network address monitored for latency, e.g. a container IP.
pub type ProbeTarget = String;

/// Result of one successful latency probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub address: ProbeTarget,

    /// Mean round-trip time reported by the probe, microsecond resolution on the wire.
    #[serde(rename = "latency_micros", with = "duration_micros")]
    pub latency: Duration,

    /// When the probe was sent (not when it completed).
    pub observed_at: DateTime<Utc>,
}

impl TypeRoutedMessage for ProbeRecord {
    fn routing_key() -> &'static str {
        "probe-record"
    }
}

impl Display for ProbeRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}µs @ {}",
            self.address,
            self.latency.as_micros(),
            self.observed_at.to_rfc3339()
        )
    }
}

mod duration_micros {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let micros = u64::try_from(value.as_micros()).unwrap_or(u64::MAX);
        serializer.serialize_u64(micros)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_micros)
    }
}
