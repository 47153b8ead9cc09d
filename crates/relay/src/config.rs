//! Relay tuning parameters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Eviction cadence and idle limit for cached sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
	/// How often the sweep runs.
	#[serde(with = "duration_ms")]
	pub sweep_interval: Duration,
	/// Sessions idle for longer than this are evicted by the sweep.
	#[serde(with = "duration_ms")]
	pub session_ttl: Duration,
}

impl Default for RelayConfig {
	fn default() -> Self {
		Self {
			sweep_interval: Duration::from_secs(60 * 60),
			session_ttl: Duration::from_secs(60 * 60),
		}
	}
}

/// Serializes a [`Duration`] as integer milliseconds.
pub mod duration_ms {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(crate::clock::millis(*value))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}
