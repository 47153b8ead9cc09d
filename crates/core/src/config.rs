//! Product-tuning thresholds for the protection layer.
//!
//! Every window is a [`Duration`] serialized as integer milliseconds. Missing
//! keys fall back to the defaults below, so a config file only needs the
//! values it overrides:
//!
//! ```json
//! { "initialLoadGrace": 5000, "longRunningAppTypes": ["destiny", "report"] }
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tabguard_relay::RelayConfig;
use tabguard_relay::config::duration_ms;
use tracing::debug;

use crate::error::{GuardError, Result};

/// Dialog text shown when a user-initiated reload would interrupt a reply.
pub const DEFAULT_CONFIRM_MESSAGE: &str =
	"An AI reply is still arriving or important content is on screen. Reloading may lose it. Continue?";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuardConfig {
	/// Unload attempts are always allowed this long after a load or route change.
	#[serde(with = "duration_ms")]
	pub initial_load_grace: Duration,
	/// Navigating/initializing lease after a history pop or DOM ready.
	#[serde(with = "duration_ms")]
	pub navigation_grace: Duration,
	/// Navigating lease after a router transition or pushState/replaceState.
	#[serde(with = "duration_ms")]
	pub router_navigation_grace: Duration,
	/// Lease for the changing-conversation and reading-cache flags.
	#[serde(with = "duration_ms")]
	pub chat_activity_lease: Duration,
	/// Lease for the loading-messages flag.
	#[serde(with = "duration_ms")]
	pub loading_messages_lease: Duration,
	/// An interaction, navigation or chat change this recent marks an attempt as user-initiated.
	#[serde(with = "duration_ms")]
	pub user_intent_window: Duration,
	/// A request finished this recently still counts as in flight.
	#[serde(with = "duration_ms")]
	pub recent_request_window: Duration,
	/// Forced-block window after reconnecting or a request error.
	#[serde(with = "duration_ms")]
	pub reconnection_override: Duration,
	/// Minimum spacing between refresh-blocked notifications.
	#[serde(with = "duration_ms")]
	pub blocked_notice_throttle: Duration,
	#[serde(with = "duration_ms")]
	pub watchdog_tick: Duration,
	/// Generation inactivity after which the watchdog clears the loading flag.
	#[serde(with = "duration_ms")]
	pub watchdog_inactivity: Duration,
	/// Inactivity limit for [`GuardConfig::long_running_app_types`].
	#[serde(with = "duration_ms")]
	pub long_running_inactivity: Duration,
	pub long_running_app_types: Vec<String>,
	#[serde(with = "duration_ms")]
	pub get_session_timeout: Duration,
	/// Delay between clearing a replaced session and announcing the replacement.
	#[serde(with = "duration_ms")]
	pub replace_notice_delay: Duration,
	/// Sessions closer than this (end to next start) are flagged as a potential auto-refresh.
	#[serde(with = "duration_ms")]
	pub auto_refresh_gap: Duration,
	pub audit_capacity: usize,
	pub network_ring_capacity: usize,
	/// Heap usage above this fraction of the limit is recorded in the audit log.
	pub memory_alert_ratio: f64,
	pub confirm_message: String,
	/// Protection state used when the durable store has no saved preference.
	pub prevent_auto_refresh_default: bool,
	pub relay: RelayConfig,
}

impl Default for GuardConfig {
	fn default() -> Self {
		Self {
			initial_load_grace: Duration::from_secs(8),
			navigation_grace: Duration::from_millis(1500),
			router_navigation_grace: Duration::from_secs(2),
			chat_activity_lease: Duration::from_secs(2),
			loading_messages_lease: Duration::from_secs(3),
			user_intent_window: Duration::from_secs(1),
			recent_request_window: Duration::from_secs(2),
			reconnection_override: Duration::from_secs(5),
			blocked_notice_throttle: Duration::from_secs(1),
			watchdog_tick: Duration::from_secs(5),
			watchdog_inactivity: Duration::from_secs(10),
			long_running_inactivity: Duration::from_secs(30),
			long_running_app_types: vec!["destiny".to_string()],
			get_session_timeout: Duration::from_secs(3),
			replace_notice_delay: Duration::from_millis(100),
			auto_refresh_gap: Duration::from_secs(1),
			audit_capacity: 20,
			network_ring_capacity: 10,
			memory_alert_ratio: 0.8,
			confirm_message: DEFAULT_CONFIRM_MESSAGE.to_string(),
			prevent_auto_refresh_default: true,
			relay: RelayConfig::default(),
		}
	}
}

impl GuardConfig {
	/// Reads a JSON config file; absent keys keep their defaults.
	pub fn load(path: &Path) -> Result<Self> {
		let content = fs::read_to_string(path)?;
		let config: GuardConfig = serde_json::from_str(&content)?;
		config.validate().map_err(|reason| GuardError::Config {
			path: path.to_path_buf(),
			reason,
		})?;
		debug!(target = "tabguard.config", path = %path.display(), "loaded guard config");
		Ok(config)
	}

	/// Loads `path` when given, otherwise returns defaults.
	pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
		match path {
			Some(path) => Self::load(path),
			None => Ok(Self::default()),
		}
	}

	/// Inactivity window for a generation of `app_type`.
	pub fn inactivity_for(&self, app_type: Option<&str>) -> Duration {
		match app_type {
			Some(kind) if self.long_running_app_types.iter().any(|t| t == kind) => self.long_running_inactivity,
			_ => self.watchdog_inactivity,
		}
	}

	fn validate(&self) -> std::result::Result<(), String> {
		if self.audit_capacity == 0 {
			return Err("auditCapacity must be at least 1".into());
		}
		if self.network_ring_capacity == 0 {
			return Err("networkRingCapacity must be at least 1".into());
		}
		if !(self.memory_alert_ratio > 0.0 && self.memory_alert_ratio <= 1.0) {
			return Err(format!("memoryAlertRatio must be in (0, 1], got {}", self.memory_alert_ratio));
		}
		if self.watchdog_tick.is_zero() {
			return Err("watchdogTick must be positive".into());
		}
		Ok(())
	}
}
