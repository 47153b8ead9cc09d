//! Durable refresh audit log.
//!
//! Page loads, unloads, controller changes and memory alerts are appended to a
//! bounded ring buffer in the per-origin store. On startup the two most recent
//! complete sessions are compared; a gap shorter than
//! [`GuardConfig::auto_refresh_gap`] between one ending and the next starting
//! is flagged as a potential auto-refresh.
//!
//! Nothing else reads this log for decisions. Every operation is best-effort:
//! storage failures are logged, malformed entries are skipped and an
//! unparsable log reads as empty.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tabguard_relay::Clock;
use tabguard_relay::clock::millis;
use tracing::{debug, info, warn};

use crate::config::GuardConfig;
use crate::error::Result;
use crate::storage::KeyValueStore;

pub const HISTORY_KEY: &str = "refresh_tracker_history";
pub const LAST_SESSION_KEY: &str = "refresh_tracker_last_session";

/// Page metadata captured at load time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageLoadInfo {
	pub url: String,
	pub user_agent: String,
	/// `navigate`, `reload`, `back_forward`, `other` or `unknown`.
	pub navigation_type: String,
	pub load_time: u64,
	pub referrer: String,
	pub sw_active: bool,
}

/// One page session; the end fields are filled in at unload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionRecord {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub start_time: Option<u64>,
	pub url: String,
	pub user_agent: String,
	pub navigation_type: String,
	pub load_time: u64,
	pub referrer: String,
	pub sw_active: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub end_time: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub duration: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub end_url: Option<String>,
}

impl SessionRecord {
	fn started(now: u64, info: PageLoadInfo) -> Self {
		Self {
			start_time: Some(now),
			url: info.url,
			user_agent: info.user_agent,
			navigation_type: info.navigation_type,
			load_time: info.load_time,
			referrer: info.referrer,
			sw_active: info.sw_active,
			..Self::default()
		}
	}

	pub fn is_complete(&self) -> bool {
		self.start_time.is_some() && self.end_time.is_some()
	}
}

/// Two sessions separated by less than the auto-refresh gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRefreshSuspicion {
	pub time: u64,
	/// Next start minus previous end, in milliseconds.
	pub time_diff: i64,
	pub last_url: Option<String>,
	pub current_url: String,
	pub navigation_type: String,
}

/// Heap figures in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySample {
	pub used_heap: u64,
	pub total_heap: u64,
	pub heap_limit: u64,
}

impl MemorySample {
	pub fn ratio(&self) -> f64 {
		if self.heap_limit == 0 {
			return 0.0;
		}
		self.used_heap as f64 / self.heap_limit as f64
	}
}

/// Human-readable memory figures as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
	#[serde(rename = "usedJSHeapSize")]
	pub used: String,
	#[serde(rename = "totalJSHeapSize")]
	pub total: String,
	#[serde(rename = "jsHeapSizeLimit")]
	pub limit: String,
	pub percentage: String,
}

impl From<MemorySample> for MemoryUsage {
	fn from(sample: MemorySample) -> Self {
		const MIB: f64 = 1024.0 * 1024.0;
		let mb = |bytes: u64| format!("{}MB", (bytes as f64 / MIB).round() as u64);
		Self {
			used: mb(sample.used_heap),
			total: mb(sample.total_heap),
			limit: mb(sample.heap_limit),
			percentage: format!("{}%", (sample.ratio() * 100.0).round() as u64),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AuditAlert {
	#[serde(rename = "sw_controller_change")]
	ControllerChange {
		time: u64,
		url: String,
		has_controller: bool,
		controller_url: Option<String>,
	},
	PotentialAutoRefresh(AutoRefreshSuspicion),
	HighMemoryUsage {
		time: u64,
		url: String,
		memory_usage: MemoryUsage,
	},
}

/// A single audit log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuditEntry {
	Alert(AuditAlert),
	Session(SessionRecord),
}

impl AuditEntry {
	/// Parses a stored record, rejecting values that are neither an alert nor a session.
	fn parse(value: Value) -> Option<Self> {
		match serde_json::from_value(value) {
			Ok(AuditEntry::Session(record)) if record.start_time.is_none() && record.end_time.is_none() => None,
			Ok(entry) => Some(entry),
			Err(_) => None,
		}
	}

	pub fn kind(&self) -> &'static str {
		match self {
			AuditEntry::Alert(AuditAlert::ControllerChange { .. }) => "sw_controller_change",
			AuditEntry::Alert(AuditAlert::PotentialAutoRefresh(_)) => "potential_auto_refresh",
			AuditEntry::Alert(AuditAlert::HighMemoryUsage { .. }) => "high_memory_usage",
			AuditEntry::Session(_) => "session",
		}
	}

	pub fn as_session(&self) -> Option<&SessionRecord> {
		match self {
			AuditEntry::Session(record) => Some(record),
			AuditEntry::Alert(_) => None,
		}
	}
}

/// Reads and appends the audit ring buffer.
#[derive(Debug, Clone)]
pub struct RefreshTracker {
	store: Arc<dyn KeyValueStore>,
	clock: Arc<dyn Clock>,
	capacity: usize,
	auto_refresh_gap: u64,
	memory_alert_ratio: f64,
}

impl RefreshTracker {
	pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: &GuardConfig) -> Self {
		Self {
			store,
			clock,
			capacity: config.audit_capacity,
			auto_refresh_gap: millis(config.auto_refresh_gap),
			memory_alert_ratio: config.memory_alert_ratio,
		}
	}

	/// Records the page load, then checks the previous two sessions for an auto-refresh.
	pub fn init(&self, info: PageLoadInfo) -> Option<AutoRefreshSuspicion> {
		info!(target = "tabguard.audit", url = %info.url, navigation_type = %info.navigation_type, "refresh tracking started");
		self.record_page_load(info);
		self.analyze_last_session()
	}

	/// Starts a new session record. It enters the history at unload.
	pub fn record_page_load(&self, info: PageLoadInfo) {
		let record = SessionRecord::started(self.clock.now_ms(), info);
		debug!(target = "tabguard.audit", url = %record.url, sw_active = record.sw_active, "page load recorded");
		let result = serde_json::to_string(&record).map_err(Into::into).and_then(|json| self.store.set(LAST_SESSION_KEY, &json));
		if let Err(err) = result {
			warn!(target = "tabguard.audit", error = %err, "failed to save page load");
		}
	}

	/// Closes the current session and appends it to the history.
	pub fn record_page_unload(&self, url: &str) -> SessionRecord {
		let now = self.clock.now_ms();
		let mut record = self.last_session().unwrap_or_default();
		record.end_time = Some(now);
		record.duration = Some(now.saturating_sub(record.start_time.unwrap_or(0)));
		record.end_url = Some(url.to_string());
		debug!(target = "tabguard.audit", url, duration_ms = record.duration, "page unload recorded");
		self.append(AuditEntry::Session(record.clone()));
		record
	}

	pub fn record_controller_change(&self, url: &str, controller_url: Option<&str>) {
		info!(target = "tabguard.audit", url, controller = ?controller_url, "worker controller changed");
		self.append(AuditEntry::Alert(AuditAlert::ControllerChange {
			time: self.clock.now_ms(),
			url: url.to_string(),
			has_controller: controller_url.is_some(),
			controller_url: controller_url.map(str::to_string),
		}));
	}

	/// Appends a `high_memory_usage` entry when heap use is above the alert ratio.
	pub fn record_memory_sample(&self, sample: MemorySample, url: &str) -> bool {
		if sample.heap_limit == 0 || sample.ratio() <= self.memory_alert_ratio {
			return false;
		}
		let memory_usage = MemoryUsage::from(sample);
		warn!(target = "tabguard.audit", percentage = %memory_usage.percentage, "high memory usage");
		self.append(AuditEntry::Alert(AuditAlert::HighMemoryUsage {
			time: self.clock.now_ms(),
			url: url.to_string(),
			memory_usage,
		}));
		true
	}

	/// Compares the two most recent complete sessions and records a suspicion
	/// if the second started within the auto-refresh gap of the first ending.
	pub fn analyze_last_session(&self) -> Option<AutoRefreshSuspicion> {
		let raw = self.read_raw();
		if raw.len() < 2 {
			debug!(target = "tabguard.audit", entries = raw.len(), "not enough history to analyze");
			return None;
		}

		let sessions: Vec<SessionRecord> = raw
			.into_iter()
			.filter_map(AuditEntry::parse)
			.filter_map(|entry| match entry {
				AuditEntry::Session(record) if record.is_complete() => Some(record),
				_ => None,
			})
			.collect();
		let [.., last, current] = sessions.as_slice() else {
			debug!(target = "tabguard.audit", sessions = sessions.len(), "not enough complete sessions to analyze");
			return None;
		};

		let (Some(start), Some(end)) = (current.start_time, last.end_time) else {
			return None;
		};
		let time_diff = start as i64 - end as i64;
		debug!(target = "tabguard.audit", last_end = end, current_start = start, time_diff, "session gap");
		if time_diff >= self.auto_refresh_gap as i64 {
			return None;
		}

		let suspicion = AutoRefreshSuspicion {
			time: self.clock.now_ms(),
			time_diff,
			last_url: last.end_url.clone(),
			current_url: current.url.clone(),
			navigation_type: current.navigation_type.clone(),
		};
		warn!(target = "tabguard.audit", time_diff, url = %suspicion.current_url, "potential auto-refresh detected");
		self.append(AuditEntry::Alert(AuditAlert::PotentialAutoRefresh(suspicion.clone())));
		Some(suspicion)
	}

	/// All readable entries, oldest first.
	pub fn history(&self) -> Vec<AuditEntry> {
		self.read_raw().into_iter().filter_map(AuditEntry::parse).collect()
	}

	/// The session started by the last page load, if one is saved.
	pub fn last_session(&self) -> Option<SessionRecord> {
		let json = match self.store.get(LAST_SESSION_KEY) {
			Ok(json) => json?,
			Err(err) => {
				warn!(target = "tabguard.audit", error = %err, "failed to read last session");
				return None;
			}
		};
		serde_json::from_str(&json)
			.inspect_err(|err| warn!(target = "tabguard.audit", error = %err, "last session record is corrupt"))
			.ok()
	}

	/// Removes the history and the last-session record.
	pub fn clear(&self) -> bool {
		let result = self.store.remove(HISTORY_KEY).and_then(|()| self.store.remove(LAST_SESSION_KEY));
		match result {
			Ok(()) => {
				info!(target = "tabguard.audit", "audit history cleared");
				true
			}
			Err(err) => {
				warn!(target = "tabguard.audit", error = %err, "failed to clear audit history");
				false
			}
		}
	}

	fn read_raw(&self) -> Vec<Value> {
		let json = match self.store.get(HISTORY_KEY) {
			Ok(Some(json)) => json,
			Ok(None) => return Vec::new(),
			Err(err) => {
				warn!(target = "tabguard.audit", error = %err, "failed to read audit history");
				return Vec::new();
			}
		};
		serde_json::from_str(&json).unwrap_or_else(|err| {
			warn!(target = "tabguard.audit", error = %err, "audit history is unparsable, treating as empty");
			Vec::new()
		})
	}

	fn append(&self, entry: AuditEntry) {
		if let Err(err) = self.try_append(&entry) {
			warn!(target = "tabguard.audit", kind = entry.kind(), error = %err, "failed to store audit entry");
		}
	}

	fn try_append(&self, entry: &AuditEntry) -> Result<()> {
		let mut raw = self.read_raw();
		raw.push(serde_json::to_value(entry)?);
		if raw.len() > self.capacity {
			raw.drain(..raw.len() - self.capacity);
		}
		self.store.set(HISTORY_KEY, &serde_json::to_string(&raw)?)
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use serde_json::json;
	use tabguard_relay::ManualClock;

	use super::*;
	use crate::storage::MemoryStore;

	fn tracker(clock: &ManualClock, store: &MemoryStore) -> RefreshTracker {
		RefreshTracker::new(Arc::new(store.clone()), Arc::new(clock.clone()), &GuardConfig::default())
	}

	fn load(url: &str) -> PageLoadInfo {
		PageLoadInfo {
			url: url.to_string(),
			navigation_type: "reload".to_string(),
			..PageLoadInfo::default()
		}
	}

	/// Runs one load/unload cycle, leaving `gap_ms` before the next load.
	fn session(tracker: &RefreshTracker, clock: &ManualClock, url: &str, gap_ms: u64) {
		tracker.record_page_load(load(url));
		clock.advance(Duration::from_secs(30));
		tracker.record_page_unload(url);
		clock.advance(Duration::from_millis(gap_ms));
	}

	#[test]
	fn short_gap_is_flagged() {
		let clock = ManualClock::new(1_000_000);
		let store = MemoryStore::new();
		let tracker = tracker(&clock, &store);
		session(&tracker, &clock, "https://app/chat/1", 500);
		session(&tracker, &clock, "https://app/chat/2", 0);

		let suspicion = tracker.analyze_last_session().unwrap();
		assert_eq!(suspicion.time_diff, 500);
		assert_eq!(suspicion.last_url.as_deref(), Some("https://app/chat/1"));
		assert_eq!(suspicion.current_url, "https://app/chat/2");
		assert_eq!(suspicion.navigation_type, "reload");

		let history = tracker.history();
		assert_eq!(history.len(), 3);
		assert_eq!(history[2].kind(), "potential_auto_refresh");
	}

	#[test]
	fn long_gap_is_not_flagged() {
		let clock = ManualClock::new(1_000_000);
		let store = MemoryStore::new();
		let tracker = tracker(&clock, &store);
		session(&tracker, &clock, "https://app/a", 5_000);
		session(&tracker, &clock, "https://app/b", 0);

		assert!(tracker.analyze_last_session().is_none());
		assert_eq!(tracker.history().len(), 2);
	}

	#[test]
	fn single_session_is_not_analyzed() {
		let clock = ManualClock::new(1_000_000);
		let store = MemoryStore::new();
		let tracker = tracker(&clock, &store);
		session(&tracker, &clock, "https://app/a", 0);
		tracker.record_controller_change("https://app/a", Some("https://app/sw.js"));

		assert!(tracker.analyze_last_session().is_none());
	}

	#[test]
	fn unload_fills_end_fields() {
		let clock = ManualClock::new(10_000);
		let store = MemoryStore::new();
		let tracker = tracker(&clock, &store);
		tracker.record_page_load(load("https://app/start"));
		clock.advance(Duration::from_millis(2_500));

		let record = tracker.record_page_unload("https://app/end");
		assert_eq!(record.start_time, Some(10_000));
		assert_eq!(record.end_time, Some(12_500));
		assert_eq!(record.duration, Some(2_500));
		assert_eq!(record.end_url.as_deref(), Some("https://app/end"));
		assert_eq!(record.url, "https://app/start");
	}

	#[test]
	fn malformed_entries_are_skipped() {
		let clock = ManualClock::new(0);
		let store = MemoryStore::new();
		let raw = json!([
			"garbage",
			42,
			{ "unrelated": true },
			{ "type": "sw_controller_change", "time": 5, "url": "https://app", "hasController": false, "controllerUrl": null },
			{ "startTime": 1, "endTime": 2, "url": "https://app" }
		]);
		store.set(HISTORY_KEY, &raw.to_string()).unwrap();

		let history = tracker(&clock, &store).history();
		assert_eq!(history.len(), 2);
		assert_eq!(history[0].kind(), "sw_controller_change");
		assert_eq!(history[1].as_session().and_then(|s| s.end_time), Some(2));
	}

	#[test]
	fn unparsable_log_means_no_history() {
		let clock = ManualClock::new(0);
		let store = MemoryStore::new();
		store.set(HISTORY_KEY, "{not json").unwrap();
		let tracker = tracker(&clock, &store);

		assert!(tracker.history().is_empty());
		assert!(tracker.analyze_last_session().is_none());
		tracker.record_controller_change("https://app", None);
		assert_eq!(tracker.history().len(), 1);
	}

	#[test]
	fn history_is_capped() {
		let clock = ManualClock::new(0);
		let store = MemoryStore::new();
		let tracker = tracker(&clock, &store);
		for i in 0..25 {
			tracker.record_controller_change(&format!("https://app/{i}"), None);
		}

		let history = tracker.history();
		assert_eq!(history.len(), 20);
		assert!(matches!(&history[0], AuditEntry::Alert(AuditAlert::ControllerChange { url, .. }) if url == "https://app/5"));
	}

	#[test]
	fn memory_alert_above_ratio() {
		let clock = ManualClock::new(0);
		let store = MemoryStore::new();
		let tracker = tracker(&clock, &store);
		let mib = 1024 * 1024;

		let calm = MemorySample { used_heap: 100 * mib, total_heap: 200 * mib, heap_limit: 1000 * mib };
		assert!(!tracker.record_memory_sample(calm, "https://app"));

		let hot = MemorySample { used_heap: 900 * mib, total_heap: 950 * mib, heap_limit: 1000 * mib };
		assert!(tracker.record_memory_sample(hot, "https://app"));

		let stored: Value = serde_json::from_str(&store.get(HISTORY_KEY).unwrap().unwrap()).unwrap();
		assert_eq!(stored[0]["type"], "high_memory_usage");
		assert_eq!(stored[0]["memoryUsage"]["usedJSHeapSize"], "900MB");
		assert_eq!(stored[0]["memoryUsage"]["percentage"], "90%");
	}

	#[test]
	fn clear_removes_everything() {
		let clock = ManualClock::new(0);
		let store = MemoryStore::new();
		let tracker = tracker(&clock, &store);
		session(&tracker, &clock, "https://app", 0);

		assert!(tracker.clear());
		assert!(tracker.history().is_empty());
		assert!(tracker.last_session().is_none());
	}

	#[test]
	fn init_records_load_and_analyzes() {
		let clock = ManualClock::new(1_000_000);
		let store = MemoryStore::new();
		let tracker = tracker(&clock, &store);
		session(&tracker, &clock, "https://app/a", 200);
		session(&tracker, &clock, "https://app/b", 100);

		assert!(tracker.init(load("https://app/c")).is_some());
		assert_eq!(tracker.last_session().unwrap().url, "https://app/c");
	}
}
