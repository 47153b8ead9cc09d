//! Refresh decision engine.
//!
//! [`RefreshGuard::evaluate_unload`] runs synchronously from the unload
//! handler and answers in one pass over an [`ActivitySnapshot`]; nothing on
//! that path awaits, touches storage or talks to the relay.
//!
//! Rules, first match wins:
//!
//! 1. inside the initial-load grace window: allow
//! 2. navigating or initializing the page: allow
//! 3. reconnection override or a forced block pending: block
//! 4. chat activity in progress: allow
//! 5. a request active or just finished: allow
//! 6. not user-initiated and protection, streaming or a modal holds: block
//! 7. user-initiated while streaming or a modal shows, and not a navigation: confirm
//! 8. otherwise: allow

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tabguard_relay::Clock;
use tabguard_relay::clock::millis;
use tracing::{debug, info, warn};

use crate::activity::{ActivitySnapshot, ActivityTracker, NetworkState};
use crate::config::GuardConfig;
use crate::events::{EventBus, GuardEvent};

/// Where an unload attempt came from, when the caller knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cause {
	/// A click, key press or other direct input.
	UserGesture,
	/// An in-app navigation leaving the page.
	Navigation,
	/// Code-initiated reload with no user behind it.
	Programmatic,
	/// A reload triggered by connectivity coming back.
	NetworkRecovery,
}

impl Cause {
	fn is_user_initiated(self) -> bool {
		matches!(self, Cause::UserGesture | Cause::Navigation)
	}
}

/// An impending unload, as reported by the page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadAttempt {
	/// `None` falls back to recency heuristics.
	pub cause: Option<Cause>,
}

impl UnloadAttempt {
	pub fn with_cause(cause: Cause) -> Self {
		Self { cause: Some(cause) }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AllowReason {
	InitialLoad,
	Navigation,
	ChatActivity,
	ApiRequest,
	UserInitiated,
	Unprotected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockReason {
	Reconnection,
	Forced,
	AutoRefresh,
}

/// Outcome of an unload evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Decision {
	Allow { reason: AllowReason },
	/// Suppress the unload without showing anything.
	Block { reason: BlockReason },
	/// Ask the user; their answer is final.
	Confirm { message: String },
}

impl Decision {
	pub fn is_allow(&self) -> bool {
		matches!(self, Decision::Allow { .. })
	}

	pub fn is_block(&self) -> bool {
		matches!(self, Decision::Block { .. })
	}
}

/// Debug counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshStats {
	pub blocked_auto_refreshes: u64,
	pub user_confirmations: u64,
	pub allowed_refreshes: u64,
	/// Epoch milliseconds of the latest block, 0 if none.
	pub last_block_time: u64,
}

/// Whether a controller-change event may continue to other handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Propagation {
	Continue,
	Halt,
}

/// A key press, as far as reload detection cares.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyChord {
	pub key: String,
	#[serde(default)]
	pub ctrl: bool,
	#[serde(default)]
	pub meta: bool,
}

impl KeyChord {
	pub fn new(key: impl Into<String>) -> Self {
		Self {
			key: key.into(),
			ctrl: false,
			meta: false,
		}
	}

	pub fn ctrl(mut self) -> Self {
		self.ctrl = true;
		self
	}

	pub fn meta(mut self) -> Self {
		self.meta = true;
		self
	}

	/// F5, Ctrl+R or Cmd+R.
	pub fn is_reload(&self) -> bool {
		self.key == "F5" || ((self.ctrl || self.meta) && self.key.eq_ignore_ascii_case("r"))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ShortcutVerdict {
	/// Not a reload shortcut.
	Ignored,
	Proceed,
	/// Cancel the key event.
	Cancel,
}

/// A blocking yes/no dialog.
pub trait ConfirmPrompt {
	fn confirm(&self, message: &str) -> bool;
}

impl<F: Fn(&str) -> bool> ConfirmPrompt for F {
	fn confirm(&self, message: &str) -> bool {
		self(message)
	}
}

/// Full debug view of the guard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardStatus {
	pub activity: ActivitySnapshot,
	pub stats: RefreshStats,
	pub last_interaction: Option<u64>,
	pub last_request_activity: Option<u64>,
	pub network: NetworkState,
}

#[derive(Debug, Default)]
struct Counters {
	stats: RefreshStats,
	last_notice: Option<u64>,
}

pub struct RefreshGuard {
	activity: Arc<ActivityTracker>,
	config: Arc<GuardConfig>,
	clock: Arc<dyn Clock>,
	events: EventBus,
	counters: Mutex<Counters>,
}

impl RefreshGuard {
	pub fn new(activity: Arc<ActivityTracker>, config: Arc<GuardConfig>, clock: Arc<dyn Clock>, events: EventBus) -> Self {
		Self {
			activity,
			config,
			clock,
			events,
			counters: Mutex::new(Counters::default()),
		}
	}

	pub fn activity(&self) -> &Arc<ActivityTracker> {
		&self.activity
	}

	/// Decides what to do with an impending unload.
	pub fn evaluate_unload(&self, attempt: UnloadAttempt) -> Decision {
		let snap = self.activity.snapshot();
		debug!(target = "tabguard.guard", cause = ?attempt.cause, streaming = snap.streaming, modal = snap.modal_showing, since_load_ms = snap.ms_since_load, "unload attempt");

		if snap.within_initial_load {
			return self.allow(AllowReason::InitialLoad);
		}
		if snap.navigating || snap.initializing_page {
			return self.allow(AllowReason::Navigation);
		}
		if self.activity.take_force_block() {
			return self.block(snap.now, BlockReason::Forced);
		}
		if snap.reconnection_override {
			return self.block(snap.now, BlockReason::Reconnection);
		}
		if snap.chat_active() {
			return self.allow(AllowReason::ChatActivity);
		}
		if snap.request_in_flight {
			return self.allow(AllowReason::ApiRequest);
		}

		let user_initiated = match attempt.cause {
			Some(cause) => cause.is_user_initiated(),
			None => snap.recent_navigation || snap.recent_chat_activity || snap.recent_interaction,
		};

		if !user_initiated && (snap.prevent_auto_refresh || snap.streaming || snap.modal_showing) {
			return self.block(snap.now, BlockReason::AutoRefresh);
		}
		if user_initiated && snap.should_prompt() && attempt.cause != Some(Cause::Navigation) {
			self.counters.lock().stats.user_confirmations += 1;
			info!(target = "tabguard.guard", "user-initiated refresh during a reply, asking for confirmation");
			return Decision::Confirm {
				message: self.config.confirm_message.clone(),
			};
		}

		self.allow(if user_initiated { AllowReason::UserInitiated } else { AllowReason::Unprotected })
	}

	fn allow(&self, reason: AllowReason) -> Decision {
		self.counters.lock().stats.allowed_refreshes += 1;
		debug!(target = "tabguard.guard", reason = ?reason, "unload allowed");
		Decision::Allow { reason }
	}

	fn block(&self, now: u64, reason: BlockReason) -> Decision {
		let notice = {
			let mut counters = self.counters.lock();
			counters.stats.blocked_auto_refreshes += 1;
			counters.stats.last_block_time = now;
			let due = counters
				.last_notice
				.is_none_or(|last| now.saturating_sub(last) >= millis(self.config.blocked_notice_throttle));
			if due {
				counters.last_notice = Some(now);
			}
			due.then_some(counters.stats.blocked_auto_refreshes)
		};
		if let Some(blocked_count) = notice {
			warn!(target = "tabguard.guard", reason = ?reason, blocked_count, "auto-refresh blocked");
			self.events.emit(GuardEvent::RefreshBlocked {
				blocked_count,
				timestamp: now,
			});
		}
		Decision::Block { reason }
	}

	/// Handles a relay taking control of the page.
	pub fn on_controller_change(&self) -> Propagation {
		if self.activity.should_prevent_auto_refresh() {
			warn!(target = "tabguard.guard", "relay controller changed while protection holds, halting propagation");
			Propagation::Halt
		} else {
			Propagation::Continue
		}
	}

	/// Confirms reload shortcuts while a reply streams or a modal shows.
	pub fn on_reload_shortcut(&self, chord: &KeyChord, prompt: &dyn ConfirmPrompt) -> ShortcutVerdict {
		if !chord.is_reload() {
			return ShortcutVerdict::Ignored;
		}
		if !self.activity.snapshot().should_prompt() {
			return ShortcutVerdict::Proceed;
		}
		if prompt.confirm(&self.config.confirm_message) {
			info!(target = "tabguard.guard", key = %chord.key, "user confirmed reload shortcut");
			ShortcutVerdict::Proceed
		} else {
			info!(target = "tabguard.guard", key = %chord.key, "user cancelled reload shortcut");
			ShortcutVerdict::Cancel
		}
	}

	pub fn stats(&self) -> RefreshStats {
		self.counters.lock().stats
	}

	pub fn status(&self) -> GuardStatus {
		GuardStatus {
			activity: self.activity.snapshot(),
			stats: self.stats(),
			last_interaction: self.activity.last_interaction(),
			last_request_activity: self.activity.last_request_activity(),
			network: self.activity.network(),
		}
	}

	/// Clears activity state and counters.
	pub fn reset(&self) {
		self.activity.reset();
		*self.counters.lock() = Counters::default();
	}

	/// Blocks the next evaluated unload regardless of heuristics.
	pub fn force_block_next(&self) {
		info!(target = "tabguard.guard", "next unload attempt will be blocked");
		self.activity.force_block_next();
	}

	pub fn now(&self) -> u64 {
		self.clock.now_ms()
	}
}

impl std::fmt::Debug for RefreshGuard {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RefreshGuard").field("stats", &self.stats()).finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use std::cell::Cell;
	use std::time::Duration;

	use tabguard_relay::ManualClock;

	use super::*;
	use crate::storage::MemoryStore;

	fn guard(clock: &ManualClock) -> RefreshGuard {
		let config = Arc::new(GuardConfig::default());
		let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
		let events = EventBus::new();
		let activity = Arc::new(ActivityTracker::new(config.clone(), clock_arc.clone(), events.clone(), Arc::new(MemoryStore::new()), None));
		RefreshGuard::new(activity, config, clock_arc, events)
	}

	fn past_grace(clock: &ManualClock) {
		clock.advance(Duration::from_secs(10));
	}

	#[test]
	fn grace_window_allows_even_while_streaming() {
		let clock = ManualClock::new(0);
		let guard = guard(&clock);
		guard.activity().set_streaming(true);
		clock.advance(Duration::from_secs(7));

		assert_eq!(guard.evaluate_unload(UnloadAttempt::default()), Decision::Allow { reason: AllowReason::InitialLoad });
	}

	#[test]
	fn unattended_attempt_is_blocked_silently() {
		let clock = ManualClock::new(0);
		let guard = guard(&clock);
		past_grace(&clock);
		guard.activity().set_streaming(true);
		let mut rx = guard.events.subscribe();

		let decision = guard.evaluate_unload(UnloadAttempt::default());
		assert_eq!(decision, Decision::Block { reason: BlockReason::AutoRefresh });
		let stats = guard.stats();
		assert_eq!(stats.blocked_auto_refreshes, 1);
		assert_eq!(stats.last_block_time, 10_000);
		assert!(matches!(rx.try_recv().unwrap(), GuardEvent::RefreshBlocked { blocked_count: 1, .. }));
	}

	#[test]
	fn blocked_notices_are_throttled() {
		let clock = ManualClock::new(0);
		let guard = guard(&clock);
		past_grace(&clock);
		let mut rx = guard.events.subscribe();

		guard.evaluate_unload(UnloadAttempt::with_cause(Cause::Programmatic));
		clock.advance(Duration::from_millis(400));
		guard.evaluate_unload(UnloadAttempt::with_cause(Cause::Programmatic));
		clock.advance(Duration::from_millis(600));
		guard.evaluate_unload(UnloadAttempt::with_cause(Cause::Programmatic));

		assert_eq!(guard.stats().blocked_auto_refreshes, 3);
		assert!(matches!(rx.try_recv().unwrap(), GuardEvent::RefreshBlocked { blocked_count: 1, .. }));
		assert!(matches!(rx.try_recv().unwrap(), GuardEvent::RefreshBlocked { blocked_count: 3, .. }));
		assert!(rx.try_recv().is_err());
	}

	#[test]
	fn recent_click_while_streaming_asks_for_confirmation() {
		let clock = ManualClock::new(0);
		let guard = guard(&clock);
		past_grace(&clock);
		guard.activity().set_streaming(true);
		guard.activity().record_interaction();
		clock.advance(Duration::from_millis(300));

		match guard.evaluate_unload(UnloadAttempt::default()) {
			Decision::Confirm { message } => assert!(message.contains("AI reply")),
			other => panic!("expected confirm, got {other:?}"),
		}
		assert_eq!(guard.stats().user_confirmations, 1);
		assert_eq!(guard.stats().blocked_auto_refreshes, 0);
	}

	#[test]
	fn navigation_cause_while_streaming_is_allowed_without_prompt() {
		let clock = ManualClock::new(0);
		let guard = guard(&clock);
		past_grace(&clock);
		guard.activity().set_streaming(true);

		assert_eq!(
			guard.evaluate_unload(UnloadAttempt::with_cause(Cause::Navigation)),
			Decision::Allow { reason: AllowReason::UserInitiated }
		);
	}

	#[test]
	fn quiet_page_with_recent_click_allows_and_counts() {
		let clock = ManualClock::new(0);
		let guard = guard(&clock);
		past_grace(&clock);
		guard.activity().set_prevent_auto_refresh(false);
		guard.activity().record_interaction();

		assert!(guard.evaluate_unload(UnloadAttempt::default()).is_allow());
		assert_eq!(guard.stats().allowed_refreshes, 1);
	}

	#[test]
	fn protection_alone_blocks_unattended_reload() {
		let clock = ManualClock::new(0);
		let guard = guard(&clock);
		past_grace(&clock);
		assert!(guard.evaluate_unload(UnloadAttempt::default()).is_block());

		guard.activity().set_prevent_auto_refresh(false);
		assert_eq!(guard.evaluate_unload(UnloadAttempt::default()), Decision::Allow { reason: AllowReason::Unprotected });
	}

	#[test]
	fn chat_activity_and_requests_allow() {
		let clock = ManualClock::new(0);
		let guard = guard(&clock);
		past_grace(&clock);
		guard.activity().set_streaming(true);

		guard.activity().set_reading_cached_conversation(true);
		assert_eq!(guard.evaluate_unload(UnloadAttempt::default()), Decision::Allow { reason: AllowReason::ChatActivity });
		guard.activity().set_reading_cached_conversation(false);
		clock.advance(Duration::from_secs(2));

		guard.activity().request_started();
		assert_eq!(guard.evaluate_unload(UnloadAttempt::default()), Decision::Allow { reason: AllowReason::ApiRequest });
	}

	#[test]
	fn reconnection_override_blocks_even_user_gestures() {
		let clock = ManualClock::new(0);
		let guard = guard(&clock);
		past_grace(&clock);
		guard.activity().set_prevent_auto_refresh(false);
		guard.activity().went_offline();
		clock.advance(Duration::from_secs(1));
		guard.activity().came_online();
		clock.advance(Duration::from_secs(1));

		assert_eq!(
			guard.evaluate_unload(UnloadAttempt::with_cause(Cause::UserGesture)),
			Decision::Block { reason: BlockReason::Reconnection }
		);
	}

	#[test]
	fn forced_block_applies_once() {
		let clock = ManualClock::new(0);
		let guard = guard(&clock);
		past_grace(&clock);
		guard.activity().set_prevent_auto_refresh(false);
		guard.force_block_next();

		assert_eq!(guard.evaluate_unload(UnloadAttempt::default()), Decision::Block { reason: BlockReason::Forced });
		assert!(guard.evaluate_unload(UnloadAttempt::default()).is_allow());
	}

	#[test]
	fn controller_change_halts_under_protection() {
		let clock = ManualClock::new(0);
		let guard = guard(&clock);
		assert_eq!(guard.on_controller_change(), Propagation::Halt);
		guard.activity().set_prevent_auto_refresh(false);
		assert_eq!(guard.on_controller_change(), Propagation::Continue);
	}

	#[test]
	fn reload_shortcut_prompts_only_while_busy() {
		let clock = ManualClock::new(0);
		let guard = guard(&clock);
		let asked = Cell::new(0);
		let decline = |_: &str| {
			asked.set(asked.get() + 1);
			false
		};

		assert_eq!(guard.on_reload_shortcut(&KeyChord::new("F5"), &decline), ShortcutVerdict::Proceed);
		assert_eq!(guard.on_reload_shortcut(&KeyChord::new("a").ctrl(), &decline), ShortcutVerdict::Ignored);

		guard.activity().set_modal_showing(true);
		assert_eq!(guard.on_reload_shortcut(&KeyChord::new("r").meta(), &decline), ShortcutVerdict::Cancel);
		assert_eq!(guard.on_reload_shortcut(&KeyChord::new("R").ctrl(), &|_: &str| true), ShortcutVerdict::Proceed);
		assert_eq!(asked.get(), 1);
	}

	#[test]
	fn reset_clears_counters() {
		let clock = ManualClock::new(0);
		let guard = guard(&clock);
		past_grace(&clock);
		guard.activity().set_streaming(true);
		guard.evaluate_unload(UnloadAttempt::default());

		guard.reset();
		assert_eq!(guard.stats(), RefreshStats::default());
		assert!(!guard.status().activity.streaming);
	}
}
