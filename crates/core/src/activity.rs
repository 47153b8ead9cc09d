//! Volatile per-tab activity state.
//!
//! The page reports what it is doing through the setters and passive signals
//! here; the decision engine reads an [`ActivitySnapshot`] synchronously.
//! Navigation and chat flags are [`Lease`]s, so a caller that never clears
//! them cannot wedge the guard open past the grace window.
//!
//! Streaming, modal and protection transitions are mirrored to the relay so
//! it can defer its own activation while a reply is arriving.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tabguard_protocol::PageMessage;
use tabguard_relay::Clock;
use tabguard_relay::clock::millis;
use tracing::{debug, info, warn};

use crate::client::RelayTransport;
use crate::config::GuardConfig;
use crate::events::{EventBus, GuardEvent};
use crate::lease::Lease;
use crate::storage::{KeyValueStore, PREVENT_AUTO_REFRESH_KEY};

/// Which history mechanism reported a navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HistoryChange {
	/// Back/forward.
	PopState,
	PushState,
	ReplaceState,
	/// An application router transition.
	Router,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkEventKind {
	Offline,
	Online,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkEvent {
	#[serde(rename = "type")]
	pub kind: NetworkEventKind,
	pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestError {
	#[serde(rename = "type")]
	pub kind: String,
	pub time: u64,
	pub error: String,
}

/// Connectivity history; the two rings keep the newest entries only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
	pub is_online: bool,
	pub last_offline_time: u64,
	pub last_online_time: u64,
	pub reconnection_attempts: u32,
	pub recent_events: VecDeque<NetworkEvent>,
	pub recent_errors: VecDeque<RequestError>,
}

impl NetworkState {
	fn new(now: u64) -> Self {
		Self {
			is_online: true,
			last_offline_time: 0,
			last_online_time: now,
			reconnection_attempts: 0,
			recent_events: VecDeque::new(),
			recent_errors: VecDeque::new(),
		}
	}
}

fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, capacity: usize) {
	ring.push_back(item);
	while ring.len() > capacity {
		ring.pop_front();
	}
}

/// Everything the decision engine needs, evaluated at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySnapshot {
	pub now: u64,
	pub streaming: bool,
	pub modal_showing: bool,
	pub prevent_auto_refresh: bool,
	pub navigating: bool,
	pub initializing_page: bool,
	pub loading_messages: bool,
	pub changing_conversation: bool,
	pub reading_cached_conversation: bool,
	/// Inside the grace window after a load or route change.
	pub within_initial_load: bool,
	pub ms_since_load: u64,
	/// A request is active or finished within the recent-request window.
	pub request_in_flight: bool,
	pub active_requests: u32,
	/// Navigation or initialization held within the user-intent window.
	pub recent_navigation: bool,
	/// A chat-activity change within the user-intent window.
	pub recent_chat_activity: bool,
	/// A genuine input event within the user-intent window.
	pub recent_interaction: bool,
	pub reconnection_override: bool,
	pub force_block_next: bool,
	pub online: bool,
	pub visible: bool,
}

impl ActivitySnapshot {
	pub fn chat_active(&self) -> bool {
		self.loading_messages || self.changing_conversation || self.reading_cached_conversation
	}

	/// Whether a user-initiated refresh should be confirmed.
	pub fn should_prompt(&self) -> bool {
		self.streaming || self.modal_showing
	}
}

#[derive(Debug)]
struct ActivityState {
	streaming: bool,
	modal_showing: bool,
	prevent_auto_refresh: bool,
	navigating: Lease,
	initializing_page: Lease,
	loading_messages: Lease,
	changing_conversation: Lease,
	reading_cached_conversation: Lease,
	chat_last_activity: Option<u64>,
	load_timestamp: u64,
	last_interaction: Option<u64>,
	active_requests: u32,
	last_request_activity: Option<u64>,
	network: NetworkState,
	reconnection_override: Lease,
	force_block_next: bool,
	visible: bool,
}

/// Per-tab activity state; share it behind an `Arc`.
pub struct ActivityTracker {
	state: Mutex<ActivityState>,
	config: Arc<GuardConfig>,
	clock: Arc<dyn Clock>,
	events: EventBus,
	store: Arc<dyn KeyValueStore>,
	relay: Option<Arc<dyn RelayTransport>>,
}

impl ActivityTracker {
	pub fn new(
		config: Arc<GuardConfig>,
		clock: Arc<dyn Clock>,
		events: EventBus,
		store: Arc<dyn KeyValueStore>,
		relay: Option<Arc<dyn RelayTransport>>,
	) -> Self {
		let now = clock.now_ms();
		let state = ActivityState {
			streaming: false,
			modal_showing: false,
			prevent_auto_refresh: config.prevent_auto_refresh_default,
			navigating: Lease::default(),
			initializing_page: Lease::default(),
			loading_messages: Lease::default(),
			changing_conversation: Lease::default(),
			reading_cached_conversation: Lease::default(),
			chat_last_activity: None,
			load_timestamp: now,
			last_interaction: None,
			active_requests: 0,
			last_request_activity: None,
			network: NetworkState::new(now),
			reconnection_override: Lease::default(),
			force_block_next: false,
			visible: true,
		};
		Self {
			state: Mutex::new(state),
			config,
			clock,
			events,
			store,
			relay,
		}
	}

	pub fn config(&self) -> &GuardConfig {
		&self.config
	}

	pub fn events(&self) -> &EventBus {
		&self.events
	}

	fn now(&self) -> u64 {
		self.clock.now_ms()
	}

	fn mirror(&self, message: PageMessage) {
		let Some(relay) = self.relay.as_ref().filter(|r| r.is_controlled()) else {
			return;
		};
		let kind = message.kind();
		if let Err(err) = relay.post(message, None) {
			debug!(target = "tabguard.activity", kind, error = %err, "relay mirror failed");
		}
	}

	/// Restores the persisted protection preference.
	pub fn restore_preferences(&self) {
		match self.store.get(PREVENT_AUTO_REFRESH_KEY) {
			Ok(Some(saved)) => {
				let enabled = saved == "true";
				self.state.lock().prevent_auto_refresh = enabled;
				info!(target = "tabguard.activity", enabled, "restored auto-refresh protection preference");
			}
			Ok(None) => {}
			Err(err) => warn!(target = "tabguard.activity", error = %err, "could not read protection preference"),
		}
	}

	pub fn set_streaming(&self, streaming: bool) {
		let changed = {
			let mut state = self.state.lock();
			std::mem::replace(&mut state.streaming, streaming) != streaming
		};
		if changed {
			info!(target = "tabguard.activity", streaming, "streaming state changed");
			self.mirror(PageMessage::StreamingState { streaming });
			self.events.emit(GuardEvent::StreamingChanged { streaming });
		}
	}

	pub fn set_modal_showing(&self, showing: bool) {
		let changed = {
			let mut state = self.state.lock();
			std::mem::replace(&mut state.modal_showing, showing) != showing
		};
		if changed {
			info!(target = "tabguard.activity", showing, "modal state changed");
			self.mirror(PageMessage::ModalState { modal_showing: showing });
			self.events.emit(GuardEvent::ModalChanged { showing });
		}
	}

	/// Sets and persists the auto-refresh protection preference.
	pub fn set_prevent_auto_refresh(&self, enabled: bool) {
		if let Err(err) = self.store.set(PREVENT_AUTO_REFRESH_KEY, if enabled { "true" } else { "false" }) {
			warn!(target = "tabguard.activity", error = %err, "could not persist protection preference");
		}
		self.apply_protection(enabled);
	}

	fn apply_protection(&self, enabled: bool) {
		let changed = {
			let mut state = self.state.lock();
			std::mem::replace(&mut state.prevent_auto_refresh, enabled) != enabled
		};
		if changed {
			info!(target = "tabguard.activity", enabled, "auto-refresh protection changed");
			self.mirror(PageMessage::AutoRefreshProtection { prevent_auto_refresh: enabled });
			self.events.emit(GuardEvent::ProtectionChanged { enabled });
		}
	}

	/// Marks navigation in progress for the navigation grace window.
	pub fn set_navigating(&self, navigating: bool) {
		self.hold_navigation(navigating, self.config.navigation_grace);
	}

	pub(crate) fn hold_navigation(&self, navigating: bool, window: Duration) {
		let now = self.now();
		let changed = {
			let mut state = self.state.lock();
			let before = state.navigating.is_active(now);
			if navigating {
				state.navigating.grant(now, window);
			} else {
				state.navigating.clear(now);
			}
			before != navigating
		};
		if changed {
			debug!(target = "tabguard.activity", navigating, "navigation state changed");
			self.events.emit(GuardEvent::NavigatingChanged { navigating });
		}
	}

	pub fn set_initializing_page(&self, initializing: bool) {
		let now = self.now();
		let changed = {
			let mut state = self.state.lock();
			let before = state.initializing_page.is_active(now);
			if initializing {
				state.initializing_page.grant(now, self.config.navigation_grace);
			} else {
				state.initializing_page.clear(now);
			}
			before != initializing
		};
		if changed {
			debug!(target = "tabguard.activity", initializing, "page initialization state changed");
			self.events.emit(GuardEvent::InitializingChanged { initializing });
		}
	}

	pub fn set_loading_messages(&self, loading: bool) {
		let window = self.config.loading_messages_lease;
		self.set_chat_flag(|s| &mut s.loading_messages, loading, window, "loading_messages");
	}

	pub fn set_changing_conversation(&self, changing: bool) {
		let window = self.config.chat_activity_lease;
		self.set_chat_flag(|s| &mut s.changing_conversation, changing, window, "changing_conversation");
	}

	pub fn set_reading_cached_conversation(&self, reading: bool) {
		let window = self.config.chat_activity_lease;
		self.set_chat_flag(|s| &mut s.reading_cached_conversation, reading, window, "reading_cached_conversation");
	}

	fn set_chat_flag(&self, flag: fn(&mut ActivityState) -> &mut Lease, value: bool, window: Duration, name: &'static str) {
		let now = self.now();
		let mut state = self.state.lock();
		state.chat_last_activity = Some(now);
		let lease = flag(&mut *state);
		if value {
			lease.grant(now, window);
		} else {
			lease.clear(now);
		}
		debug!(target = "tabguard.activity", flag = name, value, "chat activity");
	}

	/// Records a genuine input event (click, touch, key, input).
	pub fn record_interaction(&self) {
		let now = self.now();
		self.state.lock().last_interaction = Some(now);
	}

	/// A history change: marks navigation and restarts the page-load grace.
	pub fn navigation_detected(&self, change: HistoryChange) {
		let window = match change {
			HistoryChange::PopState => self.config.navigation_grace,
			HistoryChange::PushState | HistoryChange::ReplaceState | HistoryChange::Router => self.config.router_navigation_grace,
		};
		self.restart_load_grace();
		self.hold_navigation(true, window);
		debug!(target = "tabguard.activity", change = ?change, "navigation detected");
	}

	/// Restarts the initial-load grace window from now.
	pub fn restart_load_grace(&self) {
		let now = self.now();
		self.state.lock().load_timestamp = now;
	}

	pub fn dom_content_loaded(&self) {
		self.restart_load_grace();
		self.set_initializing_page(true);
	}

	pub fn page_loaded(&self) {
		self.restart_load_grace();
	}

	/// Going offline forces protection on (not persisted).
	pub fn went_offline(&self) {
		let now = self.now();
		{
			let mut state = self.state.lock();
			let capacity = self.config.network_ring_capacity;
			state.network.is_online = false;
			state.network.last_offline_time = now;
			push_bounded(
				&mut state.network.recent_events,
				NetworkEvent {
					kind: NetworkEventKind::Offline,
					timestamp: now,
				},
				capacity,
			);
		}
		warn!(target = "tabguard.activity", "network offline, auto-refresh protection forced on");
		self.events.emit(GuardEvent::NetworkChanged { online: false });
		self.apply_protection(true);
	}

	/// Coming online arms the reconnection override.
	pub fn came_online(&self) {
		let now = self.now();
		{
			let mut state = self.state.lock();
			let capacity = self.config.network_ring_capacity;
			state.network.is_online = true;
			state.network.last_online_time = now;
			state.network.reconnection_attempts += 1;
			push_bounded(
				&mut state.network.recent_events,
				NetworkEvent {
					kind: NetworkEventKind::Online,
					timestamp: now,
				},
				capacity,
			);
		}
		info!(target = "tabguard.activity", "network back online");
		self.events.emit(GuardEvent::NetworkChanged { online: true });
		self.arm_reconnection_override();
	}

	fn arm_reconnection_override(&self) {
		let now = self.now();
		self.state.lock().reconnection_override.grant(now, self.config.reconnection_override);
		info!(
			target = "tabguard.activity",
			window_ms = millis(self.config.reconnection_override),
			"reconnection override armed"
		);
	}

	pub fn request_started(&self) {
		let mut state = self.state.lock();
		state.active_requests += 1;
	}

	pub fn request_finished(&self) {
		let now = self.now();
		let mut state = self.state.lock();
		state.active_requests = state.active_requests.saturating_sub(1);
		state.last_request_activity = Some(now);
	}

	/// A request ended in error; also arms the reconnection override.
	pub fn request_failed(&self, kind: &str, error: &str) {
		let now = self.now();
		{
			let mut state = self.state.lock();
			state.active_requests = state.active_requests.saturating_sub(1);
			state.last_request_activity = Some(now);
			let capacity = self.config.network_ring_capacity;
			push_bounded(
				&mut state.network.recent_errors,
				RequestError {
					kind: kind.to_string(),
					time: now,
					error: error.to_string(),
				},
				capacity,
			);
		}
		warn!(target = "tabguard.activity", kind, error, "request failed");
		self.arm_reconnection_override();
	}

	/// Becoming visible right after a network event re-arms the override.
	pub fn visibility_changed(&self, visible: bool) {
		let now = self.now();
		let near_network_event = {
			let mut state = self.state.lock();
			state.visible = visible;
			state
				.network
				.recent_events
				.back()
				.is_some_and(|event| now.saturating_sub(event.timestamp) < millis(self.config.reconnection_override))
		};
		if visible && near_network_event {
			debug!(target = "tabguard.activity", "visible again right after a network event");
			self.arm_reconnection_override();
		}
	}

	/// Forces the next evaluated unload attempt to be blocked.
	pub fn force_block_next(&self) {
		self.state.lock().force_block_next = true;
	}

	pub(crate) fn take_force_block(&self) -> bool {
		std::mem::take(&mut self.state.lock().force_block_next)
	}

	/// Clears the loading-messages flag; used by the generation watchdog.
	pub fn clear_loading(&self) {
		let now = self.now();
		self.state.lock().loading_messages.clear(now);
	}

	/// Clears streaming, modal, chat and navigation state.
	pub fn reset(&self) {
		self.set_streaming(false);
		self.set_modal_showing(false);
		let now = self.now();
		{
			let mut state = self.state.lock();
			state.loading_messages.clear(now);
			state.changing_conversation.clear(now);
			state.reading_cached_conversation.clear(now);
		}
		self.hold_navigation(false, Duration::ZERO);
		warn!(target = "tabguard.activity", "activity state reset");
	}

	/// Protection for events that cannot be user-initiated, such as a
	/// relay taking control of the page.
	pub fn should_prevent_auto_refresh(&self) -> bool {
		let now = self.now();
		let state = self.state.lock();
		state.prevent_auto_refresh || state.reconnection_override.is_active(now)
	}

	pub fn network(&self) -> NetworkState {
		self.state.lock().network.clone()
	}

	pub fn last_interaction(&self) -> Option<u64> {
		self.state.lock().last_interaction
	}

	pub fn last_request_activity(&self) -> Option<u64> {
		self.state.lock().last_request_activity
	}

	pub fn snapshot(&self) -> ActivitySnapshot {
		let now = self.now();
		let config = &self.config;
		let intent = config.user_intent_window;
		let recent = |at: Option<u64>, window: Duration| at.is_some_and(|t| now.saturating_sub(t) < millis(window));

		let state = self.state.lock();
		let ms_since_load = now.saturating_sub(state.load_timestamp);
		ActivitySnapshot {
			now,
			streaming: state.streaming,
			modal_showing: state.modal_showing,
			prevent_auto_refresh: state.prevent_auto_refresh,
			navigating: state.navigating.is_active(now),
			initializing_page: state.initializing_page.is_active(now),
			loading_messages: state.loading_messages.is_active(now),
			changing_conversation: state.changing_conversation.is_active(now),
			reading_cached_conversation: state.reading_cached_conversation.is_active(now),
			within_initial_load: ms_since_load < millis(config.initial_load_grace),
			ms_since_load,
			request_in_flight: state.active_requests > 0 || recent(state.last_request_activity, config.recent_request_window),
			active_requests: state.active_requests,
			recent_navigation: state.navigating.held_within(now, intent) || state.initializing_page.held_within(now, intent),
			recent_chat_activity: recent(state.chat_last_activity, intent),
			recent_interaction: recent(state.last_interaction, intent),
			reconnection_override: state.reconnection_override.is_active(now),
			force_block_next: state.force_block_next,
			online: state.network.is_online,
			visible: state.visible,
		}
	}
}

impl std::fmt::Debug for ActivityTracker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ActivityTracker").field("state", &*self.state.lock()).finish_non_exhaustive()
	}
}
