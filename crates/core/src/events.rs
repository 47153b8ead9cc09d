//! Same-tab notifications for independent listeners.

use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// A state transition other parts of the page may react to.
///
/// Change events fire only when the value actually changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum GuardEvent {
	StreamingChanged { streaming: bool },
	ModalChanged { showing: bool },
	ProtectionChanged { enabled: bool },
	NavigatingChanged { navigating: bool },
	InitializingChanged { initializing: bool },
	NetworkChanged { online: bool },
	RefreshBlocked { blocked_count: u64, timestamp: u64 },
	/// Another tab took over this tab's conversation.
	SessionReplaced { old_session_id: String, new_session_id: String },
	/// The watchdog force-cleared a stalled generation.
	GenerationReset { app_type: Option<String>, idle_ms: u64 },
}

/// Cloneable fan-out of [`GuardEvent`]s; slow subscribers lag, they never block emitters.
#[derive(Debug, Clone)]
pub struct EventBus {
	sender: broadcast::Sender<GuardEvent>,
}

impl EventBus {
	pub fn new() -> Self {
		let (sender, _) = broadcast::channel(EVENT_CAPACITY);
		Self { sender }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<GuardEvent> {
		self.sender.subscribe()
	}

	pub fn emit(&self, event: GuardEvent) {
		// No subscribers is fine.
		let _ = self.sender.send(event);
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn subscribers_see_events_emitted_after_subscribing() {
		let bus = EventBus::new();
		bus.emit(GuardEvent::ModalChanged { showing: true });

		let mut rx = bus.subscribe();
		bus.emit(GuardEvent::StreamingChanged { streaming: true });
		assert_eq!(rx.try_recv().unwrap(), GuardEvent::StreamingChanged { streaming: true });
		assert!(rx.try_recv().is_err());
	}

	#[test]
	fn events_serialize_with_tag() {
		let json = serde_json::to_value(GuardEvent::RefreshBlocked {
			blocked_count: 2,
			timestamp: 9,
		})
		.unwrap();
		assert_eq!(json, serde_json::json!({"event": "refreshBlocked", "blockedCount": 2, "timestamp": 9}));
	}
}
