//! Page-side proxy to the session relay.
//!
//! [`SessionClient`] hides the message transport behind typed calls. Every
//! call degrades to a neutral value (`false` or `None`) when no relay controls
//! the page; the page keeps working without cross-tab continuity.
//!
//! # Multi-open
//!
//! The client binds each logical user to one live session id. Registering a
//! different id for a bound user clears the old session and, after a short
//! delay so the clear lands first, announces `SESSION_REPLACED` to every tab.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tabguard_protocol::{PageMessage, Reply, Session, WorkerMessage};
use tabguard_relay::{Clock, RelaySender};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::clone::sanitize;
use crate::config::GuardConfig;
use crate::error::Result;
use crate::events::{EventBus, GuardEvent};

const ANONYMOUS_USER: &str = "anonymous";

/// The message channel from a tab to its controlling relay.
pub trait RelayTransport: Send + Sync {
	/// Whether a relay currently controls the page.
	fn is_controlled(&self) -> bool;

	/// Posts `message`, optionally with an ephemeral reply channel.
	fn post(&self, message: PageMessage, reply: Option<oneshot::Sender<Reply>>) -> Result<()>;
}

impl RelayTransport for RelaySender {
	fn is_controlled(&self) -> bool {
		self.is_connected()
	}

	fn post(&self, message: PageMessage, reply: Option<oneshot::Sender<Reply>>) -> Result<()> {
		match reply {
			Some(reply) => self.post_with_reply(message, reply)?,
			None => RelaySender::post(self, message)?,
		}
		Ok(())
	}
}

/// Callback invoked with every broadcast naming a session id.
pub type SessionListener = Arc<dyn Fn(&WorkerMessage) + Send + Sync>;

/// Handle for removing one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct SessionClient {
	transport: Option<Arc<dyn RelayTransport>>,
	clock: Arc<dyn Clock>,
	events: EventBus,
	bindings: Mutex<HashMap<String, String>>,
	listeners: Mutex<HashMap<String, Vec<(ListenerId, SessionListener)>>>,
	next_listener: AtomicU64,
	get_timeout: Duration,
	replace_delay: Duration,
}

impl SessionClient {
	pub fn new(transport: Option<Arc<dyn RelayTransport>>, clock: Arc<dyn Clock>, events: EventBus, config: &GuardConfig) -> Self {
		Self {
			transport,
			clock,
			events,
			bindings: Mutex::new(HashMap::new()),
			listeners: Mutex::new(HashMap::new()),
			next_listener: AtomicU64::new(1),
			get_timeout: config.get_session_timeout,
			replace_delay: config.replace_notice_delay,
		}
	}

	/// Whether a relay currently controls the page.
	pub fn is_available(&self) -> bool {
		self.controller().is_some()
	}

	fn controller(&self) -> Option<&Arc<dyn RelayTransport>> {
		self.transport.as_ref().filter(|t| t.is_controlled())
	}

	fn send(&self, op: &'static str, message: PageMessage) -> bool {
		let Some(transport) = self.controller() else {
			debug!(target = "tabguard.client", op, "no relay controls this page");
			return false;
		};
		match transport.post(message, None) {
			Ok(()) => true,
			Err(err) => {
				warn!(target = "tabguard.client", op, error = %err, "relay post failed");
				false
			}
		}
	}

	/// Registers `payload` under `id`, resolving multi-open for its user.
	pub fn register_session<T: Serialize + ?Sized>(&self, id: &str, payload: &T) -> bool {
		if id.is_empty() || !self.is_available() {
			return false;
		}
		let data = sanitize(payload);
		let user = user_key(&data);

		let previous = self.bindings.lock().get(&user).cloned();
		if let Some(old) = previous.filter(|old| old != id) {
			info!(target = "tabguard.client", user = %user, old_session_id = %old, new_session_id = %id, "session replaced by newer registration");
			self.clear_session(&old);
			self.announce_replacement(old, id.to_string());
		}
		self.bindings.lock().insert(user, id.to_string());

		self.send(
			"register",
			PageMessage::RegisterSession {
				session_id: id.to_string(),
				data,
			},
		)
	}

	fn announce_replacement(&self, old_session_id: String, new_session_id: String) {
		let Some(transport) = self.controller().cloned() else {
			return;
		};
		let message = PageMessage::SessionReplaced {
			old_session_id,
			new_session_id,
		};
		match tokio::runtime::Handle::try_current() {
			Ok(runtime) => {
				let delay = self.replace_delay;
				runtime.spawn(async move {
					tokio::time::sleep(delay).await;
					if let Err(err) = transport.post(message, None) {
						warn!(target = "tabguard.client", error = %err, "replacement notice not delivered");
					}
				});
			}
			Err(_) => {
				if let Err(err) = transport.post(message, None) {
					warn!(target = "tabguard.client", error = %err, "replacement notice not delivered");
				}
			}
		}
	}

	/// Shallow-merges `partial` into the relay's copy of `id`.
	pub fn update_session<T: Serialize + ?Sized>(&self, id: &str, partial: &T) -> bool {
		if id.is_empty() {
			return false;
		}
		self.send(
			"update",
			PageMessage::UpdateSession {
				session_id: id.to_string(),
				data: sanitize(partial),
			},
		)
	}

	/// Fetches the cached session; `None` means "no cached state".
	///
	/// Resolves within the configured timeout even if the relay never answers.
	pub async fn get_session(&self, id: &str) -> Option<Session> {
		if id.is_empty() {
			return None;
		}
		let transport = self.controller()?;
		let (tx, rx) = oneshot::channel();
		if let Err(err) = transport.post(PageMessage::GetSession { session_id: id.to_string() }, Some(tx)) {
			warn!(target = "tabguard.client", session_id = %id, error = %err, "GET_SESSION post failed");
			return None;
		}

		match tokio::time::timeout(self.get_timeout, rx).await {
			Ok(Ok(Reply::Session(reply))) => reply.session.filter(|_| reply.exists),
			Ok(Ok(other)) => {
				warn!(target = "tabguard.client", session_id = %id, reply = ?other, "unexpected GET_SESSION reply");
				None
			}
			Ok(Err(_)) => {
				debug!(target = "tabguard.client", session_id = %id, "relay dropped GET_SESSION reply");
				None
			}
			Err(_) => {
				warn!(target = "tabguard.client", session_id = %id, timeout_ms = self.get_timeout.as_millis() as u64, "GET_SESSION timed out");
				None
			}
		}
	}

	/// Reopens a completed session so new messages can be appended.
	pub async fn continue_session(&self, id: &str) -> bool {
		if self.get_session(id).await.is_none() {
			return false;
		}
		info!(target = "tabguard.client", session_id = %id, "continuing completed session");
		self.update_session(id, &json!({"isComplete": false, "lastResumed": self.clock.now_ms()}))
	}

	pub fn complete_session(&self, id: &str) -> bool {
		if id.is_empty() {
			return false;
		}
		self.send("complete", PageMessage::CompleteSession { session_id: id.to_string() })
	}

	/// Removes the session from the relay and drops any user binding to it.
	pub fn clear_session(&self, id: &str) -> bool {
		if id.is_empty() || !self.is_available() {
			return false;
		}
		self.bindings.lock().retain(|user, bound| {
			let keep = bound != id;
			if !keep {
				debug!(target = "tabguard.client", user = %user, session_id = %id, "user binding removed");
			}
			keep
		});
		self.send("clear", PageMessage::ClearSession { session_id: id.to_string() })
	}

	/// Session id currently bound to `user`.
	pub fn bound_session(&self, user: &str) -> Option<String> {
		self.bindings.lock().get(user).cloned()
	}

	/// Posts a diagnostic beacon; returns whether the relay acknowledged it.
	pub async fn send_beacon<T: Serialize + ?Sized>(&self, payload: &T) -> bool {
		let Some(transport) = self.controller() else {
			return false;
		};
		let (tx, rx) = oneshot::channel();
		let message = PageMessage::BeaconReport { payload: sanitize(payload) };
		if let Err(err) = transport.post(message, Some(tx)) {
			debug!(target = "tabguard.client", error = %err, "beacon post failed");
			return false;
		}
		matches!(tokio::time::timeout(self.get_timeout, rx).await, Ok(Ok(Reply::BeaconAck { received: true })))
	}

	pub fn add_listener(&self, id: &str, listener: impl Fn(&WorkerMessage) + Send + Sync + 'static) -> Option<ListenerId> {
		if id.is_empty() {
			return None;
		}
		let listener_id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
		self.listeners.lock().entry(id.to_string()).or_default().push((listener_id, Arc::new(listener)));
		Some(listener_id)
	}

	pub fn remove_listener(&self, id: &str, listener: ListenerId) -> bool {
		let mut listeners = self.listeners.lock();
		let Some(registered) = listeners.get_mut(id) else {
			return false;
		};
		let before = registered.len();
		registered.retain(|(lid, _)| *lid != listener);
		let removed = registered.len() != before;
		if registered.is_empty() {
			listeners.remove(id);
		}
		removed
	}

	pub fn remove_all_listeners(&self, id: &str) {
		self.listeners.lock().remove(id);
	}

	pub fn listener_count(&self, id: &str) -> usize {
		self.listeners.lock().get(id).map_or(0, Vec::len)
	}

	/// Handles one broadcast from the relay.
	///
	/// A panicking listener is contained and logged; the rest still run.
	pub fn dispatch(&self, message: &WorkerMessage) {
		match message {
			WorkerMessage::SessionUpdate { session_id, action } => {
				let listeners: Vec<SessionListener> = self
					.listeners
					.lock()
					.get(session_id)
					.map(|registered| registered.iter().map(|(_, l)| Arc::clone(l)).collect())
					.unwrap_or_default();
				debug!(target = "tabguard.client", session_id = %session_id, action = %action, listeners = listeners.len(), "session update");
				for listener in listeners {
					if catch_unwind(AssertUnwindSafe(|| listener(message))).is_err() {
						warn!(target = "tabguard.client", session_id = %session_id, "session listener panicked");
					}
				}
			}
			WorkerMessage::SessionReplaced {
				old_session_id,
				new_session_id,
			} => {
				warn!(target = "tabguard.client", old_session_id = %old_session_id, new_session_id = %new_session_id, "session replaced by another tab");
				self.events.emit(GuardEvent::SessionReplaced {
					old_session_id: old_session_id.clone(),
					new_session_id: new_session_id.clone(),
				});
			}
		}
	}

	/// Dispatches broadcasts until the relay closes the channel.
	pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<WorkerMessage>) {
		while let Some(message) = events.recv().await {
			self.dispatch(&message);
		}
		debug!(target = "tabguard.client", "relay broadcast channel closed");
	}
}

/// Binding key for the payload's `userId`; falsy or missing ids share the
/// anonymous binding.
fn user_key(data: &Value) -> String {
	match data.get("userId") {
		None | Some(Value::Null) | Some(Value::Bool(false)) => ANONYMOUS_USER.to_string(),
		Some(Value::String(s)) if s.is_empty() => ANONYMOUS_USER.to_string(),
		Some(Value::Number(n)) if n.as_f64() == Some(0.0) => ANONYMOUS_USER.to_string(),
		Some(Value::String(s)) => s.clone(),
		Some(other) => other.to_string(),
	}
}

impl std::fmt::Debug for SessionClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionClient")
			.field("available", &self.is_available())
			.field("bindings", &*self.bindings.lock())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicBool;

	use tabguard_relay::ManualClock;

	use super::*;

	/// Records posts and never answers.
	#[derive(Default)]
	struct SilentTransport {
		controlled: AtomicBool,
		posted: Mutex<Vec<PageMessage>>,
		pending: Mutex<Vec<oneshot::Sender<Reply>>>,
	}

	impl SilentTransport {
		fn controlled() -> Arc<Self> {
			let transport = Self::default();
			transport.controlled.store(true, Ordering::SeqCst);
			Arc::new(transport)
		}

		fn kinds(&self) -> Vec<&'static str> {
			self.posted.lock().iter().map(PageMessage::kind).collect()
		}
	}

	impl RelayTransport for SilentTransport {
		fn is_controlled(&self) -> bool {
			self.controlled.load(Ordering::SeqCst)
		}

		fn post(&self, message: PageMessage, reply: Option<oneshot::Sender<Reply>>) -> Result<()> {
			self.posted.lock().push(message);
			if let Some(reply) = reply {
				self.pending.lock().push(reply);
			}
			Ok(())
		}
	}

	fn client(transport: Option<Arc<SilentTransport>>) -> SessionClient {
		let transport = transport.map(|t| t as Arc<dyn RelayTransport>);
		SessionClient::new(transport, Arc::new(ManualClock::new(0)), EventBus::new(), &GuardConfig::default())
	}

	#[tokio::test]
	async fn without_transport_everything_is_neutral() {
		let client = client(None);
		assert!(!client.register_session("s", &json!({})));
		assert!(!client.update_session("s", &json!({})));
		assert!(!client.complete_session("s"));
		assert!(!client.clear_session("s"));
		assert!(client.get_session("s").await.is_none());
		assert!(!client.continue_session("s").await);
		assert!(!client.send_beacon(&json!({})).await);
	}

	#[tokio::test]
	async fn uncontrolled_transport_is_treated_as_absent() {
		let transport = Arc::new(SilentTransport::default());
		let client = client(Some(transport.clone()));
		assert!(!client.register_session("s", &json!({})));
		assert!(transport.posted.lock().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn get_session_times_out_to_none() {
		let transport = SilentTransport::controlled();
		let client = client(Some(transport.clone()));

		let started = tokio::time::Instant::now();
		assert!(client.get_session("ghost").await.is_none());
		assert!(started.elapsed() >= Duration::from_secs(3));
		assert!(started.elapsed() < Duration::from_secs(4));
		assert_eq!(transport.kinds(), vec!["GET_SESSION"]);
	}

	#[test]
	fn second_session_for_same_user_clears_first_outside_runtime() {
		let transport = SilentTransport::controlled();
		let client = client(Some(transport.clone()));

		assert!(client.register_session("a", &json!({"userId": "u"})));
		assert!(client.register_session("b", &json!({"userId": "u"})));

		assert_eq!(client.bound_session("u").as_deref(), Some("b"));
		assert_eq!(transport.kinds(), vec!["REGISTER_SESSION", "CLEAR_SESSION", "SESSION_REPLACED", "REGISTER_SESSION"]);
	}

	#[tokio::test(start_paused = true)]
	async fn replacement_notice_is_delayed_inside_runtime() {
		let transport = SilentTransport::controlled();
		let client = client(Some(transport.clone()));

		client.register_session("a", &json!({}));
		client.register_session("b", &json!({}));
		assert_eq!(client.bound_session(ANONYMOUS_USER).as_deref(), Some("b"));
		assert_eq!(transport.kinds(), vec!["REGISTER_SESSION", "CLEAR_SESSION", "REGISTER_SESSION"]);

		tokio::time::sleep(Duration::from_millis(150)).await;
		assert_eq!(transport.kinds().last(), Some(&"SESSION_REPLACED"));
	}

	#[test]
	fn re_registering_same_id_does_not_replace() {
		let transport = SilentTransport::controlled();
		let client = client(Some(transport.clone()));
		client.register_session("a", &json!({"userId": "u"}));
		client.register_session("a", &json!({"userId": "u"}));
		assert_eq!(transport.kinds(), vec!["REGISTER_SESSION", "REGISTER_SESSION"]);
	}

	#[test]
	fn numeric_user_ids_bind_separately() {
		let transport = SilentTransport::controlled();
		let client = client(Some(transport.clone()));

		assert!(client.register_session("s-user1", &json!({"userId": 1})));
		assert!(client.register_session("s-user2", &json!({"userId": 2})));

		assert_eq!(transport.kinds(), vec!["REGISTER_SESSION", "REGISTER_SESSION"]);
		assert_eq!(client.bound_session("1").as_deref(), Some("s-user1"));
		assert_eq!(client.bound_session("2").as_deref(), Some("s-user2"));
		assert_eq!(client.bound_session(ANONYMOUS_USER), None);
	}

	#[test]
	fn falsy_user_ids_fall_back_to_anonymous() {
		for data in [json!({}), json!({"userId": null}), json!({"userId": ""}), json!({"userId": 0})] {
			assert_eq!(user_key(&data), ANONYMOUS_USER);
		}
		assert_eq!(user_key(&json!({"userId": "u-1"})), "u-1");
		assert_eq!(user_key(&json!({"userId": 42})), "42");
	}

	#[test]
	fn clear_drops_user_binding() {
		let transport = SilentTransport::controlled();
		let client = client(Some(transport));
		client.register_session("a", &json!({"userId": "u"}));
		assert!(client.clear_session("a"));
		assert_eq!(client.bound_session("u"), None);
	}

	#[test]
	fn listeners_receive_updates_for_their_id_only() {
		let client = client(None);
		let hits = Arc::new(AtomicU64::new(0));
		let counter = hits.clone();
		let id = client
			.add_listener("s1", move |_| {
				counter.fetch_add(1, Ordering::SeqCst);
			})
			.unwrap();
		client.add_listener("s1", |_| panic!("listener bug")).unwrap();

		let update = |sid: &str| WorkerMessage::SessionUpdate {
			session_id: sid.into(),
			action: tabguard_protocol::SessionAction::Updated,
		};
		client.dispatch(&update("s1"));
		client.dispatch(&update("s2"));
		assert_eq!(hits.load(Ordering::SeqCst), 1);

		assert!(client.remove_listener("s1", id));
		assert!(!client.remove_listener("s1", id));
		assert_eq!(client.listener_count("s1"), 1);
		client.remove_all_listeners("s1");
		assert_eq!(client.listener_count("s1"), 0);
		assert_eq!(client.add_listener("", |_| {}), None);
	}

	#[test]
	fn replaced_broadcast_reaches_event_bus() {
		let client = client(None);
		let mut rx = client.events.subscribe();
		client.dispatch(&WorkerMessage::SessionReplaced {
			old_session_id: "a".into(),
			new_session_id: "b".into(),
		});
		assert_eq!(
			rx.try_recv().unwrap(),
			GuardEvent::SessionReplaced {
				old_session_id: "a".into(),
				new_session_id: "b".into()
			}
		);
	}
}
