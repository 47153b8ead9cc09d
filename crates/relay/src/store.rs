//! Authoritative mapping from session id to cached conversation state.
//!
//! The store is plain data owned by the relay actor; every mutating operation
//! returns the [`SessionAction`] the relay should broadcast, or `None` when the
//! call was a no-op.

use std::collections::HashMap;

use serde_json::Value;
use tabguard_protocol::{Session, SessionAction};
use tracing::debug;

/// In-memory session table.
#[derive(Debug, Default)]
pub struct SessionStore {
	sessions: HashMap<String, Session>,
}

impl SessionStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts or overwrites `id`, marking it active.
	///
	/// Empty ids and non-object payloads are ignored.
	pub fn register(&mut self, id: &str, data: Value, now: u64) -> Option<SessionAction> {
		if id.is_empty() {
			return None;
		}
		let Value::Object(payload) = data else {
			debug!(target = "tabguard.relay", session_id = %id, "register ignored: payload is not an object");
			return None;
		};
		self.sessions.insert(id.to_string(), Session::new(payload, now));
		debug!(target = "tabguard.relay", session_id = %id, "session registered");
		Some(SessionAction::Registered)
	}

	/// Shallow-merges `partial` into an existing session.
	///
	/// Top-level keys overwrite, the rest of the payload is retained.
	/// Lifecycle keys update the lifecycle fields; `lastUpdated` is always
	/// restamped.
	pub fn update(&mut self, id: &str, partial: Value, now: u64) -> Option<SessionAction> {
		let session = self.sessions.get_mut(id)?;
		if let Value::Object(fields) = partial {
			session.merge(fields);
		}
		session.last_updated = now;
		debug!(target = "tabguard.relay", session_id = %id, "session updated");
		Some(SessionAction::Updated)
	}

	pub fn get(&self, id: &str) -> Option<&Session> {
		self.sessions.get(id)
	}

	/// Marks a session complete. Payload and messages are kept so the
	/// conversation stays inspectable.
	pub fn complete(&mut self, id: &str, now: u64) -> Option<SessionAction> {
		let session = self.sessions.get_mut(id)?;
		session.is_complete = true;
		session.completed_at = Some(now);
		session.last_updated = now;
		debug!(target = "tabguard.relay", session_id = %id, "session completed, state retained");
		Some(SessionAction::Completed)
	}

	/// Removes a session entirely.
	pub fn clear(&mut self, id: &str) -> Option<SessionAction> {
		self.sessions.remove(id)?;
		debug!(target = "tabguard.relay", session_id = %id, "session cleared");
		Some(SessionAction::Cleared)
	}

	/// Evicts every session idle for longer than `ttl_ms`; returns the evicted ids.
	pub fn sweep(&mut self, now: u64, ttl_ms: u64) -> Vec<String> {
		let stale: Vec<String> = self
			.sessions
			.iter()
			.filter(|(_, session)| session.idle_for(now) > ttl_ms)
			.map(|(id, _)| id.clone())
			.collect();
		for id in &stale {
			self.sessions.remove(id);
			debug!(target = "tabguard.relay", session_id = %id, "session evicted after inactivity");
		}
		stale
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}

}
