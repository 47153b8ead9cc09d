//! Cached conversation snapshot owned by the relay.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A relay-side snapshot of one conversation.
///
/// Application data is kept verbatim in `payload`; the lifecycle fields are
/// serialized alongside it. `lastUpdated` and `isActive` are always stamped
/// by the relay, while `isComplete` and `completedAt` may also be set by the
/// caller:
///
/// ```json
/// {
///   "messages": [{"role": "user", "content": "hi"}],
///   "appType": "destiny",
///   "userId": "u-1",
///   "lastUpdated": 1718000000000,
///   "isActive": true,
///   "isComplete": false
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
	/// Epoch milliseconds of the latest mutation.
	pub last_updated: u64,
	#[serde(default)]
	pub is_active: bool,
	#[serde(default)]
	pub is_complete: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub completed_at: Option<u64>,
	/// Application fields (conversation messages, app-type tag, user id, ...).
	#[serde(flatten)]
	pub payload: Map<String, Value>,
}

impl Session {
	/// Builds a freshly registered, active session.
	///
	/// `messages` defaults to an empty list so readers can always index it.
	pub fn new(payload: Map<String, Value>, now: u64) -> Self {
		let mut session = Self {
			last_updated: now,
			is_active: true,
			is_complete: false,
			completed_at: None,
			payload: Map::new(),
		};
		session.merge(payload);
		session.last_updated = now;
		session.is_active = true;
		session.payload.entry("messages").or_insert_with(|| Value::Array(Vec::new()));
		session
	}

	/// Shallow-merges `fields` over the session.
	///
	/// Top-level keys overwrite. Keys naming a lifecycle field set that field
	/// instead of the payload; `lastUpdated` is left to the caller to stamp.
	pub fn merge(&mut self, fields: Map<String, Value>) {
		for (key, value) in fields {
			match key.as_str() {
				"lastUpdated" => {}
				"isActive" => self.is_active = truthy(&value),
				"isComplete" => self.is_complete = truthy(&value),
				"completedAt" => self.completed_at = value.as_u64(),
				_ => {
					self.payload.insert(key, value);
				}
			}
		}
	}

	/// Conversation messages carried in the payload.
	pub fn messages(&self) -> &[Value] {
		self.payload.get("messages").and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default()
	}

	/// Logical user the session belongs to, if the payload names one.
	pub fn user_id(&self) -> Option<&str> {
		self.payload.get("userId").and_then(Value::as_str)
	}

	/// Milliseconds elapsed since the last mutation.
	pub fn idle_for(&self, now: u64) -> u64 {
		now.saturating_sub(self.last_updated)
	}
}

fn truthy(value: &Value) -> bool {
	match value {
		Value::Null => false,
		Value::Bool(flag) => *flag,
		Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
		Value::String(s) => !s.is_empty(),
		Value::Array(_) | Value::Object(_) => true,
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn payload(value: Value) -> Map<String, Value> {
		match value {
			Value::Object(map) => map,
			_ => panic!("payload must be an object"),
		}
	}

	#[test]
	fn new_session_stamps_relay_fields_and_defaults_messages() {
		let session = Session::new(payload(json!({"userId": "u-1", "isActive": false, "lastUpdated": 1})), 42);

		assert_eq!(session.last_updated, 42);
		assert!(session.is_active);
		assert!(!session.is_complete);
		assert!(session.messages().is_empty());
		assert_eq!(session.user_id(), Some("u-1"));
		assert!(!session.payload.contains_key("lastUpdated"));
		assert!(!session.payload.contains_key("isActive"));
	}

	#[test]
	fn caller_fields_survive_the_wire() {
		let sent = json!({"sessionId": "conv-9", "title": "t", "isComplete": true, "completedAt": 5});
		let session = Session::new(payload(sent.clone()), 42);
		assert!(session.is_complete);
		assert_eq!(session.completed_at, Some(5));

		let wire = serde_json::to_value(&session).unwrap();
		for (key, value) in sent.as_object().unwrap() {
			assert_eq!(&wire[key], value, "{key}");
		}
		let parsed: Session = serde_json::from_value(wire).unwrap();
		assert_eq!(parsed, session);
	}

	#[test]
	fn merge_overwrites_lifecycle_and_payload() {
		let mut session = Session::new(payload(json!({"sessionId": "a"})), 1);
		session.merge(payload(json!({"completedAt": 9, "isComplete": true, "sessionId": "b", "lastUpdated": 0})));

		assert!(session.is_complete);
		assert_eq!(session.completed_at, Some(9));
		assert_eq!(session.payload["sessionId"], "b");
		assert_eq!(session.last_updated, 1);

		session.merge(payload(json!({"completedAt": null, "isComplete": false})));
		assert!(!session.is_complete);
		assert_eq!(session.completed_at, None);
	}

	#[test]
	fn serializes_lifecycle_next_to_payload() {
		let session = Session::new(payload(json!({"appType": "destiny", "messages": [{"role": "user"}]})), 7);
		let wire = serde_json::to_value(&session).unwrap();

		assert_eq!(wire["appType"], "destiny");
		assert_eq!(wire["lastUpdated"], 7);
		assert_eq!(wire["isActive"], true);
		assert_eq!(wire["messages"][0]["role"], "user");
		assert!(wire.get("completedAt").is_none());

		let parsed: Session = serde_json::from_value(wire).unwrap();
		assert_eq!(parsed, session);
	}

	#[test]
	fn idle_for_saturates() {
		let session = Session::new(Map::new(), 100);
		assert_eq!(session.idle_for(50), 0);
		assert_eq!(session.idle_for(160), 60);
	}
}
