//! Message shapes posted between tabs and the relay.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::Session;

/// Message posted by a tab to the relay.
///
/// Format matches the relay's message table:
/// ```json
/// { "type": "REGISTER_SESSION", "sessionId": "c-42", "data": { "messages": [] } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum PageMessage {
	RegisterSession { session_id: String, data: Value },
	UpdateSession { session_id: String, data: Value },
	/// Requires an ephemeral reply channel; dropped without one.
	GetSession { session_id: String },
	CompleteSession { session_id: String },
	ClearSession { session_id: String },
	/// Rebroadcast verbatim to every connected tab, sender included.
	SessionReplaced { old_session_id: String, new_session_id: String },
	StreamingState { streaming: bool },
	ModalState { modal_showing: bool },
	AutoRefreshProtection { prevent_auto_refresh: bool },
	/// Send-and-forget diagnostics; acknowledged only if a reply channel exists.
	#[serde(rename = "beacon-report", alias = "beacon-report-mes")]
	BeaconReport {
		#[serde(default)]
		payload: Value,
	},
}

impl PageMessage {
	/// Wire `type` tag, for log fields.
	pub fn kind(&self) -> &'static str {
		match self {
			PageMessage::RegisterSession { .. } => "REGISTER_SESSION",
			PageMessage::UpdateSession { .. } => "UPDATE_SESSION",
			PageMessage::GetSession { .. } => "GET_SESSION",
			PageMessage::CompleteSession { .. } => "COMPLETE_SESSION",
			PageMessage::ClearSession { .. } => "CLEAR_SESSION",
			PageMessage::SessionReplaced { .. } => "SESSION_REPLACED",
			PageMessage::StreamingState { .. } => "STREAMING_STATE",
			PageMessage::ModalState { .. } => "MODAL_STATE",
			PageMessage::AutoRefreshProtection { .. } => "AUTO_REFRESH_PROTECTION",
			PageMessage::BeaconReport { .. } => "beacon-report",
		}
	}
}

/// Lifecycle transition named in a [`WorkerMessage::SessionUpdate`] broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionAction {
	Registered,
	Updated,
	Completed,
	Cleared,
}

impl std::fmt::Display for SessionAction {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			SessionAction::Registered => write!(f, "registered"),
			SessionAction::Updated => write!(f, "updated"),
			SessionAction::Completed => write!(f, "completed"),
			SessionAction::Cleared => write!(f, "cleared"),
		}
	}
}

/// Notification broadcast by the relay to every connected tab.
///
/// Broadcasts are unordered and carry no state; receivers re-fetch with
/// `GET_SESSION` rather than trusting delivery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
	SessionUpdate { session_id: String, action: SessionAction },
	SessionReplaced { old_session_id: String, new_session_id: String },
}

/// Answer to `GET_SESSION`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReply {
	pub session_id: String,
	pub exists: bool,
	pub session: Option<Session>,
}

/// Failure report sent on a reply channel when handling a message failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
	pub error: bool,
	pub message: String,
}

/// Point-to-point answer delivered on an ephemeral reply channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
	Session(SessionReply),
	BeaconAck { received: bool },
	Error(ErrorReply),
}
