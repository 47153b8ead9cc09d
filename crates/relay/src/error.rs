//! Relay error types.

use thiserror::Error;

/// Failures surfaced by relay handles.
///
/// Session operations themselves never fail; these only describe a relay
/// that is gone or a reply that never came back.
#[derive(Debug, Error)]
pub enum RelayError {
	/// The relay task has stopped; no controller is available.
	#[error("session relay is not running")]
	Closed,

	/// The relay dropped the reply channel without answering.
	#[error("reply channel closed before an answer arrived")]
	ReplyDropped,
}

pub type Result<T> = std::result::Result<T, RelayError>;
