//! Error types for the per-tab protection layer.
//!
//! These stay internal to the crate's plumbing: public protection operations
//! convert them into neutral values and a log line at the boundary.

use std::path::PathBuf;

use tabguard_relay::RelayError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("invalid configuration in {path}: {reason}")]
	Config { path: PathBuf, reason: String },

	#[error("relay transport: {0}")]
	Relay(#[from] RelayError),
}

pub type Result<T> = std::result::Result<T, GuardError>;
