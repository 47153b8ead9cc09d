//! Deferred activation of a newer relay version.
//!
//! A replacement worker must not take control while any tab is receiving a
//! streamed reply. The gate fails open: a tab that never reported streaming
//! cannot hold activation back.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::relay::ClientId;

/// Lifecycle phase of the relay's pending update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPhase {
	/// The current version controls every tab.
	Active,
	/// An installed update is waiting for streaming to end.
	Waiting,
}

/// Outcome of installing an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
	Immediate,
	Deferred,
}

/// Tracks which clients are mid-stream and whether an update is parked.
#[derive(Debug, Default)]
pub struct ActivationGate {
	streaming: HashSet<ClientId>,
	waiting: bool,
	generation: u64,
}

impl ActivationGate {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn phase(&self) -> WorkerPhase {
		if self.waiting { WorkerPhase::Waiting } else { WorkerPhase::Active }
	}

	/// Number of activations performed so far.
	pub fn generation(&self) -> u64 {
		self.generation
	}

	pub fn streaming_clients(&self) -> impl Iterator<Item = ClientId> + '_ {
		self.streaming.iter().copied()
	}

	/// Installs a new version, activating unless a client is mid-stream.
	pub fn install(&mut self) -> Activation {
		if self.streaming.is_empty() {
			self.activate();
			Activation::Immediate
		} else {
			self.waiting = true;
			Activation::Deferred
		}
	}

	/// Records a client's streaming flag; returns `true` if this released a
	/// deferred activation.
	pub fn set_streaming(&mut self, client: ClientId, streaming: bool) -> bool {
		if streaming {
			self.streaming.insert(client);
			false
		} else {
			self.streaming.remove(&client);
			self.release_if_idle()
		}
	}

	/// Forgets a disconnected client; returns `true` if this released a
	/// deferred activation.
	pub fn client_gone(&mut self, client: ClientId) -> bool {
		self.streaming.remove(&client);
		self.release_if_idle()
	}

	fn release_if_idle(&mut self) -> bool {
		if self.waiting && self.streaming.is_empty() {
			self.activate();
			true
		} else {
			false
		}
	}

	fn activate(&mut self) {
		self.waiting = false;
		self.generation += 1;
	}
}
