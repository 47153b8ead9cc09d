//! Relay actor, its handle, and per-tab ports.
//!
//! # Message Flow
//!
//! 1. A tab calls [`RelayHandle::connect`] and receives a [`RelayPort`]
//! 2. The tab posts [`PageMessage`]s through the port's [`RelaySender`]
//! 3. The actor applies them to the [`SessionStore`] in arrival order
//! 4. State changes are broadcast as [`WorkerMessage`]s to every port
//! 5. `GET_SESSION` is answered on the oneshot reply channel that came with it
//!
//! A tab whose event channel is gone is pruned on the next broadcast; the
//! remaining tabs still receive the notification.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tabguard_protocol::{ErrorReply, PageMessage, Reply, SessionAction, SessionReply, WorkerMessage};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::activation::{Activation, ActivationGate, WorkerPhase};
use crate::clock::{Clock, millis};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::store::SessionStore;

/// Identifies one connected tab.
pub type ClientId = u64;

/// A message from a tab plus its optional ephemeral reply channel.
#[derive(Debug)]
pub struct Envelope {
	pub from: ClientId,
	pub message: PageMessage,
	pub reply: Option<oneshot::Sender<Reply>>,
}

#[derive(Debug)]
enum Command {
	Connect { id: ClientId, events: mpsc::UnboundedSender<WorkerMessage> },
	Disconnect { id: ClientId },
	Deliver(Envelope),
	InstallUpdate { reply: oneshot::Sender<Activation> },
	Sweep { reply: oneshot::Sender<Vec<String>> },
	Status { reply: oneshot::Sender<RelayStatus> },
	Shutdown,
}

#[derive(Debug)]
struct ClientState {
	events: mpsc::UnboundedSender<WorkerMessage>,
	modal_showing: bool,
	prevent_auto_refresh: Option<bool>,
}

/// Diagnostic snapshot of the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
	pub phase: WorkerPhase,
	pub generation: u64,
	pub sessions: usize,
	pub clients: usize,
	pub streaming_clients: Vec<ClientId>,
	pub modal_clients: Vec<ClientId>,
	pub protected_clients: Vec<ClientId>,
}

/// The relay actor. Owns the session table, the client table and the
/// activation gate; reachable only through [`RelayHandle`].
pub struct Relay {
	store: SessionStore,
	clients: HashMap<ClientId, ClientState>,
	gate: ActivationGate,
	config: RelayConfig,
	clock: Arc<dyn Clock>,
	phase: watch::Sender<WorkerPhase>,
}

impl Relay {
	/// Spawns the relay on the current tokio runtime.
	pub fn spawn(config: RelayConfig, clock: Arc<dyn Clock>) -> (RelayHandle, JoinHandle<()>) {
		let (commands, rx) = mpsc::unbounded_channel();
		let (phase, phase_rx) = watch::channel(WorkerPhase::Active);
		let relay = Relay {
			store: SessionStore::new(),
			clients: HashMap::new(),
			gate: ActivationGate::new(),
			config,
			clock,
			phase,
		};
		let task = tokio::spawn(relay.run(rx));
		let handle = RelayHandle {
			commands,
			next_id: Arc::new(AtomicU64::new(1)),
			phase: phase_rx,
		};
		(handle, task)
	}

	async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
		let period = self.config.sweep_interval.max(Duration::from_millis(1));
		let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
		sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

		info!(target = "tabguard.relay", sweep_ms = millis(period), "session relay started");
		loop {
			tokio::select! {
				command = commands.recv() => match command {
					Some(Command::Shutdown) | None => break,
					Some(command) => self.handle(command),
				},
				_ = sweep.tick() => {
					self.sweep();
				}
			}
		}
		debug!(target = "tabguard.relay", "session relay stopped");
	}

	fn handle(&mut self, command: Command) {
		match command {
			Command::Connect { id, events } => {
				debug!(target = "tabguard.relay", client = id, "client connected");
				self.clients.insert(
					id,
					ClientState {
						events,
						modal_showing: false,
						prevent_auto_refresh: None,
					},
				);
			}
			Command::Disconnect { id } => {
				debug!(target = "tabguard.relay", client = id, "client disconnected");
				self.clients.remove(&id);
				if self.gate.client_gone(id) {
					self.publish_phase("streaming client went away");
				}
			}
			Command::Deliver(envelope) => self.deliver(envelope),
			Command::InstallUpdate { reply } => {
				let activation = self.gate.install();
				match activation {
					Activation::Immediate => info!(target = "tabguard.relay", "update installed, activating immediately"),
					Activation::Deferred => info!(target = "tabguard.relay", "update installed, a client is streaming; activation deferred"),
				}
				self.publish_phase("update installed");
				let _ = reply.send(activation);
			}
			Command::Sweep { reply } => {
				let evicted = self.sweep();
				let _ = reply.send(evicted);
			}
			Command::Status { reply } => {
				let _ = reply.send(self.status());
			}
			Command::Shutdown => {}
		}
	}

	fn deliver(&mut self, envelope: Envelope) {
		let Envelope { from, message, reply } = envelope;
		debug!(target = "tabguard.relay", client = from, kind = message.kind(), "message received");
		let now = self.clock.now_ms();

		match message {
			PageMessage::RegisterSession { session_id, data } => {
				let is_object = data.is_object();
				match self.store.register(&session_id, data, now) {
					Some(action) => self.broadcast_update(&session_id, action),
					None if !is_object => respond(
						reply,
						Reply::Error(ErrorReply {
							error: true,
							message: format!("session {session_id} payload must be an object"),
						}),
					),
					None => {}
				}
			}
			PageMessage::UpdateSession { session_id, data } => {
				if let Some(action) = self.store.update(&session_id, data, now) {
					self.broadcast_update(&session_id, action);
				}
			}
			PageMessage::GetSession { session_id } => {
				if reply.is_none() {
					warn!(target = "tabguard.relay", client = from, session_id = %session_id, "GET_SESSION without reply channel; dropped");
					return;
				}
				let session = self.store.get(&session_id).cloned();
				respond(
					reply,
					Reply::Session(SessionReply {
						exists: session.is_some(),
						session,
						session_id,
					}),
				);
			}
			PageMessage::CompleteSession { session_id } => {
				if let Some(action) = self.store.complete(&session_id, now) {
					self.broadcast_update(&session_id, action);
				}
			}
			PageMessage::ClearSession { session_id } => {
				if let Some(action) = self.store.clear(&session_id) {
					self.broadcast_update(&session_id, action);
				}
			}
			PageMessage::SessionReplaced {
				old_session_id,
				new_session_id,
			} => {
				self.broadcast(WorkerMessage::SessionReplaced {
					old_session_id,
					new_session_id,
				});
			}
			PageMessage::StreamingState { streaming } => {
				debug!(target = "tabguard.relay", client = from, streaming, "client streaming state");
				if self.gate.set_streaming(from, streaming) {
					self.publish_phase("streaming ended");
				}
			}
			PageMessage::ModalState { modal_showing } => {
				if let Some(client) = self.clients.get_mut(&from) {
					client.modal_showing = modal_showing;
				}
			}
			PageMessage::AutoRefreshProtection { prevent_auto_refresh } => {
				if let Some(client) = self.clients.get_mut(&from) {
					client.prevent_auto_refresh = Some(prevent_auto_refresh);
				}
			}
			PageMessage::BeaconReport { payload } => {
				debug!(target = "tabguard.relay", client = from, %payload, "beacon report");
				respond(reply, Reply::BeaconAck { received: true });
			}
		}
	}

	fn sweep(&mut self) -> Vec<String> {
		let evicted = self.store.sweep(self.clock.now_ms(), millis(self.config.session_ttl));
		if !evicted.is_empty() {
			info!(target = "tabguard.relay", evicted = evicted.len(), remaining = self.store.len(), "inactive sessions swept");
		}
		evicted
	}

	fn broadcast_update(&mut self, session_id: &str, action: SessionAction) {
		self.broadcast(WorkerMessage::SessionUpdate {
			session_id: session_id.to_string(),
			action,
		});
	}

	fn broadcast(&mut self, message: WorkerMessage) {
		let dead: Vec<ClientId> = self
			.clients
			.iter()
			.filter(|(_, client)| client.events.send(message.clone()).is_err())
			.map(|(id, _)| *id)
			.collect();

		for id in dead {
			warn!(target = "tabguard.relay", client = id, "broadcast to closed client failed; pruning");
			self.clients.remove(&id);
			if self.gate.client_gone(id) {
				self.publish_phase("streaming client went away");
			}
		}
	}

	fn publish_phase(&self, reason: &str) {
		let phase = self.gate.phase();
		if phase == WorkerPhase::Active {
			info!(target = "tabguard.relay", generation = self.gate.generation(), reason, "relay version active");
		}
		self.phase.send_replace(phase);
	}

	fn status(&self) -> RelayStatus {
		let mut streaming_clients: Vec<ClientId> = self.gate.streaming_clients().collect();
		streaming_clients.sort_unstable();
		let mut modal_clients: Vec<ClientId> = self.clients.iter().filter(|(_, c)| c.modal_showing).map(|(id, _)| *id).collect();
		modal_clients.sort_unstable();
		let mut protected_clients: Vec<ClientId> = self
			.clients
			.iter()
			.filter(|(_, c)| c.prevent_auto_refresh == Some(true))
			.map(|(id, _)| *id)
			.collect();
		protected_clients.sort_unstable();

		RelayStatus {
			phase: self.gate.phase(),
			generation: self.gate.generation(),
			sessions: self.store.len(),
			clients: self.clients.len(),
			streaming_clients,
			modal_clients,
			protected_clients,
		}
	}
}

fn respond(reply: Option<oneshot::Sender<Reply>>, answer: Reply) {
	if let Some(reply) = reply {
		if reply.send(answer).is_err() {
			debug!(target = "tabguard.relay", "reply receiver dropped before answer");
		}
	}
}

/// Cloneable handle to a running relay.
#[derive(Debug, Clone)]
pub struct RelayHandle {
	commands: mpsc::UnboundedSender<Command>,
	next_id: Arc<AtomicU64>,
	phase: watch::Receiver<WorkerPhase>,
}

impl RelayHandle {
	/// Connects a new tab.
	pub fn connect(&self) -> Result<RelayPort> {
		let id = self.next_id.fetch_add(1, Ordering::SeqCst);
		let (events_tx, events) = mpsc::unbounded_channel();
		self.commands.send(Command::Connect { id, events: events_tx }).map_err(|_| RelayError::Closed)?;
		Ok(RelayPort {
			sender: RelaySender {
				id,
				commands: self.commands.clone(),
			},
			events,
		})
	}

	/// Installs a newer relay version, subject to the activation gate.
	pub async fn install_update(&self) -> Result<Activation> {
		self.call(|reply| Command::InstallUpdate { reply }).await
	}

	/// Runs an eviction sweep now instead of waiting for the next tick.
	pub async fn sweep_now(&self) -> Result<Vec<String>> {
		self.call(|reply| Command::Sweep { reply }).await
	}

	pub async fn status(&self) -> Result<RelayStatus> {
		self.call(|reply| Command::Status { reply }).await
	}

	pub fn phase(&self) -> WorkerPhase {
		*self.phase.borrow()
	}

	/// Receiver that observes every phase change.
	pub fn watch_phase(&self) -> watch::Receiver<WorkerPhase> {
		self.phase.clone()
	}

	pub fn shutdown(&self) {
		let _ = self.commands.send(Command::Shutdown);
	}

	async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
		let (tx, rx) = oneshot::channel();
		self.commands.send(make(tx)).map_err(|_| RelayError::Closed)?;
		rx.await.map_err(|_| RelayError::ReplyDropped)
	}
}

/// Outbound half of a tab's connection.
#[derive(Debug, Clone)]
pub struct RelaySender {
	id: ClientId,
	commands: mpsc::UnboundedSender<Command>,
}

impl RelaySender {
	pub fn id(&self) -> ClientId {
		self.id
	}

	/// Whether the relay is still running.
	pub fn is_connected(&self) -> bool {
		!self.commands.is_closed()
	}

	/// Posts a fire-and-forget message.
	pub fn post(&self, message: PageMessage) -> Result<()> {
		self.send(message, None)
	}

	/// Posts a message together with an ephemeral reply channel.
	pub fn post_with_reply(&self, message: PageMessage, reply: oneshot::Sender<Reply>) -> Result<()> {
		self.send(message, Some(reply))
	}

	/// Posts a message and awaits its reply, without a deadline.
	pub async fn request(&self, message: PageMessage) -> Result<Reply> {
		let (tx, rx) = oneshot::channel();
		self.post_with_reply(message, tx)?;
		rx.await.map_err(|_| RelayError::ReplyDropped)
	}

	/// Tells the relay this tab is gone.
	pub fn disconnect(&self) {
		let _ = self.commands.send(Command::Disconnect { id: self.id });
	}

	fn send(&self, message: PageMessage, reply: Option<oneshot::Sender<Reply>>) -> Result<()> {
		self.commands
			.send(Command::Deliver(Envelope {
				from: self.id,
				message,
				reply,
			}))
			.map_err(|_| RelayError::Closed)
	}
}

/// A tab's connection: outbound sender plus inbound broadcast channel.
#[derive(Debug)]
pub struct RelayPort {
	sender: RelaySender,
	events: mpsc::UnboundedReceiver<WorkerMessage>,
}

impl RelayPort {
	pub fn sender(&self) -> &RelaySender {
		&self.sender
	}

	/// Next broadcast addressed to this tab.
	pub async fn recv(&mut self) -> Option<WorkerMessage> {
		self.events.recv().await
	}

	/// Next broadcast if one is already queued.
	pub fn try_recv(&mut self) -> Option<WorkerMessage> {
		self.events.try_recv().ok()
	}

	pub fn into_parts(self) -> (RelaySender, mpsc::UnboundedReceiver<WorkerMessage>) {
		(self.sender, self.events)
	}
}
