//! Session relay: the page-independent worker that caches conversation
//! snapshots for every tab of an origin.
//!
//! The relay is an actor. Tabs never touch its state directly; they post
//! [`tabguard_protocol::PageMessage`]s over a [`RelaySender`] and receive
//! [`tabguard_protocol::WorkerMessage`] broadcasts on their own event channel.
//! `GET_SESSION` is the only request/response exchange and is answered on an
//! ephemeral oneshot reply channel supplied with the message.

pub mod activation;
pub mod clock;
pub mod config;
pub mod error;
pub mod relay;
pub mod store;

pub use activation::{Activation, ActivationGate, WorkerPhase};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use relay::{ClientId, Envelope, Relay, RelayHandle, RelayPort, RelaySender, RelayStatus};
pub use store::SessionStore;
