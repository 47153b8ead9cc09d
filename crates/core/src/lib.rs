//! Per-tab refresh protection and session continuity.
//!
//! One [`TabContext`] lives in each open tab. It owns:
//!
//! - an [`ActivityTracker`] fed by the page (streaming, modal, navigation,
//!   chat, request and network signals),
//! - a [`RefreshGuard`] that decides synchronously whether an unload attempt
//!   is allowed, confirmed with the user, or silently blocked,
//! - a [`SessionClient`] that mirrors conversation state into the shared
//!   session relay so a reload can rehydrate without the network,
//! - a [`RefreshTracker`] audit log persisted in the origin's durable store.
//!
//! # Design Philosophy
//!
//! Nothing here raises to the caller. Transport absence, timeouts and
//! unserializable payloads all degrade to a neutral value (`false`, `None`)
//! and a log line, because the layer is advisory and must never break the
//! page it protects.
//!
//! Grace windows and activity flags are timed leases checked against a
//! [`Clock`] on read; there are no scattered timers to forget.

pub mod activity;
pub mod audit;
pub mod client;
pub mod clone;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod guard;
pub mod lease;
pub mod navigation;
pub mod storage;
pub mod watchdog;

pub use activity::{ActivitySnapshot, ActivityTracker, HistoryChange, NetworkEvent, NetworkEventKind, NetworkState, RequestError};
pub use audit::{AuditAlert, AuditEntry, AutoRefreshSuspicion, MemorySample, MemoryUsage, PageLoadInfo, RefreshTracker, SessionRecord};
pub use client::{ListenerId, RelayTransport, SessionClient, SessionListener};
pub use clone::sanitize;
pub use config::GuardConfig;
pub use context::TabContext;
pub use error::{GuardError, Result};
pub use events::{EventBus, GuardEvent};
pub use guard::{AllowReason, BlockReason, Cause, ConfirmPrompt, Decision, GuardStatus, KeyChord, Propagation, RefreshGuard, RefreshStats, ShortcutVerdict, UnloadAttempt};
pub use lease::Lease;
pub use navigation::{NavigationGuard, RouteVerdict};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use tabguard_relay::{Clock, ManualClock, SystemClock};
pub use watchdog::GenerationWatchdog;
