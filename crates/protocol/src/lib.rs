//! Wire types for the tab ⇄ session-relay protocol.
//!
//! This crate contains the serde-serializable types exchanged between a page
//! context and the relay worker shared by every tab of an origin. These types
//! represent the "protocol layer" - the shapes of data as they appear on the
//! message channel.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: No behavior beyond serialization/deserialization
//! * 1:1 with the message table: `type` tags and camelCase fields as posted
//! * Stable: Changes only when the message protocol changes
//!
//! The relay actor lives in `tabguard-relay`; the per-tab client and refresh
//! guard are built on top of these types in `tabguard`.

pub mod messages;
pub mod session;

pub use messages::*;
pub use session::*;
