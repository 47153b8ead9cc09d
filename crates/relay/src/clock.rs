//! Wall-clock abstraction shared by the relay and the per-tab guard.
//!
//! Every timestamp in the protection layer is epoch milliseconds. Grace
//! windows and leases are evaluated against a [`Clock`] on read, so tests
//! drive time with [`ManualClock`] instead of sleeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of epoch-millisecond timestamps.
pub trait Clock: Send + Sync + std::fmt::Debug {
	fn now_ms(&self) -> u64;
}

/// Reads the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now_ms(&self) -> u64 {
		SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or_default()
	}
}

/// Manually advanced clock; clones share the same instant.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
	now: Arc<AtomicU64>,
}

impl ManualClock {
	pub fn new(start_ms: u64) -> Self {
		Self {
			now: Arc::new(AtomicU64::new(start_ms)),
		}
	}

	pub fn advance(&self, by: Duration) {
		self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
	}

	pub fn set(&self, now_ms: u64) {
		self.now.store(now_ms, Ordering::SeqCst);
	}
}

impl Clock for ManualClock {
	fn now_ms(&self) -> u64 {
		self.now.load(Ordering::SeqCst)
	}
}

/// Milliseconds in `duration`, saturating.
pub fn millis(duration: Duration) -> u64 {
	u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
