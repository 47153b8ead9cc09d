//! Timed boolean flags checked against the clock on read.

use std::time::Duration;

use serde::Serialize;
use tabguard_relay::clock::millis;

/// A flag that is set until an expiry instant or an explicit clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
	expires_at: Option<u64>,
	/// When the flag last stopped being set, explicitly or by expiry.
	ended_at: Option<u64>,
}

impl Lease {
	/// Sets the flag for `window` from `now`. Re-granting extends or shortens it.
	pub fn grant(&mut self, now: u64, window: Duration) {
		self.expires_at = Some(now.saturating_add(millis(window)));
	}

	/// Clears the flag at `now`.
	pub fn clear(&mut self, now: u64) {
		if let Some(until) = self.expires_at.take() {
			self.ended_at = Some(until.min(now));
		}
	}

	pub fn is_active(&self, now: u64) -> bool {
		self.expires_at.is_some_and(|until| now < until)
	}

	/// Last instant the flag went from set to unset, if it ever did.
	pub fn ended_at(&self, now: u64) -> Option<u64> {
		match self.expires_at {
			Some(until) if now >= until => Some(until),
			Some(_) => None,
			None => self.ended_at,
		}
	}

	/// Whether the flag is set or was set within `window` before `now`.
	pub fn held_within(&self, now: u64, window: Duration) -> bool {
		self.is_active(now) || self.ended_at(now).is_some_and(|ended| now.saturating_sub(ended) < millis(window))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn expires_without_explicit_clear() {
		let mut lease = Lease::default();
		lease.grant(1_000, Duration::from_millis(1_500));
		assert!(lease.is_active(2_499));
		assert!(!lease.is_active(2_500));
		assert_eq!(lease.ended_at(3_000), Some(2_500));
	}

	#[test]
	fn clear_records_end() {
		let mut lease = Lease::default();
		lease.grant(0, Duration::from_secs(2));
		lease.clear(500);
		assert!(!lease.is_active(600));
		assert_eq!(lease.ended_at(600), Some(500));
	}

	#[test]
	fn clear_of_expired_lease_keeps_expiry_as_end() {
		let mut lease = Lease::default();
		lease.grant(0, Duration::from_secs(1));
		lease.clear(5_000);
		assert_eq!(lease.ended_at(5_000), Some(1_000));
	}

	#[test]
	fn held_within_covers_recent_end() {
		let mut lease = Lease::default();
		assert!(!lease.held_within(10, Duration::from_secs(1)));
		lease.grant(0, Duration::from_millis(100));
		assert!(lease.held_within(50, Duration::from_secs(1)));
		assert!(lease.held_within(1_099, Duration::from_secs(1)));
		assert!(!lease.held_within(1_100, Duration::from_secs(1)));
	}
}
