//! Safety net for generations that never report completion.
//!
//! If a generation has been marked loading with no update for longer than its
//! inactivity window, and no message is still streaming, the watchdog clears
//! the loading flag so the guard cannot stay wedged open.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tabguard_relay::Clock;
use tabguard_relay::clock::millis;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::activity::ActivityTracker;
use crate::config::GuardConfig;
use crate::events::{EventBus, GuardEvent};

#[derive(Debug, Default)]
struct Generation {
	loading: bool,
	app_type: Option<String>,
	last_update: u64,
}

#[derive(Debug)]
pub struct GenerationWatchdog {
	generation: Mutex<Generation>,
	activity: Arc<ActivityTracker>,
	config: Arc<GuardConfig>,
	clock: Arc<dyn Clock>,
	events: EventBus,
}

impl GenerationWatchdog {
	pub fn new(activity: Arc<ActivityTracker>, config: Arc<GuardConfig>, clock: Arc<dyn Clock>, events: EventBus) -> Self {
		Self {
			generation: Mutex::new(Generation::default()),
			activity,
			config,
			clock,
			events,
		}
	}

	/// Marks a generation for `app_type` as loading.
	pub fn begin(&self, app_type: Option<&str>) {
		let now = self.clock.now_ms();
		let mut generation = self.generation.lock();
		generation.loading = true;
		generation.app_type = app_type.map(str::to_string);
		generation.last_update = now;
	}

	/// Records progress on the current generation.
	pub fn touch(&self) {
		let now = self.clock.now_ms();
		self.generation.lock().last_update = now;
	}

	pub fn finish(&self) {
		self.generation.lock().loading = false;
	}

	pub fn is_loading(&self) -> bool {
		self.generation.lock().loading
	}

	/// One watchdog check; returns `true` if the loading flag was force-cleared.
	pub fn tick(&self, message_streaming: bool) -> bool {
		let now = self.clock.now_ms();
		let (app_type, idle_ms) = {
			let mut generation = self.generation.lock();
			if !generation.loading {
				return false;
			}
			let idle_ms = now.saturating_sub(generation.last_update);
			let limit = millis(self.config.inactivity_for(generation.app_type.as_deref()));
			if idle_ms <= limit {
				return false;
			}
			if message_streaming {
				debug!(target = "tabguard.activity", idle_ms, "generation idle but a message is still streaming");
				generation.last_update = now;
				return false;
			}
			generation.loading = false;
			(generation.app_type.clone(), idle_ms)
		};

		warn!(target = "tabguard.activity", app_type = ?app_type, idle_ms, "generation stalled, loading flag force-cleared");
		self.activity.clear_loading();
		self.events.emit(GuardEvent::GenerationReset { app_type, idle_ms });
		true
	}

	/// Runs [`tick`](Self::tick) on the configured interval until the task is aborted.
	///
	/// `message_streaming` is polled on every tick.
	pub fn spawn(self: &Arc<Self>, message_streaming: impl Fn() -> bool + Send + 'static) -> JoinHandle<()> {
		let watchdog = Arc::clone(self);
		let period = self.config.watchdog_tick.max(Duration::from_millis(1));
		tokio::spawn(async move {
			let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
			ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				ticks.tick().await;
				watchdog.tick(message_streaming());
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicBool, Ordering};

	use tabguard_relay::ManualClock;

	use super::*;
	use crate::storage::MemoryStore;

	fn watchdog(clock: &ManualClock) -> Arc<GenerationWatchdog> {
		watchdog_with(clock, GuardConfig::default())
	}

	fn watchdog_with(clock: &ManualClock, config: GuardConfig) -> Arc<GenerationWatchdog> {
		let config = Arc::new(config);
		let clock: Arc<dyn Clock> = Arc::new(clock.clone());
		let events = EventBus::new();
		let activity = Arc::new(ActivityTracker::new(config.clone(), clock.clone(), events.clone(), Arc::new(MemoryStore::new()), None));
		Arc::new(GenerationWatchdog::new(activity, config, clock, events))
	}

	#[test]
	fn idle_generation_is_cleared_after_window() {
		let clock = ManualClock::new(0);
		let dog = watchdog(&clock);
		dog.begin(None);

		clock.advance(Duration::from_secs(10));
		assert!(!dog.tick(false));
		clock.advance(Duration::from_millis(1));
		assert!(dog.tick(false));
		assert!(!dog.is_loading());
	}

	#[test]
	fn long_running_app_type_gets_thirty_seconds() {
		let clock = ManualClock::new(0);
		let dog = watchdog(&clock);
		dog.begin(Some("destiny"));

		clock.advance(Duration::from_secs(20));
		assert!(!dog.tick(false));
		clock.advance(Duration::from_secs(11));
		assert!(dog.tick(false));
	}

	#[test]
	fn streaming_message_refreshes_timestamp() {
		let clock = ManualClock::new(0);
		let dog = watchdog(&clock);
		dog.begin(None);

		clock.advance(Duration::from_secs(15));
		assert!(!dog.tick(true));
		assert!(dog.is_loading());
		clock.advance(Duration::from_secs(5));
		assert!(!dog.tick(false));
	}

	#[test]
	fn touch_postpones_reset() {
		let clock = ManualClock::new(0);
		let dog = watchdog(&clock);
		dog.begin(None);
		clock.advance(Duration::from_secs(8));
		dog.touch();
		clock.advance(Duration::from_secs(8));
		assert!(!dog.tick(false));
	}

	#[tokio::test(start_paused = true)]
	async fn spawned_watchdog_resets_on_schedule() {
		let clock = ManualClock::new(0);
		let dog = watchdog(&clock);
		let mut events = dog.events.subscribe();
		let streaming = Arc::new(AtomicBool::new(false));
		let flag = streaming.clone();
		let task = dog.spawn(move || flag.load(Ordering::SeqCst));

		dog.begin(Some("travel"));
		clock.advance(Duration::from_secs(11));
		tokio::time::sleep(Duration::from_millis(5_100)).await;

		assert!(!dog.is_loading());
		assert!(matches!(events.recv().await.unwrap(), GuardEvent::GenerationReset { idle_ms: 11_000, .. }));
		task.abort();
	}

	#[tokio::test(start_paused = true)]
	async fn zero_tick_is_clamped() {
		let clock = ManualClock::new(0);
		let config = GuardConfig {
			watchdog_tick: Duration::ZERO,
			..GuardConfig::default()
		};
		let dog = watchdog_with(&clock, config);
		let task = dog.spawn(|| false);

		dog.begin(None);
		clock.advance(Duration::from_secs(11));
		tokio::time::sleep(Duration::from_millis(5)).await;

		assert!(!dog.is_loading());
		assert!(!task.is_finished());
		task.abort();
	}
}
