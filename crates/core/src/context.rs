//! One tab's protection layer, wired together.

use std::sync::Arc;

use parking_lot::Mutex;
use tabguard_relay::{Clock, RelayHandle};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::activity::ActivityTracker;
use crate::audit::{AutoRefreshSuspicion, PageLoadInfo, RefreshTracker};
use crate::client::{RelayTransport, SessionClient};
use crate::config::GuardConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::guard::{Decision, GuardStatus, Propagation, RefreshGuard, UnloadAttempt};
use crate::navigation::NavigationGuard;
use crate::storage::KeyValueStore;
use crate::watchdog::GenerationWatchdog;

/// Everything a tab needs, sharing one config, clock, store and event bus.
pub struct TabContext {
	config: Arc<GuardConfig>,
	events: EventBus,
	activity: Arc<ActivityTracker>,
	client: Arc<SessionClient>,
	guard: RefreshGuard,
	navigation: NavigationGuard,
	tracker: RefreshTracker,
	watchdog: Arc<GenerationWatchdog>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TabContext {
	/// Builds a tab over `transport`; `None` runs without cross-tab continuity.
	///
	/// The persisted protection preference is restored immediately.
	pub fn new(config: GuardConfig, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, transport: Option<Arc<dyn RelayTransport>>) -> Self {
		let config = Arc::new(config);
		let events = EventBus::new();
		let activity = Arc::new(ActivityTracker::new(
			config.clone(),
			clock.clone(),
			events.clone(),
			store.clone(),
			transport.clone(),
		));
		activity.restore_preferences();

		let client = Arc::new(SessionClient::new(transport, clock.clone(), events.clone(), &config));
		let guard = RefreshGuard::new(activity.clone(), config.clone(), clock.clone(), events.clone());
		let navigation = NavigationGuard::new(activity.clone());
		let tracker = RefreshTracker::new(store, clock.clone(), &config);
		let watchdog = Arc::new(GenerationWatchdog::new(activity.clone(), config.clone(), clock, events.clone()));

		Self {
			config,
			events,
			activity,
			client,
			guard,
			navigation,
			tracker,
			watchdog,
			tasks: Mutex::new(Vec::new()),
		}
	}

	/// Connects a new tab to `relay` and starts dispatching its broadcasts.
	///
	/// Must be called inside a Tokio runtime.
	pub fn connect(relay: &RelayHandle, config: GuardConfig, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Result<Self> {
		let (sender, broadcasts) = relay.connect()?.into_parts();
		let id = sender.id();
		let transport: Arc<dyn RelayTransport> = Arc::new(sender);
		let tab = Self::new(config, store, clock, Some(transport));
		let dispatcher = tokio::spawn(tab.client.clone().run(broadcasts));
		tab.tasks.lock().push(dispatcher);
		debug!(target = "tabguard.client", client = id, "tab connected to relay");
		Ok(tab)
	}

	/// Page finished loading: records the load, checks for an auto-refresh
	/// and starts the generation watchdog.
	///
	/// Must be called inside a Tokio runtime.
	pub fn start(&self, info: PageLoadInfo) -> Option<AutoRefreshSuspicion> {
		self.activity.page_loaded();
		let suspicion = self.tracker.init(info);
		let activity = self.activity.clone();
		let watchdog = self.watchdog.spawn(move || activity.snapshot().streaming);
		self.tasks.lock().push(watchdog);
		suspicion
	}

	/// Decides an unload attempt; anything not blocked closes the audit session.
	pub fn before_unload(&self, attempt: UnloadAttempt, url: &str) -> Decision {
		let decision = self.guard.evaluate_unload(attempt);
		if !decision.is_block() {
			self.tracker.record_page_unload(url);
		}
		decision
	}

	/// A new relay version took control of the page.
	pub fn controller_changed(&self, url: &str, controller_url: Option<&str>) -> Propagation {
		self.tracker.record_controller_change(url, controller_url);
		self.guard.on_controller_change()
	}

	pub fn config(&self) -> &Arc<GuardConfig> {
		&self.config
	}

	pub fn events(&self) -> &EventBus {
		&self.events
	}

	pub fn activity(&self) -> &Arc<ActivityTracker> {
		&self.activity
	}

	pub fn client(&self) -> &Arc<SessionClient> {
		&self.client
	}

	pub fn guard(&self) -> &RefreshGuard {
		&self.guard
	}

	pub fn navigation(&self) -> &NavigationGuard {
		&self.navigation
	}

	pub fn tracker(&self) -> &RefreshTracker {
		&self.tracker
	}

	pub fn watchdog(&self) -> &Arc<GenerationWatchdog> {
		&self.watchdog
	}

	pub fn status(&self) -> GuardStatus {
		self.guard.status()
	}

	/// Stops the broadcast dispatcher and the watchdog.
	pub fn teardown(&self) {
		let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
		if tasks.is_empty() {
			return;
		}
		for task in &tasks {
			task.abort();
		}
		info!(target = "tabguard.client", tasks = tasks.len(), "tab torn down");
	}
}

impl Drop for TabContext {
	fn drop(&mut self) {
		self.teardown();
	}
}

impl std::fmt::Debug for TabContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TabContext")
			.field("activity", &self.activity)
			.field("client", &self.client)
			.field("tasks", &self.tasks.lock().len())
			.finish_non_exhaustive()
	}
}
