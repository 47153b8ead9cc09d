//! Router integration: route changes get the same protection as reloads.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::activity::{ActivityTracker, HistoryChange};
use crate::guard::ConfirmPrompt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteVerdict {
	Proceed,
	Cancel,
}

/// Wraps an application router's before/after hooks.
#[derive(Debug, Clone)]
pub struct NavigationGuard {
	activity: Arc<ActivityTracker>,
}

impl NavigationGuard {
	pub fn new(activity: Arc<ActivityTracker>) -> Self {
		Self { activity }
	}

	/// Runs before a route change. While a reply streams or a modal shows the
	/// user is asked first; a confirmed change is marked as navigation so the
	/// resulting unload, if any, is allowed.
	pub fn before_each(&self, from: &str, to: &str, prompt: &dyn ConfirmPrompt) -> RouteVerdict {
		if self.activity.snapshot().should_prompt() && !prompt.confirm(&self.activity.config().confirm_message) {
			info!(target = "tabguard.guard", from, to, "route change cancelled by user");
			return RouteVerdict::Cancel;
		}
		self.activity.navigation_detected(HistoryChange::Router);
		debug!(target = "tabguard.guard", from, to, "route change started");
		RouteVerdict::Proceed
	}

	/// Runs after a route change; navigation stays marked for the router grace window.
	pub fn after_each(&self, from: &str, to: &str) {
		self.activity.hold_navigation(true, self.activity.config().router_navigation_grace);
		debug!(target = "tabguard.guard", from, to, "route change finished");
	}
}
