//! Offline evaluation of one unload attempt.
//!
//! The page state is replayed onto a fresh tab driven by a manual clock, so
//! time-based rules (load grace, interaction recency) behave exactly as they
//! would in a live page.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tabguard::{Decision, GuardConfig, GuardStatus, ManualClock, MemoryStore, TabContext, UnloadAttempt};
use tracing::debug;

use super::CommandContext;
use crate::cli::DecideArgs;

/// Arbitrary epoch the replay starts from.
const REPLAY_EPOCH_MS: u64 = 1_700_000_000_000;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
	pub decision: Decision,
	pub status: GuardStatus,
}

/// Replays `args` onto a fresh tab and evaluates a single unload attempt.
pub fn evaluate(config: &GuardConfig, args: &DecideArgs) -> Evaluation {
	let clock = ManualClock::new(REPLAY_EPOCH_MS);
	let tab = TabContext::new(config.clone(), Arc::new(MemoryStore::new()), Arc::new(clock.clone()), None);
	let activity = tab.activity();

	let since_load = args.since_load_ms;
	match args.interaction_ago_ms {
		Some(ago) => {
			let ago = ago.min(since_load);
			clock.advance(Duration::from_millis(since_load - ago));
			activity.record_interaction();
			clock.advance(Duration::from_millis(ago));
		}
		None => clock.advance(Duration::from_millis(since_load)),
	}

	if args.unprotected {
		activity.set_prevent_auto_refresh(false);
	}
	if args.reconnecting {
		activity.went_offline();
		activity.came_online();
		if args.unprotected {
			activity.set_prevent_auto_refresh(false);
		}
	}
	activity.set_streaming(args.streaming);
	activity.set_modal_showing(args.modal);
	if args.navigating {
		activity.set_navigating(true);
	}
	if args.chat_activity {
		activity.set_loading_messages(true);
	}
	if args.request_in_flight {
		activity.request_started();
	}
	if args.force_block {
		tab.guard().force_block_next();
	}

	let attempt = UnloadAttempt {
		cause: args.cause.map(Into::into),
	};
	debug!(target = "tabguard.guard", ?attempt, since_load, "replaying unload attempt");
	let decision = tab.guard().evaluate_unload(attempt);
	Evaluation {
		decision,
		status: tab.status(),
	}
}

pub fn execute(ctx: &CommandContext, args: &DecideArgs) -> Result<()> {
	ctx.print("decide", evaluate(&ctx.config, args));
	Ok(())
}

#[cfg(test)]
mod tests {
	use clap::Parser;
	use tabguard::{AllowReason, BlockReason};

	use super::*;
	use crate::cli::{Cli, Commands};

	fn decide(argv: &[&str]) -> Evaluation {
		let mut full = vec!["tabguard", "decide"];
		full.extend_from_slice(argv);
		let Commands::Decide(args) = Cli::parse_from(full).command else {
			panic!("expected decide");
		};
		evaluate(&GuardConfig::default(), &args)
	}

	#[test]
	fn fresh_page_is_allowed() {
		let eval = decide(&["--since-load-ms", "2000", "--streaming"]);
		assert_eq!(eval.decision, Decision::Allow { reason: AllowReason::InitialLoad });
	}

	#[test]
	fn idle_protected_page_blocks() {
		let eval = decide(&[]);
		assert_eq!(eval.decision, Decision::Block { reason: BlockReason::AutoRefresh });
		assert_eq!(eval.status.stats.blocked_auto_refreshes, 1);
	}

	#[test]
	fn unprotected_idle_page_allows() {
		let eval = decide(&["--unprotected"]);
		assert_eq!(eval.decision, Decision::Allow { reason: AllowReason::Unprotected });
	}

	#[test]
	fn recent_click_while_streaming_confirms() {
		let eval = decide(&["--streaming", "--interaction-ago-ms", "300"]);
		assert!(matches!(eval.decision, Decision::Confirm { .. }));
		assert_eq!(eval.status.stats.user_confirmations, 1);
	}

	#[test]
	fn stale_click_while_streaming_blocks() {
		let eval = decide(&["--streaming", "--unprotected", "--interaction-ago-ms", "5000"]);
		assert!(eval.decision.is_block());
	}

	#[test]
	fn reconnection_overrides_user_intent() {
		let eval = decide(&["--reconnecting", "--unprotected", "--cause", "gesture"]);
		assert_eq!(eval.decision, Decision::Block { reason: BlockReason::Reconnection });
	}

	#[test]
	fn loading_messages_allows() {
		let eval = decide(&["--chat-activity", "--streaming"]);
		assert_eq!(eval.decision, Decision::Allow { reason: AllowReason::ChatActivity });
	}

	#[test]
	fn forced_block_wins_over_request() {
		let eval = decide(&["--force-block", "--request-in-flight"]);
		assert_eq!(eval.decision, Decision::Block { reason: BlockReason::Forced });
	}
}
