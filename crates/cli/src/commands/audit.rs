use anyhow::{Result, bail};
use serde_json::json;
use tracing::info;

use super::CommandContext;
use crate::output::ErrorCode;

pub fn show(ctx: &CommandContext) -> Result<()> {
	let tracker = ctx.tracker();
	let history = tracker.history();
	info!(target = "tabguard.audit", entries = history.len(), "audit history read");
	ctx.print(
		"audit show",
		json!({
			"history": history,
			"lastSession": tracker.last_session(),
		}),
	);
	Ok(())
}

pub fn clear(ctx: &CommandContext) -> Result<()> {
	if !ctx.tracker().clear() {
		ctx.print_error("audit clear", ErrorCode::StoreError, "audit history could not be cleared");
		bail!("audit history could not be cleared");
	}
	ctx.print("audit clear", json!({ "cleared": true }));
	Ok(())
}

pub fn analyze(ctx: &CommandContext) -> Result<()> {
	let suspicion = ctx.tracker().analyze_last_session();
	ctx.print(
		"audit analyze",
		json!({
			"potentialAutoRefresh": suspicion.is_some(),
			"suspicion": suspicion,
		}),
	);
	Ok(())
}
