use std::sync::Arc;

use anyhow::{Result, bail};
use serde_json::json;
use tabguard::storage::PREVENT_AUTO_REFRESH_KEY;
use tabguard::{SystemClock, TabContext};

use super::CommandContext;
use crate::output::ErrorCode;

pub fn status(ctx: &CommandContext) -> Result<()> {
	let saved = ctx.store.get(PREVENT_AUTO_REFRESH_KEY)?;
	let enabled = saved.as_deref().map_or(ctx.config.prevent_auto_refresh_default, |value| value == "true");
	ctx.print(
		"protection status",
		json!({
			"enabled": enabled,
			"persisted": saved.is_some(),
		}),
	);
	Ok(())
}

/// Flips the preference the way a page would, through the activity tracker.
pub fn set(ctx: &CommandContext, enabled: bool) -> Result<()> {
	let command = if enabled { "protection on" } else { "protection off" };
	let tab = TabContext::new(ctx.config.clone(), ctx.store.clone(), Arc::new(SystemClock), None);
	tab.activity().set_prevent_auto_refresh(enabled);

	let expected = if enabled { "true" } else { "false" };
	if ctx.store.get(PREVENT_AUTO_REFRESH_KEY)?.as_deref() != Some(expected) {
		ctx.print_error(command, ErrorCode::StoreError, "preference was not persisted");
		bail!("protection preference was not persisted");
	}
	ctx.print(command, json!({ "enabled": enabled, "persisted": true }));
	Ok(())
}
