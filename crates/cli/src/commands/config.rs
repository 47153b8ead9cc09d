use anyhow::Result;

use super::CommandContext;

pub fn execute(ctx: &CommandContext) -> Result<()> {
	ctx.print("config", &ctx.config);
	Ok(())
}
