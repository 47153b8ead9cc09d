mod audit;
mod config;
pub mod decide;
mod protection;
mod relay_demo;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tabguard::{FileStore, GuardConfig, KeyValueStore, RefreshTracker, SystemClock};

use crate::cli::{AuditAction, Cli, Commands, ProtectionAction};
use crate::output::{ErrorCode, OutputFormat, ResultBuilder, print_result};

/// Shared state resolved from global flags.
pub struct CommandContext {
	pub store: Arc<dyn KeyValueStore>,
	pub config: GuardConfig,
	pub format: OutputFormat,
}

impl CommandContext {
	pub fn new(cli: &Cli) -> Result<Self> {
		let config = GuardConfig::load_or_default(cli.config.as_deref()).context("failed to load configuration")?;
		Ok(Self {
			store: Arc::new(FileStore::new(&cli.store)),
			config,
			format: cli.format,
		})
	}

	pub fn tracker(&self) -> RefreshTracker {
		RefreshTracker::new(self.store.clone(), Arc::new(SystemClock), &self.config)
	}

	pub fn print<T: Serialize>(&self, command: &str, data: T) {
		print_result(&ResultBuilder::new(command).data(data).build(), self.format);
	}

	pub fn print_error(&self, command: &str, code: ErrorCode, message: impl Into<String>) {
		print_result(&ResultBuilder::<()>::new(command).error(code, message).build(), self.format);
	}
}

pub async fn dispatch(cli: Cli) -> Result<()> {
	let ctx = CommandContext::new(&cli)?;
	match cli.command {
		Commands::Audit { action } => match action {
			AuditAction::Show => audit::show(&ctx),
			AuditAction::Clear => audit::clear(&ctx),
			AuditAction::Analyze => audit::analyze(&ctx),
		},
		Commands::Protection { action } => match action {
			ProtectionAction::Status => protection::status(&ctx),
			ProtectionAction::On => protection::set(&ctx, true),
			ProtectionAction::Off => protection::set(&ctx, false),
		},
		Commands::Decide(args) => decide::execute(&ctx, &args),
		Commands::Config => config::execute(&ctx),
		Commands::RelayDemo => relay_demo::execute(&ctx).await,
	}
}
