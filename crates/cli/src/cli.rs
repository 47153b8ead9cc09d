use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tabguard::Cause;

use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "tabguard")]
#[command(about = "Inspect and exercise tabguard refresh protection")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Durable store file shared by every tab of the origin
	#[arg(long, global = true, value_name = "FILE", default_value = "tabguard-store.json")]
	pub store: PathBuf,

	/// JSON file overriding the default thresholds
	#[arg(long, global = true, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Output format
	#[arg(short, long, global = true, value_enum, default_value = "json")]
	pub format: OutputFormat,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Refresh audit log
	Audit {
		#[command(subcommand)]
		action: AuditAction,
	},

	/// Persisted auto-refresh protection preference
	Protection {
		#[command(subcommand)]
		action: ProtectionAction,
	},

	/// Evaluate one unload attempt against a described page state
	Decide(DecideArgs),

	/// Print the effective configuration
	Config,

	/// Run a relay with two tabs and show replacement and deferred activation
	RelayDemo,
}

#[derive(Subcommand, Debug)]
pub enum AuditAction {
	/// Print every readable entry and the open session
	Show,
	/// Delete the history and the open session
	Clear,
	/// Compare the last two complete sessions for a potential auto-refresh
	Analyze,
}

#[derive(Subcommand, Debug)]
pub enum ProtectionAction {
	/// Show the saved preference
	Status,
	/// Enable auto-refresh protection
	On,
	/// Disable auto-refresh protection
	Off,
}

#[derive(Args, Debug, Clone)]
pub struct DecideArgs {
	/// An assistant reply is streaming
	#[arg(long)]
	pub streaming: bool,

	/// A blocking dialog is open
	#[arg(long)]
	pub modal: bool,

	/// Auto-refresh protection is off
	#[arg(long)]
	pub unprotected: bool,

	/// Milliseconds since the page loaded
	#[arg(long, default_value = "30000", value_name = "MS")]
	pub since_load_ms: u64,

	/// Milliseconds since the last click or key press
	#[arg(long, value_name = "MS")]
	pub interaction_ago_ms: Option<u64>,

	/// Where the attempt came from; omit to use recency heuristics
	#[arg(long, value_enum)]
	pub cause: Option<CauseArg>,

	/// A navigation is in progress
	#[arg(long)]
	pub navigating: bool,

	/// Messages are loading
	#[arg(long)]
	pub chat_activity: bool,

	/// A request is in flight
	#[arg(long)]
	pub request_in_flight: bool,

	/// The network just came back
	#[arg(long)]
	pub reconnecting: bool,

	/// Block the attempt unconditionally
	#[arg(long)]
	pub force_block: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CauseArg {
	Gesture,
	Navigation,
	Programmatic,
	NetworkRecovery,
}

impl From<CauseArg> for Cause {
	fn from(arg: CauseArg) -> Self {
		match arg {
			CauseArg::Gesture => Cause::UserGesture,
			CauseArg::Navigation => Cause::Navigation,
			CauseArg::Programmatic => Cause::Programmatic,
			CauseArg::NetworkRecovery => Cause::NetworkRecovery,
		}
	}
}
