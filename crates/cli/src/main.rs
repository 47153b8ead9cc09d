use clap::Parser;
use tabguard_cli::cli::Cli;
use tabguard_cli::{commands, logging};
use tracing::error;

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	if let Err(err) = commands::dispatch(cli).await {
		error!(target = "tabguard", error = %err, "command failed");
		std::process::exit(1);
	}
}
