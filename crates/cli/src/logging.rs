//! Log setup for the `tabguard` binary.
//!
//! Logs go to stderr so stdout stays a clean JSON result. `RUST_LOG` wins
//! over the `-v` count when set.

use tracing_subscriber::EnvFilter;

pub fn init_logging(verbose: u8) {
	let level = match verbose {
		0 => "warn",
		1 => "info",
		2 => "debug",
		_ => "trace",
	};
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("tabguard={level},warn")));

	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_target(verbose > 1)
		.try_init();
}
