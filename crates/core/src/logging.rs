//! Global `tracing` subscriber bootstrap (§5.1 of SPEC_FULL.md). The app
//! binary calls `init()` once at startup; library crates only ever emit
//! events through the `tracing` macros and never touch the subscriber.

use tracing_subscriber::EnvFilter;

/// Installs a process-wide `tracing` subscriber reading its filter from
/// `RUST_LOG`, defaulting to `info` when unset. Safe to call at most once;
/// a second call is a logic error in the caller, not something this
/// library papers over.
pub fn init() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(true)
		.init();
}
