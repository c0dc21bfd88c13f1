//! Ambient stack shared by the gateway crates: time helpers, logging
//! bootstrap, and the build-info stamp the health and query surfaces report.

pub mod logging;
pub mod time;

/// Static build metadata, reported by the liveness endpoint and logged once
/// at startup. Mirrors the teacher's `BuildInfo` concept, trimmed to what
/// this gateway actually surfaces.
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
	pub pkg_version: &'static str,
}

impl BuildInfo {
	pub const fn current() -> Self {
		Self {
			pkg_version: env!("CARGO_PKG_VERSION"),
		}
	}
}
