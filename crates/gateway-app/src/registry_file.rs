//! JSON-file-backed registry persistence (§5.3 of SPEC_FULL.md). The core
//! crate treats the registry's on-disk format as an external collaborator's
//! concern (spec.md §1 Non-goals); this binary is that collaborator, with
//! the simplest format that satisfies "load-at-start and save-on-mutation".

use std::path::{Path, PathBuf};

use mcp_gateway::types::McpServer;

pub struct RegistryFile {
	path: PathBuf,
}

impl RegistryFile {
	pub fn new(path: PathBuf) -> Self {
		Self { path }
	}

	/// Reads the registered servers from disk. A missing file is treated as
	/// an empty registry rather than an error — the first run of a fresh
	/// deployment has nothing to load yet.
	pub fn load(&self) -> anyhow::Result<Vec<McpServer>> {
		if !self.path.exists() {
			return Ok(Vec::new());
		}
		let raw = std::fs::read_to_string(&self.path)?;
		let servers = serde_json::from_str(&raw)?;
		Ok(servers)
	}

	/// Rewrites the file with the current snapshot. Writes to a sibling
	/// temp file and renames over the target so a crash mid-write never
	/// leaves a truncated registry file behind.
	pub fn save(&self, servers: &[McpServer]) -> anyhow::Result<()> {
		let body = serde_json::to_string_pretty(servers)?;
		let tmp = tmp_path(&self.path);
		std::fs::write(&tmp, body)?;
		std::fs::rename(&tmp, &self.path)?;
		Ok(())
	}
}

fn tmp_path(path: &Path) -> PathBuf {
	let mut tmp = path.as_os_str().to_owned();
	tmp.push(".tmp");
	PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_file_loads_as_empty() {
		let file = RegistryFile::new(PathBuf::from("/tmp/does-not-exist-mcp-gateway-registry.json"));
		assert!(file.load().unwrap().is_empty());
	}

	#[test]
	fn round_trips_through_save_and_load() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("registry.json");
		let file = RegistryFile::new(path);
		let servers = vec![McpServer::new("server1", "http://u1/mcp")];
		file.save(&servers).unwrap();
		let loaded = file.load().unwrap();
		assert_eq!(loaded.len(), 1);
		assert_eq!(loaded[0].name, "server1");
	}
}
