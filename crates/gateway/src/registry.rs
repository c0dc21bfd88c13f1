//! C9: the authoritative, name-keyed list of upstreams (§4.1).
//!
//! Names are case-folded on lookup; the stored `McpServer::name` preserves
//! the casing it was registered with. Mutations go through a single writer
//! lock; readers get a consistent snapshot (`list()` clones under the read
//! guard, so a concurrent mutation never produces a torn view).

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{McpServer, fold};

#[derive(Debug, Default)]
pub struct Registry {
	inner: RwLock<BTreeMap<String, McpServer>>,
}

impl Registry {
	pub fn new() -> Self {
		Self {
			inner: RwLock::new(BTreeMap::new()),
		}
	}

	/// Bulk-loads the registry at startup (§5.3 of SPEC_FULL.md: load at
	/// start). Case-folds each entry's key the same way `add` does.
	pub fn load(servers: Vec<McpServer>) -> Self {
		let reg = Self::new();
		for s in servers {
			reg.add(s);
		}
		reg
	}

	pub fn get(&self, name: &str) -> Option<McpServer> {
		self.inner.read().get(&fold(name)).cloned()
	}

	pub fn list(&self) -> Vec<McpServer> {
		self.inner.read().values().cloned().collect()
	}

	/// Inserts or overwrites a server by case-folded name.
	pub fn add(&self, server: McpServer) {
		let key = fold(&server.name);
		self.inner.write().insert(key, server);
	}

	/// Applies `mutate` to the server named `name`, if it exists, under a
	/// single write-lock acquisition. Used by the proxy (activity/exchange
	/// count bumps, §4.5 step 8) and the health checker (status updates,
	/// §4.7).
	pub fn update(&self, name: &str, mutate: impl FnOnce(&mut McpServer)) -> bool {
		let mut guard = self.inner.write();
		match guard.get_mut(&fold(name)) {
			Some(server) => {
				mutate(server);
				true
			},
			None => false,
		}
	}

	/// Removes a server from the registry. Does not touch captures (§3:
	/// "Removal does not delete captures").
	pub fn remove(&self, name: &str) -> Option<McpServer> {
		self.inner.write().remove(&fold(name))
	}

	pub fn contains(&self, name: &str) -> bool {
		self.inner.read().contains_key(&fold(name))
	}
}

pub type SharedRegistry = Arc<Registry>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lookup_is_case_insensitive_but_preserves_casing() {
		let reg = Registry::new();
		reg.add(McpServer::new("Server1", "http://upstream:9000/"));

		let got = reg.get("server1").expect("case-insensitive lookup");
		assert_eq!(got.name, "Server1");
		// trailing slash stripped (§3)
		assert_eq!(got.url, "http://upstream:9000");
	}

	#[test]
	fn remove_does_not_affect_a_second_lookup_path() {
		let reg = Registry::new();
		reg.add(McpServer::new("a", "http://a"));
		reg.add(McpServer::new("b", "http://b"));
		assert!(reg.remove("A").is_some());
		assert!(reg.get("a").is_none());
		assert!(reg.get("b").is_some());
	}

	#[test]
	fn update_bumps_activity_atomically() {
		let reg = Registry::new();
		reg.add(McpServer::new("s", "http://s"));
		let ok = reg.update("S", |s| {
			s.exchange_count += 1;
			s.last_activity = Some("2026-01-01T00:00:00.000Z".into());
		});
		assert!(ok);
		let s = reg.get("s").unwrap();
		assert_eq!(s.exchange_count, 1);
		assert!(s.last_activity.is_some());
	}
}
