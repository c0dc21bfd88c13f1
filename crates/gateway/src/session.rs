//! C2: the session-state store. Three concurrent maps — `clientInfo`,
//! `serverInfo`, and the request-id → start-time tracker — plus the
//! stateless→session-id transition rule (§4.2).

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::RwLock;

use gateway_core::time::{REQUEST_TRACKER_TTL, elapsed_ms, monotonic_now};

use crate::types::{ClientInfo, STATELESS_SESSION, ServerInfo};

/// Key for `RequestTracker`: a request is scoped to the upstream it went
/// to, the session it belongs to, and its JSON-RPC id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
	pub server: String,
	pub session: String,
	pub request_id: String,
}

struct TrackedRequest {
	start: Instant,
	inserted: Instant,
	method: String,
}

/// In-memory, thread-safe session identity store (§4.2). All three maps
/// are guarded independently; `clear_all` takes all three write locks so a
/// concurrent reader observes either the prior state or the fully-cleared
/// state, never a mix (§4.2: "never a torn map").
#[derive(Default)]
pub struct SessionStore {
	client_info: RwLock<HashMap<String, ClientInfo>>,
	server_info: RwLock<HashMap<String, ServerInfo>>,
	req_start: RwLock<HashMap<RequestKey, TrackedRequest>>,
}

impl SessionStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get_client_info(&self, session: &str) -> Option<ClientInfo> {
		self.client_info.read().get(session).cloned()
	}

	pub fn get_server_info(&self, session: &str) -> Option<ServerInfo> {
		self.server_info.read().get(session).cloned()
	}

	pub fn set_client_info(&self, session: &str, info: ClientInfo) {
		self.client_info.write().insert(session.to_string(), info);
	}

	pub fn set_server_info(&self, session: &str, info: ServerInfo) {
		self.server_info.write().insert(session.to_string(), info);
	}

	/// Stateless-transition rule (§4.2): when an `initialize` response
	/// carries `Mcp-Session-Id: S`, the identity stored under
	/// `"stateless"` is *copied* (not moved) to `S`. The `"stateless"`
	/// entry is left in place; the next stateless `initialize` will
	/// overwrite it (§9 open question (c) — confirmed intentional).
	pub fn copy_stateless_to(&self, new_session: &str) {
		if new_session == STATELESS_SESSION {
			return;
		}
		if let Some(ci) = self.client_info.read().get(STATELESS_SESSION).cloned() {
			self.client_info.write().insert(new_session.to_string(), ci);
		}
		if let Some(si) = self.server_info.read().get(STATELESS_SESSION).cloned() {
			self.server_info.write().insert(new_session.to_string(), si);
		}
	}

	/// Atomically empties all three maps (§4.2, invoked by the query API's
	/// clear endpoint, §4.9).
	pub fn clear_all(&self) {
		let mut ci = self.client_info.write();
		let mut si = self.server_info.write();
		let mut rt = self.req_start.write();
		ci.clear();
		si.clear();
		rt.clear();
	}

	/// Records the start time (and originating method) of a request so the
	/// paired response can compute `durationMs` and, when the response
	/// arrives on a different HTTP connection than the request (the SSE
	/// cross-channel case, §8 S6), recover the request's actual `method`
	/// instead of whatever label the receiving connection would otherwise
	/// guess (§3 `RequestTracker`). Evicts TTL-expired entries
	/// opportunistically on insert (§5 of SPEC_FULL.md) rather than running
	/// a background sweep task.
	pub fn start_request(&self, key: RequestKey, method: String) {
		let now = monotonic_now();
		let mut guard = self.req_start.write();
		guard.retain(|_, v| now.saturating_duration_since(v.inserted) < REQUEST_TRACKER_TTL);
		guard.insert(
			key,
			TrackedRequest {
				start: now,
				inserted: now,
				method,
			},
		);
	}

	/// Looks up and removes the tracked start time and method for `key`,
	/// returning `(durationMs, method)` if it was still tracked (not
	/// evicted, not already consumed by a prior response for the same id).
	pub fn take_request(&self, key: &RequestKey) -> Option<(i64, String)> {
		let tracked = self.req_start.write().remove(key)?;
		Some((elapsed_ms(tracked.start), tracked.method))
	}

	/// Convenience wrapper over [`Self::take_request`] for callers that
	/// already know the method and only need the elapsed time.
	pub fn take_duration_ms(&self, key: &RequestKey) -> Option<i64> {
		self.take_request(key).map(|(duration_ms, _)| duration_ms)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stateless_copy_does_not_delete_source() {
		let store = SessionStore::new();
		store.set_client_info(
			STATELESS_SESSION,
			ClientInfo {
				name: "test-client".into(),
				version: "1.0.0".into(),
				title: None,
			},
		);
		store.copy_stateless_to("ABC");

		assert_eq!(
			store.get_client_info("ABC").unwrap().name,
			"test-client"
		);
		// stateless fallback entry remains, per §9 open question (c)
		assert!(store.get_client_info(STATELESS_SESSION).is_some());
	}

	#[test]
	fn clear_all_empties_everything() {
		let store = SessionStore::new();
		store.set_client_info(
			"S",
			ClientInfo {
				name: "c".into(),
				version: "1".into(),
				title: None,
			},
		);
		store.start_request(
			RequestKey {
				server: "s1".into(),
				session: "S".into(),
				request_id: "1".into(),
			},
			"tools/call".into(),
		);
		store.clear_all();
		assert!(store.get_client_info("S").is_none());
		assert!(
			store
				.take_duration_ms(&RequestKey {
					server: "s1".into(),
					session: "S".into(),
					request_id: "1".into(),
				})
				.is_none()
		);
	}

	#[test]
	fn duration_is_nonnegative_and_consumed_once() {
		let store = SessionStore::new();
		let key = RequestKey {
			server: "s1".into(),
			session: "S".into(),
			request_id: "1".into(),
		};
		store.start_request(key.clone(), "tools/call".into());
		let d = store.take_duration_ms(&key).expect("tracked");
		assert!(d >= 0);
		assert!(store.take_duration_ms(&key).is_none());
	}

	#[test]
	fn take_request_recovers_the_tracked_method() {
		let store = SessionStore::new();
		let key = RequestKey {
			server: "s1".into(),
			session: "S".into(),
			request_id: "5".into(),
		};
		store.start_request(key.clone(), "tools/call".into());
		let (duration_ms, method) = store.take_request(&key).expect("tracked");
		assert!(duration_ms >= 0);
		assert_eq!(method, "tools/call");
		assert!(store.take_request(&key).is_none());
	}
}
