//! The data model of §3: `McpServer`, session identity, and `CaptureRecord`.
//!
//! These are plain data types; the invariants from §3 are enforced by the
//! components that build and persist them (`capture`, `store`), not by the
//! types themselves.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel session key used for traffic that arrives with no
/// `Mcp-Session-Id` header (§3, §4.2).
pub const STATELESS_SESSION: &str = "stateless";

/// Health status of a registered upstream (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
	Up,
	Down,
	Unknown,
}

impl Default for HealthStatus {
	fn default() -> Self {
		HealthStatus::Unknown
	}
}

impl fmt::Display for HealthStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			HealthStatus::Up => write!(f, "up"),
			HealthStatus::Down => write!(f, "down"),
			HealthStatus::Unknown => write!(f, "unknown"),
		}
	}
}

/// A registered upstream MCP server (§3). Names are compared
/// case-insensitively everywhere (registry lookups, route matching,
/// capture `serverName`), but the original casing is preserved for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServer {
	pub name: String,
	pub url: String,
	#[serde(default)]
	pub headers: std::collections::BTreeMap<String, String>,
	pub last_activity: Option<String>,
	#[serde(default)]
	pub exchange_count: u64,
	#[serde(default)]
	pub health: HealthStatus,
	pub last_health_check: Option<String>,
}

impl McpServer {
	/// Normalizes a freshly registered server: strips the trailing slash
	/// from `url` (§3) so header construction and upstream-base derivation
	/// (§4.6) never have to special-case it later.
	pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
		let mut url: String = url.into();
		while url.ends_with('/') {
			url.pop();
		}
		Self {
			name: name.into(),
			url,
			headers: Default::default(),
			last_activity: None,
			exchange_count: 0,
			health: HealthStatus::Unknown,
			last_health_check: None,
		}
	}
}

/// Case-folding key for registry/session lookups. Never displayed; only
/// ever used as a `HashMap` key.
pub fn fold(name: &str) -> String {
	name.to_lowercase()
}

/// `clientInfo` extracted from an `initialize` request's
/// `params.clientInfo` (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
	pub name: String,
	pub version: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub title: Option<String>,
}

/// `serverInfo` extracted from an `initialize` response's
/// `result.serverInfo` (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	pub version: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub title: Option<String>,
}

/// A JSON-RPC 2.0 `id`: string, integer, or null. Stored stringified in
/// the backend (§4.8) but kept typed in memory so we can tell a present
/// `null` id apart from a genuinely absent one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
	String(String),
	Number(i64),
	Null,
}

impl fmt::Display for JsonRpcId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			JsonRpcId::String(s) => write!(f, "{s}"),
			JsonRpcId::Number(n) => write!(f, "{n}"),
			JsonRpcId::Null => write!(f, "null"),
		}
	}
}

/// The direction expanded `GET /logs` rows are tagged with (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
	Request,
	Response,
	SseEvent,
}

/// Per-row metadata attached to every `CaptureRecord` (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureMetadata {
	pub server_name: String,
	pub session_id: String,
	pub duration_ms: i64,
	pub http_status: u16,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client: Option<ClientInfo>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub server: Option<ServerInfo>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_agent: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_ip: Option<String>,
}

/// The raw SSE frame captured by C4 when it is not an embedded JSON-RPC
/// message (§3, §4.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSseEvent {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub event: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub retry: Option<u64>,
}

/// One of the three payload shapes a `CaptureRecord` can carry (§3,
/// invariant: exactly one is present per row).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CapturePayload {
	Request(serde_json::Value),
	Response(serde_json::Value),
	SseEvent(RawSseEvent),
}

/// The unit persisted by C1 (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRecord {
	pub timestamp: String,
	pub method: String,
	pub id: Option<JsonRpcId>,
	pub metadata: CaptureMetadata,
	pub payload: CapturePayload,
}

impl CaptureRecord {
	pub fn direction(&self) -> Direction {
		match &self.payload {
			CapturePayload::Request(_) => Direction::Request,
			CapturePayload::Response(_) => Direction::Response,
			CapturePayload::SseEvent(_) => Direction::SseEvent,
		}
	}
}
