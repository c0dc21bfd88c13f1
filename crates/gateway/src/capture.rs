//! C3: the capture recorder. Pure builders that turn request/response/SSE
//! inputs into `CaptureRecord`s and hand them to a `CaptureSink` (C1),
//! plus the small JSON-RPC introspection helpers (`initialize` detection,
//! `clientInfo`/`serverInfo` extraction) the spec says this is allowed to
//! do without becoming a protocol interpreter (§1 Non-goals, §4.3).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::warn;

use gateway_core::time::now_iso8601;

use crate::types::{
	CaptureMetadata, CapturePayload, CaptureRecord, ClientInfo, JsonRpcId, RawSseEvent, ServerInfo,
};

/// Persistence seam C3 hands finished records to. Implemented by the
/// storage backend (C1). A failing sink must never propagate a failure
/// back to the proxy's client-facing path (§7) — implementations log and
/// drop internally.
#[async_trait]
pub trait CaptureSink: Send + Sync {
	async fn insert(&self, record: CaptureRecord);
}

/// A no-op sink used in contexts that do not need persistence (tests,
/// stateless probes before a server is registered).
pub struct NullSink;

#[async_trait]
impl CaptureSink for NullSink {
	async fn insert(&self, _record: CaptureRecord) {}
}

pub const METHOD_INITIALIZE: &str = "initialize";

/// Extracts `(method, id)` from a JSON-RPC request object. Returns
/// `method = None` only for malformed objects the proxy should already
/// have rejected with a 400 before reaching the recorder.
pub fn request_method_and_id(value: &Value) -> (Option<String>, Option<JsonRpcId>) {
	let method = value
		.get("method")
		.and_then(Value::as_str)
		.map(|s| s.to_string());
	let id = parse_json_rpc_id(value.get("id"));
	(method, id)
}

pub(crate) fn parse_json_rpc_id(v: Option<&Value>) -> Option<JsonRpcId> {
	match v {
		None => None,
		Some(Value::Null) => Some(JsonRpcId::Null),
		Some(Value::String(s)) => Some(JsonRpcId::String(s.clone())),
		Some(Value::Number(n)) => n.as_i64().map(JsonRpcId::Number),
		Some(_) => None,
	}
}

/// Extracts `params.clientInfo` from an `initialize` request, if present
/// and schema-shaped (§3, §4.5 step 3).
pub fn extract_client_info(request: &Value) -> Option<ClientInfo> {
	let ci = request.get("params")?.get("clientInfo")?;
	serde_json::from_value(ci.clone()).ok()
}

/// Extracts `result.serverInfo` from an `initialize` response, if present
/// (§3, §4.5 step 7).
pub fn extract_server_info(response: &Value) -> Option<ServerInfo> {
	let si = response.get("result")?.get("serverInfo")?;
	serde_json::from_value(si.clone()).ok()
}

/// True if `value` is a syntactically valid JSON-RPC 2.0 response object
/// (has `jsonrpc: "2.0"` and either `result` or `error`).
pub fn looks_like_jsonrpc_response(value: &Value) -> bool {
	let Some(obj) = value.as_object() else {
		return false;
	};
	obj.get("jsonrpc").and_then(Value::as_str) == Some("2.0")
		&& (obj.contains_key("result") || obj.contains_key("error"))
}

/// Wraps a non-JSON-RPC upstream body into the synthetic JSON-RPC error
/// response the spec requires every persisted row to be shaped as (§4.3
/// "Error-response capture"). `id` is the originating request's id, if
/// known, so the synthesized response can still be paired with it (P1).
pub fn synthesize_error_response(http_status: u16, raw_body: &[u8], id: &Option<JsonRpcId>) -> Value {
	let raw_text = String::from_utf8_lossy(raw_body).into_owned();
	let data = match serde_json::from_str::<Value>(&raw_text) {
		Ok(v) => v,
		Err(_) => json!({ "rawBody": raw_text }),
	};
	json!({
		"jsonrpc": "2.0",
		"id": id,
		"error": {
			"code": http_status as i64,
			"message": format!("upstream returned HTTP {http_status}"),
			"data": data,
		}
	})
}

/// Wraps a thrown transport error (connection failure, timeout) into the
/// synthetic JSON-RPC error response the client and the captured row both
/// see (§4.5 "Failure model", §7). Distinct from
/// [`synthesize_error_response`]: a transport error never received an HTTP
/// response at all, so it always carries the fixed JSON-RPC Internal Error
/// code rather than one derived from a (nonexistent) HTTP status.
pub fn synthesize_transport_error_response(id: &Option<JsonRpcId>, detail: &str) -> Value {
	json!({
		"jsonrpc": "2.0",
		"id": id,
		"error": {
			"code": -32603,
			"message": format!("transport error: {detail}"),
		}
	})
}

pub struct RequestInput<'a> {
	pub server: &'a str,
	pub session: &'a str,
	pub request: Value,
	pub client: Option<ClientInfo>,
	pub server_info: Option<ServerInfo>,
	pub user_agent: Option<String>,
	pub client_ip: Option<String>,
}

pub struct ResponseInput<'a> {
	pub server: &'a str,
	pub session: &'a str,
	pub method: String,
	pub id: Option<JsonRpcId>,
	pub response: Value,
	pub http_status: u16,
	pub duration_ms: i64,
	pub client: Option<ClientInfo>,
	pub server_info: Option<ServerInfo>,
}

pub struct SseEventInput<'a> {
	pub server: &'a str,
	pub session: &'a str,
	pub method: String,
	pub id: Option<JsonRpcId>,
	pub frame: RawSseEvent,
	pub http_status: u16,
	pub duration_ms: i64,
	pub client: Option<ClientInfo>,
	pub server_info: Option<ServerInfo>,
}

/// Builds and (via `sink`) persists `CaptureRecord`s. Holds no state of
/// its own — the session identity it stamps onto rows is passed in by the
/// caller (the proxy router, which reads it from C2 before calling here).
pub struct Recorder {
	sink: Arc<dyn CaptureSink>,
}

impl Recorder {
	pub fn new(sink: Arc<dyn CaptureSink>) -> Self {
		Self { sink }
	}

	/// `buildRequest` (§4.3): always written *before* forwarding (§5
	/// ordering guarantee).
	pub async fn record_request(&self, input: RequestInput<'_>) -> CaptureRecord {
		let (method, id) = request_method_and_id(&input.request);
		let record = CaptureRecord {
			timestamp: now_iso8601(),
			method: method.unwrap_or_else(|| "unknown".to_string()),
			id,
			metadata: CaptureMetadata {
				server_name: input.server.to_string(),
				session_id: input.session.to_string(),
				duration_ms: 0,
				http_status: 0,
				client: input.client,
				server: input.server_info,
				user_agent: input.user_agent,
				client_ip: input.client_ip,
			},
			payload: CapturePayload::Request(input.request),
		};
		self.sink.insert(record.clone()).await;
		record
	}

	/// `buildResponse` (§4.3): pairs with the request via the caller-supplied
	/// duration, attaches identity, and applies the error/401 synthesis
	/// rule when `response` isn't a well-formed JSON-RPC response.
	pub async fn record_response(&self, input: ResponseInput<'_>) -> CaptureRecord {
		let payload = if looks_like_jsonrpc_response(&input.response) {
			input.response
		} else {
			warn!(
				server = input.server,
				http_status = input.http_status,
				"upstream response was not valid JSON-RPC; synthesizing error row"
			);
			synthesize_error_response(
				input.http_status,
				input.response.to_string().as_bytes(),
				&input.id,
			)
		};
		let record = CaptureRecord {
			timestamp: now_iso8601(),
			method: input.method,
			id: input.id,
			metadata: CaptureMetadata {
				server_name: input.server.to_string(),
				session_id: input.session.to_string(),
				duration_ms: input.duration_ms,
				http_status: input.http_status,
				client: input.client,
				server: input.server_info,
				user_agent: None,
				client_ip: None,
			},
			payload: CapturePayload::Response(payload),
		};
		self.sink.insert(record.clone()).await;
		record
	}

	/// Same as [`Self::record_response`] but takes the raw, never-parsed
	/// upstream body bytes directly — used on the 401 and generic-error
	/// paths where the body may not parse as JSON at all and the caller
	/// must not round-trip it through a `Value` first, or an unparseable
	/// body silently loses its content before it ever reaches
	/// `synthesize_error_response`'s `{rawBody}` wrapping (§4.3
	/// "Error-response capture").
	#[allow(clippy::too_many_arguments)]
	pub async fn record_raw_error_response(
		&self,
		server: &str,
		session: &str,
		method: String,
		id: Option<JsonRpcId>,
		http_status: u16,
		raw_body: &[u8],
		duration_ms: i64,
		client: Option<ClientInfo>,
		server_info: Option<ServerInfo>,
	) -> CaptureRecord {
		let payload = synthesize_error_response(http_status, raw_body, &id);
		let record = CaptureRecord {
			timestamp: now_iso8601(),
			method,
			id,
			metadata: CaptureMetadata {
				server_name: server.to_string(),
				session_id: session.to_string(),
				duration_ms,
				http_status,
				client,
				server: server_info,
				user_agent: None,
				client_ip: None,
			},
			payload: CapturePayload::Response(payload),
		};
		self.sink.insert(record.clone()).await;
		record
	}

	/// Same shape as [`Self::record_raw_error_response`] but for a thrown
	/// transport error rather than a received HTTP response: `http_status`
	/// is the gateway's own classification (502/504) kept for the metadata
	/// column, while the JSON-RPC `error.code` is always `-32603` (§4.5
	/// "Failure model", §7).
	pub async fn record_transport_error(
		&self,
		server: &str,
		session: &str,
		method: String,
		id: Option<JsonRpcId>,
		http_status: u16,
		detail: &str,
		duration_ms: i64,
	) -> CaptureRecord {
		let payload = synthesize_transport_error_response(&id, detail);
		let record = CaptureRecord {
			timestamp: now_iso8601(),
			method,
			id,
			metadata: CaptureMetadata {
				server_name: server.to_string(),
				session_id: session.to_string(),
				duration_ms,
				http_status,
				client: None,
				server: None,
				user_agent: None,
				client_ip: None,
			},
			payload: CapturePayload::Response(payload),
		};
		self.sink.insert(record.clone()).await;
		record
	}

	/// `buildSseEvent` (§4.3): used for SSE frames that are not embedded
	/// JSON-RPC responses, with a synthetic method label supplied by the
	/// caller (the originating request's method, or `"GET /mcp"`).
	pub async fn record_sse_event(&self, input: SseEventInput<'_>) -> CaptureRecord {
		let record = CaptureRecord {
			timestamp: now_iso8601(),
			method: input.method,
			id: input.id,
			metadata: CaptureMetadata {
				server_name: input.server.to_string(),
				session_id: input.session.to_string(),
				duration_ms: input.duration_ms,
				http_status: input.http_status,
				client: input.client,
				server: input.server_info,
				user_agent: None,
				client_ip: None,
			},
			payload: CapturePayload::SseEvent(input.frame),
		};
		self.sink.insert(record.clone()).await;
		record
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use std::sync::Mutex;

	#[derive(Default)]
	struct VecSink(Mutex<Vec<CaptureRecord>>);

	#[async_trait]
	impl CaptureSink for VecSink {
		async fn insert(&self, record: CaptureRecord) {
			self.0.lock().unwrap().push(record);
		}
	}

	#[test]
	fn extracts_method_and_numeric_id() {
		let req = json!({"jsonrpc":"2.0","id":1,"method":"tools/call","params":{}});
		let (method, id) = request_method_and_id(&req);
		assert_eq!(method.as_deref(), Some("tools/call"));
		assert_eq!(id, Some(JsonRpcId::Number(1)));
	}

	#[test]
	fn extracts_client_info_from_initialize() {
		let req = json!({
			"jsonrpc":"2.0","id":1,"method":"initialize",
			"params":{"clientInfo":{"name":"test-client","version":"1.0.0"}}
		});
		let ci = extract_client_info(&req).unwrap();
		assert_eq!(ci.name, "test-client");
	}

	#[test]
	fn non_jsonrpc_body_is_synthesized_into_error() {
		let body = b"not json at all";
		let value = synthesize_error_response(500, body, &Some(JsonRpcId::Number(2)));
		assert_eq!(value["error"]["code"], 500);
		assert_eq!(value["error"]["data"]["rawBody"], "not json at all");
		assert_eq!(value["id"], 2);
	}

	#[test]
	fn transport_error_always_uses_internal_error_code() {
		let value = synthesize_transport_error_response(&Some(JsonRpcId::Number(7)), "connection refused");
		assert_eq!(value["error"]["code"], -32603);
		assert_eq!(value["id"], 7);
	}

	#[tokio::test]
	async fn record_response_synthesizes_when_not_jsonrpc() {
		let sink = Arc::new(VecSink::default());
		let recorder = Recorder::new(sink.clone());
		recorder
			.record_response(ResponseInput {
				server: "s1",
				session: "stateless",
				method: "tools/call".into(),
				id: Some(JsonRpcId::Number(1)),
				response: json!("plain text, not jsonrpc"),
				http_status: 502,
				duration_ms: 5,
				client: None,
				server_info: None,
			})
			.await;
		let rows = sink.0.lock().unwrap();
		assert_eq!(rows.len(), 1);
		match &rows[0].payload {
			CapturePayload::Response(v) => assert_eq!(v["error"]["code"], 502),
			_ => panic!("expected response payload"),
		}
	}

	#[tokio::test]
	async fn record_raw_error_response_preserves_non_json_body() {
		let sink = Arc::new(VecSink::default());
		let recorder = Recorder::new(sink.clone());
		recorder
			.record_raw_error_response(
				"s1",
				"stateless",
				"tools/call".into(),
				Some(JsonRpcId::Number(1)),
				500,
				b"<html>Internal Server Error</html>",
				5,
				None,
				None,
			)
			.await;
		let rows = sink.0.lock().unwrap();
		match &rows[0].payload {
			CapturePayload::Response(v) => {
				assert_eq!(v["error"]["data"]["rawBody"], "<html>Internal Server Error</html>");
			},
			_ => panic!("expected response payload"),
		}
	}
}
