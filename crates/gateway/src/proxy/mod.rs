//! C5: the proxy router. Matches `/servers/{name}/mcp` and its `/s/{name}/mcp`
//! alias, drives C2/C3/C4 around a transparent forward to the named
//! upstream, and applies the session-transition rule (§4.5).

pub mod headers;
pub mod tee;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes as AxumBytes};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::BytesMut;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{instrument, warn};

use gateway_core::time::now_iso8601;

use crate::capture::{
	self, Recorder, RequestInput, ResponseInput, SseEventInput, extract_client_info,
	extract_server_info, looks_like_jsonrpc_response,
};
use crate::client;
use crate::error::ProxyError;
use crate::registry::SharedRegistry;
use crate::session::{RequestKey, SessionStore};
use crate::sse::{self, SseDecoder};
use crate::store::SharedStore;
use crate::types::{JsonRpcId, McpServer, STATELESS_SESSION};

use headers::{InboundRequest, PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER, gateway_cookie};

/// Everything the proxy handlers need, wired up once at startup (§9: "the
/// host wires [C1/C2/C3] into C5/C6/C7/C8 at startup").
#[derive(Clone)]
pub struct AppState {
	pub registry: SharedRegistry,
	pub sessions: Arc<SessionStore>,
	pub recorder: Arc<Recorder>,
	pub store: SharedStore,
	pub http: reqwest::Client,
}

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/servers/{name}/mcp", post(post_handler).get(get_handler).delete(delete_handler))
		.route("/s/{name}/mcp", post(post_handler).get(get_handler).delete(delete_handler))
		.with_state(state)
}

fn session_id_from(headers: &HeaderMap) -> String {
	headers
		.get(SESSION_ID_HEADER)
		.and_then(|v| v.to_str().ok())
		.map(|s| s.to_string())
		.unwrap_or_else(|| STATELESS_SESSION.to_string())
}

fn resolve_server(registry: &SharedRegistry, name: &str) -> Result<McpServer, ProxyError> {
	registry
		.get(name)
		.ok_or_else(|| ProxyError::UnknownServer(name.to_string()))
}

fn validate_jsonrpc_request(value: &Value) -> Result<(), ProxyError> {
	let obj = value
		.as_object()
		.ok_or_else(|| ProxyError::MalformedRequest("body is not a JSON object".into()))?;
	if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
		return Err(ProxyError::MalformedRequest("missing jsonrpc: \"2.0\"".into()));
	}
	if !obj.contains_key("method") {
		return Err(ProxyError::MalformedRequest("missing method".into()));
	}
	Ok(())
}

/// Header the client's `Accept`/`Authorization`/connection info the handlers
/// read off the inbound request, kept together so building outbound headers
/// and extracting request metadata both draw from one place. `session_id`
/// and `protocol_version` are the raw inbound header values (not defaulted)
/// so the outbound header set can tell "client sent nothing" apart from
/// "client sent an empty string" — the gateway never synthesizes either
/// (§1 Non-goals, §4.5 step 6).
struct InboundMeta {
	accept: Option<String>,
	authorization: Option<String>,
	user_agent: Option<String>,
	client_ip: Option<String>,
	session_id: Option<String>,
	protocol_version: Option<String>,
}

fn inbound_meta(headers: &HeaderMap, addr: Option<SocketAddr>) -> InboundMeta {
	InboundMeta {
		accept: headers.get(axum::http::header::ACCEPT).and_then(|v| v.to_str().ok()).map(str::to_string),
		authorization: headers
			.get(axum::http::header::AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string),
		user_agent: headers
			.get(axum::http::header::USER_AGENT)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string),
		client_ip: addr.map(|a| a.ip().to_string()),
		session_id: headers
			.get(SESSION_ID_HEADER)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string),
		protocol_version: headers
			.get(PROTOCOL_VERSION_HEADER)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string),
	}
}

#[instrument(skip(state, headers, body), fields(server = %name))]
async fn post_handler(
	State(state): State<AppState>,
	Path(name): Path<String>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
	body: AxumBytes,
) -> Response {
	let server = match resolve_server(&state.registry, &name) {
		Ok(s) => s,
		Err(e) => return e.into_response(),
	};

	let request_value: Value = match serde_json::from_slice(&body) {
		Ok(v) => v,
		Err(e) => return ProxyError::MalformedRequest(e.to_string()).into_response(),
	};
	if let Err(e) = validate_jsonrpc_request(&request_value) {
		return e.into_response();
	}

	let session = session_id_from(&headers);
	let meta = inbound_meta(&headers, Some(addr));
	let (method, id) = capture::request_method_and_id(&request_value);
	let method = method.unwrap_or_else(|| "unknown".to_string());

	if method == capture::METHOD_INITIALIZE {
		if let Some(client_info) = extract_client_info(&request_value) {
			state.sessions.set_client_info(&session, client_info);
		}
	}
	let client = state.sessions.get_client_info(&session);
	let server_info = state.sessions.get_server_info(&session);

	state
		.recorder
		.record_request(RequestInput {
			server: &server.name,
			session: &session,
			request: request_value,
			client: client.clone(),
			server_info: server_info.clone(),
			user_agent: meta.user_agent.clone(),
			client_ip: meta.client_ip.clone(),
		})
		.await;

	if let Some(id) = &id {
		state.sessions.start_request(
			RequestKey {
				server: server.name.clone(),
				session: session.clone(),
				request_id: id.to_string(),
			},
			method.clone(),
		);
	}

	let outbound = headers::build_outbound_headers(
		&InboundRequest {
			accept: meta.accept.as_deref(),
			authorization: meta.authorization.as_deref(),
			session_id: meta.session_id.as_deref(),
			protocol_version: meta.protocol_version.as_deref(),
			is_post: true,
		},
		&server.headers,
	);

	let upstream = match client::forward(&state.http, Method::POST, &mcp_url(&server), outbound, body.to_vec())
		.await
	{
		Ok(r) => r,
		Err(e) => {
			return transport_error_response(&state, &server, &session, &method, &id, e).await;
		},
	};

	handle_upstream_response(
		&state, server, session, method, id, client, server_info, upstream,
	)
	.await
}

#[instrument(skip(state, headers), fields(server = %name))]
async fn get_handler(
	State(state): State<AppState>,
	Path(name): Path<String>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
) -> Response {
	let server = match resolve_server(&state.registry, &name) {
		Ok(s) => s,
		Err(e) => return e.into_response(),
	};
	let session = session_id_from(&headers);
	let meta = inbound_meta(&headers, Some(addr));
	let client = state.sessions.get_client_info(&session);
	let server_info = state.sessions.get_server_info(&session);

	let outbound = headers::build_outbound_headers(
		&InboundRequest {
			accept: meta.accept.as_deref(),
			authorization: meta.authorization.as_deref(),
			session_id: meta.session_id.as_deref(),
			protocol_version: meta.protocol_version.as_deref(),
			is_post: false,
		},
		&server.headers,
	);

	let method_label = "GET /mcp".to_string();
	let upstream = match client::forward(&state.http, Method::GET, &mcp_url(&server), outbound, Vec::new()).await
	{
		Ok(r) => r,
		Err(e) => {
			return transport_error_response(&state, &server, &session, &method_label, &None, e).await;
		},
	};

	handle_upstream_response(
		&state, server, session, method_label, None, client, server_info, upstream,
	)
	.await
}

#[instrument(skip(state, headers), fields(server = %name))]
async fn delete_handler(
	State(state): State<AppState>,
	Path(name): Path<String>,
	headers: HeaderMap,
) -> Response {
	let server = match resolve_server(&state.registry, &name) {
		Ok(s) => s,
		Err(e) => return e.into_response(),
	};
	let meta = inbound_meta(&headers, None);

	let outbound = headers::build_outbound_headers(
		&InboundRequest {
			accept: meta.accept.as_deref(),
			authorization: meta.authorization.as_deref(),
			session_id: meta.session_id.as_deref(),
			protocol_version: meta.protocol_version.as_deref(),
			is_post: false,
		},
		&server.headers,
	);

	// DELETE is pure pass-through (§9 open question (b)): no synthesized
	// errors, whatever the upstream returns (including a 400 for a missing
	// session) goes straight back to the client.
	match client::forward(&state.http, Method::DELETE, &mcp_url(&server), outbound, Vec::new()).await {
		Ok(upstream) => {
			let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
			let resp_headers = headers::strip_auto_managed(upstream.headers());
			let bytes = upstream.bytes().await.unwrap_or_default();
			let mut response = (status, bytes).into_response();
			*response.headers_mut() = resp_headers;
			response
		},
		Err(e) => {
			warn!(server = %server.name, error = %e, "transport error on DELETE");
			StatusCode::BAD_GATEWAY.into_response()
		},
	}
}

fn mcp_url(server: &McpServer) -> String {
	format!("{}/mcp", server.url)
}

/// §4.5 step 7/failure model: a transport error becomes a synthesized
/// `-32603` JSON-RPC response, both returned to the client and captured.
async fn transport_error_response(
	state: &AppState,
	server: &McpServer,
	session: &str,
	method: &str,
	id: &Option<JsonRpcId>,
	err: client::ForwardError,
) -> Response {
	warn!(server = %server.name, error = %err, "transport error calling upstream");
	let duration_ms = id
		.as_ref()
		.and_then(|i| {
			state.sessions.take_duration_ms(&RequestKey {
				server: server.name.clone(),
				session: session.to_string(),
				request_id: i.to_string(),
			})
		})
		.unwrap_or(0);
	let synthetic_status: u16 = if err.is_timeout() { 504 } else { 502 };
	let record = state
		.recorder
		.record_transport_error(
			&server.name,
			session,
			method.to_string(),
			id.clone(),
			synthetic_status,
			&err.to_string(),
			duration_ms,
		)
		.await;
	// Return the exact payload that was captured, so the client-visible
	// response and the persisted row always agree on `id`/`method` (P1)
	// instead of re-deriving a second, differently-shaped error body.
	let body = match record.payload {
		crate::types::CapturePayload::Response(v) => v,
		_ => unreachable!("record_transport_error always builds a Response payload"),
	};
	(StatusCode::OK, axum::Json(body)).into_response()
}

/// Classifies the upstream response and drives the rest of the exchange
/// (§4.5 step 7: 401 / SSE / plain-JSON branches).
async fn handle_upstream_response(
	state: &AppState,
	server: McpServer,
	session: String,
	method: String,
	id: Option<JsonRpcId>,
	client: Option<crate::types::ClientInfo>,
	server_info: Option<crate::types::ServerInfo>,
	upstream: reqwest::Response,
) -> Response {
	let status = upstream.status();
	let http_status = status.as_u16();
	let response_session_header = upstream
		.headers()
		.get(SESSION_ID_HEADER)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string);

	// Session-transition rule applies before the body is handed to the
	// client, identically for SSE and plain-JSON responses (§4.5).
	if session == STATELESS_SESSION {
		if let Some(new_session) = &response_session_header {
			state.sessions.copy_stateless_to(new_session);
		}
	}
	let effective_session = response_session_header.clone().unwrap_or_else(|| session.clone());

	if http_status == 401 {
		return handle_unauthorized(state, &server, &session, &method, &id, upstream).await;
	}

	let is_sse = upstream
		.headers()
		.get(axum::http::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|ct| ct.starts_with("text/event-stream"));

	if is_sse {
		return handle_sse_response(
			state,
			server,
			session,
			effective_session,
			method,
			id,
			client,
			server_info,
			upstream,
		)
		.await;
	}

	handle_plain_response(
		state,
		server,
		session,
		effective_session,
		method,
		id,
		client,
		server_info,
		upstream,
	)
	.await
}

async fn handle_unauthorized(
	state: &AppState,
	server: &McpServer,
	session: &str,
	method: &str,
	id: &Option<JsonRpcId>,
	upstream: reqwest::Response,
) -> Response {
	let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::UNAUTHORIZED);
	let mut resp_headers = headers::strip_auto_managed(upstream.headers());
	resp_headers.append(axum::http::header::SET_COOKIE, gateway_cookie(&server.name));
	let bytes = upstream.bytes().await.unwrap_or_default();

	let duration_ms = id
		.as_ref()
		.and_then(|i| {
			state.sessions.take_duration_ms(&RequestKey {
				server: server.name.clone(),
				session: session.to_string(),
				request_id: i.to_string(),
			})
		})
		.unwrap_or(0);
	state
		.recorder
		.record_raw_error_response(
			&server.name,
			session,
			method.to_string(),
			id.clone(),
			401,
			&bytes,
			duration_ms,
			None,
			None,
		)
		.await;

	let mut response = (status, bytes).into_response();
	*response.headers_mut() = resp_headers;
	response
}

async fn handle_plain_response(
	state: &AppState,
	server: McpServer,
	session: String,
	effective_session: String,
	method: String,
	id: Option<JsonRpcId>,
	client: Option<crate::types::ClientInfo>,
	server_info: Option<crate::types::ServerInfo>,
	upstream: reqwest::Response,
) -> Response {
	let http_status = upstream.status().as_u16();
	let status = StatusCode::from_u16(http_status).unwrap_or(StatusCode::BAD_GATEWAY);
	let resp_headers = headers::strip_auto_managed(upstream.headers());
	let bytes = match upstream.bytes().await {
		Ok(b) => b,
		Err(e) => {
			warn!(server = %server.name, error = %e, "failed to read upstream response body");
			AxumBytes::new()
		},
	};

	// Parsed only to decide *whether* the body is valid JSON and, for
	// `initialize`, to read `serverInfo` out of it. The raw `bytes` stay
	// the source of truth for what gets captured — a body that fails to
	// parse is never replaced with `Value::Null` before it reaches the
	// recorder, or the `{rawBody}` wrapping in `synthesize_error_response`
	// (§4.3 "Error-response capture") would have nothing left to wrap.
	let parsed_response: Option<Value> = serde_json::from_slice(&bytes).ok();
	let duration_ms = id
		.as_ref()
		.and_then(|i| {
			state.sessions.take_duration_ms(&RequestKey {
				server: server.name.clone(),
				session: session.clone(),
				request_id: i.to_string(),
			})
		})
		.unwrap_or(0);

	let mut backfilled_server_info = server_info.clone();
	if method == capture::METHOD_INITIALIZE {
		if let Some(v) = parsed_response.as_ref().filter(|v| looks_like_jsonrpc_response(v)) {
			if let Some(si) = extract_server_info(v) {
				state.sessions.set_server_info(&effective_session, si.clone());
				if let Some(req_id) = &id {
					if let Err(e) = state
						.store
						.update_server_info_for_initialize_request(&server.name, &session, req_id, &si)
						.await
					{
						warn!(error = %e, "failed to backfill initialize request row");
					}
				}
				backfilled_server_info = Some(si);
			}
		}
	}

	match parsed_response {
		Some(response_value) => {
			state
				.recorder
				.record_response(ResponseInput {
					server: &server.name,
					session: &effective_session,
					method: method.clone(),
					id,
					response: response_value,
					http_status,
					duration_ms,
					client,
					server_info: backfilled_server_info,
				})
				.await;
		},
		None => {
			warn!(
				server = %server.name,
				http_status,
				"upstream response body was not valid JSON; synthesizing error row from raw bytes"
			);
			state
				.recorder
				.record_raw_error_response(
					&server.name,
					&effective_session,
					method.clone(),
					id,
					http_status,
					&bytes,
					duration_ms,
					client,
					backfilled_server_info,
				)
				.await;
		},
	}

	if status.is_success() {
		state.registry.update(&server.name, |s| {
			s.exchange_count += 1;
			s.last_activity = Some(now_iso8601());
		});
	}

	let mut response = (status, bytes).into_response();
	*response.headers_mut() = resp_headers;
	response
}

#[allow(clippy::too_many_arguments)]
async fn handle_sse_response(
	state: &AppState,
	server: McpServer,
	session: String,
	effective_session: String,
	method: String,
	id: Option<JsonRpcId>,
	client: Option<crate::types::ClientInfo>,
	server_info: Option<crate::types::ServerInfo>,
	upstream: reqwest::Response,
) -> Response {
	let http_status = upstream.status().as_u16();
	let status = StatusCode::from_u16(http_status).unwrap_or(StatusCode::BAD_GATEWAY);
	let resp_headers = headers::strip_auto_managed(upstream.headers());

	state.registry.update(&server.name, |s| {
		s.exchange_count += 1;
		s.last_activity = Some(now_iso8601());
	});

	let byte_stream = upstream.bytes_stream();
	let (client_stream, parser_rx) = tee::tee(byte_stream);

	spawn_sse_capture(
		state.recorder.clone(),
		state.sessions.clone(),
		server.name.clone(),
		effective_session,
		http_status,
		method,
		id,
		client,
		server_info,
		parser_rx,
	);

	let body = Body::from_stream(client_stream);
	let mut response = (status, body).into_response();
	*response.headers_mut() = resp_headers;
	response
}

/// Background parser side of the SSE tee (§4.5 "SSE branch"): feeds raw
/// bytes through the SSE decoder and turns classified frames into capture
/// rows. Never surfaces a failure back to the client path (§5, §7).
fn spawn_sse_capture(
	recorder: Arc<Recorder>,
	sessions: Arc<SessionStore>,
	server: String,
	session: String,
	http_status: u16,
	initiating_method: String,
	initiating_id: Option<JsonRpcId>,
	client: Option<crate::types::ClientInfo>,
	server_info: Option<crate::types::ServerInfo>,
	mut parser_rx: mpsc::Receiver<AxumBytes>,
) {
	tokio::spawn(async move {
		let mut decoder = SseDecoder::new();
		let mut buf = BytesMut::new();
		while let Some(chunk) = parser_rx.recv().await {
			buf.extend_from_slice(&chunk);
			for frame in sse::drain_ready(&mut decoder, &mut buf) {
				let raw = frame.clone().into();
				match sse::classify(&frame) {
					Some(parsed) if parsed.is_response => {
						let resp_id = capture::parse_json_rpc_id(parsed.value.get("id"));
						// Pair by id via RequestTracker, which also recovers the
						// *actual* originating method (§3 invariant 2) — the frame
						// may be arriving on a different HTTP connection than the
						// one that sent the request (§8 S6: a long-lived GET
						// stream delivering the result of a POST issued later on
						// a separate connection), so `initiating_method` (this
						// connection's own label) cannot be trusted here.
						let (duration_ms, resolved_method) = resp_id
							.as_ref()
							.and_then(|i| {
								sessions.take_request(&RequestKey {
									server: server.clone(),
									session: session.clone(),
									request_id: i.to_string(),
								})
							})
							.unwrap_or((0, initiating_method.clone()));
						recorder
							.record_response(ResponseInput {
								server: &server,
								session: &session,
								method: resolved_method,
								id: resp_id,
								response: parsed.value,
								http_status,
								duration_ms,
								client: client.clone(),
								server_info: server_info.clone(),
							})
							.await;
					},
					_ => {
						recorder
							.record_sse_event(SseEventInput {
								server: &server,
								session: &session,
								method: initiating_method.clone(),
								id: initiating_id.clone(),
								frame: raw,
								http_status,
								duration_ms: 0,
								client: client.clone(),
								server_info: server_info.clone(),
							})
							.await;
					},
				}
			}
		}
	});
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::Registry;
	use crate::store::{LogQueryOptions, SqliteStore};
	use axum::body::Body as AxumBody;
	use axum::http::Request;
	use http_body_util::BodyExt;
	use tower::ServiceExt;
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn test_addr() -> SocketAddr {
		SocketAddr::from(([127, 0, 0, 1], 0))
	}

	async fn test_state(upstream_url: &str) -> AppState {
		let registry = Arc::new(Registry::new());
		registry.add(McpServer::new("server1", upstream_url));
		let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
		AppState {
			registry,
			sessions: Arc::new(SessionStore::new()),
			recorder: Arc::new(Recorder::new(store.clone())),
			store,
			http: client::build_http_client(),
		}
	}

	fn jsonrpc_request(body: &str) -> Request<AxumBody> {
		let mut req = Request::builder()
			.method("POST")
			.uri("/servers/server1/mcp")
			.header("content-type", "application/json")
			.body(AxumBody::from(body.to_string()))
			.unwrap();
		req.extensions_mut().insert(ConnectInfo(test_addr()));
		req
	}

	#[tokio::test]
	async fn unknown_server_returns_404_with_no_capture() {
		let state = test_state("http://127.0.0.1:1").await;
		let app = router(state.clone());
		let mut req = Request::builder()
			.method("POST")
			.uri("/servers/nope/mcp")
			.header("content-type", "application/json")
			.body(AxumBody::from(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call"}"#))
			.unwrap();
		req.extensions_mut().insert(ConnectInfo(test_addr()));

		let resp = app.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::NOT_FOUND);

		let result = state.store.query(&LogQueryOptions::new()).await.unwrap();
		assert_eq!(result.records.len(), 0);
	}

	#[tokio::test]
	async fn routes_post_to_registered_upstream_and_captures_both_rows() {
		let upstream = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/mcp"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"jsonrpc": "2.0", "id": 1, "result": {"content": [{"type": "text", "text": "hi"}]}
			})))
			.mount(&upstream)
			.await;

		let state = test_state(&upstream.uri()).await;
		let app = router(state.clone());

		let req = jsonrpc_request(
			r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo","arguments":{"message":"hi"}}}"#,
		);
		let resp = app.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		let value: Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(value["result"]["content"][0]["text"], "hi");

		let mut opts = LogQueryOptions::new();
		opts.server.values = vec!["server1".into()];
		let result = state.store.query(&opts).await.unwrap();
		assert_eq!(result.records.len(), 2);
	}

	#[tokio::test]
	async fn session_less_request_never_forwards_the_bookkeeping_sentinel() {
		let upstream = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/mcp"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"jsonrpc": "2.0", "id": 1, "result": {}
			})))
			.mount(&upstream)
			.await;

		let state = test_state(&upstream.uri()).await;
		let app = router(state.clone());
		let req = jsonrpc_request(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call"}"#);
		let resp = app.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);

		let received = upstream.received_requests().await.unwrap();
		assert_eq!(received.len(), 1);
		// "stateless" is only the internal C2 bookkeeping key (§1 Non-goals):
		// a client that never sent Mcp-Session-Id must not see it echoed
		// upstream, synthesized or otherwise.
		assert!(received[0].headers.get(SESSION_ID_HEADER).is_none());
	}

	#[tokio::test]
	async fn session_transition_backfills_and_copies_identity() {
		let upstream = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/mcp"))
			.respond_with(
				ResponseTemplate::new(200)
					.insert_header("mcp-session-id", "ABC")
					.set_body_json(serde_json::json!({
						"jsonrpc": "2.0", "id": 1,
						"result": {"serverInfo": {"name": "server1", "version": "1.0.0"}}
					})),
			)
			.mount(&upstream)
			.await;

		let state = test_state(&upstream.uri()).await;
		let app = router(state.clone());
		let req = jsonrpc_request(
			r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"clientInfo":{"name":"test-client","version":"1.0.0"}}}"#,
		);
		let resp = app.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);

		assert_eq!(state.sessions.get_client_info("ABC").unwrap().name, "test-client");
		assert_eq!(state.sessions.get_server_info("ABC").unwrap().version, "1.0.0");

		let mut opts = LogQueryOptions::new();
		opts.session.values = vec!["stateless".into()];
		let result = state.store.query(&opts).await.unwrap();
		let request_row = result
			.records
			.iter()
			.find(|r| matches!(r.payload, crate::types::CapturePayload::Request(_)))
			.expect("request row present");
		assert_eq!(request_row.metadata.server.as_ref().unwrap().version, "1.0.0");
	}

	#[tokio::test]
	async fn transport_error_response_matches_captured_row() {
		// Nothing listens on this port: reqwest fails fast with a connection
		// error rather than timing out.
		let state = test_state("http://127.0.0.1:1").await;
		let app = router(state.clone());
		let req = jsonrpc_request(r#"{"jsonrpc":"2.0","id":7,"method":"tools/call"}"#);

		let resp = app.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		let client_value: Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(client_value["id"], 7);
		assert_eq!(client_value["error"]["code"], -32603);

		let result = state.store.query(&LogQueryOptions::new()).await.unwrap();
		let response_row = result
			.records
			.iter()
			.find(|r| matches!(r.payload, crate::types::CapturePayload::Response(_)))
			.expect("error response row present");
		let captured = match &response_row.payload {
			crate::types::CapturePayload::Response(v) => v,
			_ => unreachable!(),
		};
		assert_eq!(captured, &client_value);
	}

	/// §8 S6: a long-lived `GET .../mcp` SSE stream delivers the result of a
	/// `tools/call` request that was actually sent on a separate POST
	/// connection. The frame's `id` pairs with the POST's RequestTracker
	/// entry, so the captured row's `method` must come from that entry —
	/// not from `"GET /mcp"`, this connection's own label (§3 invariant 2:
	/// "they agree on `method`").
	#[tokio::test]
	async fn sse_response_frame_uses_tracked_request_method_not_initiating_label() {
		let upstream = MockServer::start().await;
		let sse_body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":5,\"result\":{\"content\":[]}}\n\n";
		Mock::given(method("GET"))
			.and(path("/mcp"))
			.respond_with(ResponseTemplate::new(200).set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"))
			.mount(&upstream)
			.await;

		let state = test_state(&upstream.uri()).await;

		// Simulate the in-flight POST on another connection that already
		// sent request id 5 as "tools/call" and is waiting for its result
		// to arrive on the already-open GET stream.
		state.sessions.start_request(
			RequestKey {
				server: "server1".into(),
				session: "SESS".into(),
				request_id: "5".into(),
			},
			"tools/call".into(),
		);

		let app = router(state.clone());
		let mut req = Request::builder()
			.method("GET")
			.uri("/servers/server1/mcp")
			.header("mcp-session-id", "SESS")
			.body(AxumBody::empty())
			.unwrap();
		req.extensions_mut().insert(ConnectInfo(test_addr()));

		let resp = app.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		// Drain the client-visible body so the tee's forwarding task runs to
		// completion and the background parser gets every chunk.
		let _ = resp.into_body().collect().await.unwrap().to_bytes();
		// The parser runs on its own spawned task; give it a turn.
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;

		let mut opts = LogQueryOptions::new();
		opts.server.values = vec!["server1".into()];
		let result = state.store.query(&opts).await.unwrap();
		let response_row = result
			.records
			.iter()
			.find(|r| matches!(r.payload, crate::types::CapturePayload::Response(_)))
			.expect("sse response row captured");
		assert_eq!(response_row.method, "tools/call");
	}
}
