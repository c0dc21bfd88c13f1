//! C6: OAuth discovery/registration pass-through. Proxies the well-known
//! discovery documents and Dynamic Client Registration verbatim to the
//! named upstream's base URL (§4.6). Token exchange itself is out of scope
//! (§1 Non-goals) — this module only forwards bytes.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes as AxumBytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use reqwest::Method;
use serde_json::json;
use tracing::warn;

use crate::client;
use crate::proxy::headers::gateway_cookie;
use crate::registry::SharedRegistry;
use crate::types::McpServer;

#[derive(Clone)]
pub struct OAuthState {
	pub registry: SharedRegistry,
	pub http: reqwest::Client,
}

pub fn router(state: OAuthState) -> Router {
	Router::new()
		.route("/.well-known/{doc}/servers/{name}/mcp", get(discovery_with_server))
		.route("/.well-known/{doc}/s/{name}/mcp", get(discovery_with_server))
		.route("/servers/{name}/mcp/.well-known/{doc}", get(discovery_alt_layout))
		.route("/s/{name}/mcp/.well-known/{doc}", get(discovery_alt_layout))
		.route("/servers/{name}/mcp/register", post(register))
		.route("/s/{name}/mcp/register", post(register))
		.route("/.well-known/{doc}", get(discovery_no_server))
		.with_state(state)
}

/// Strips a trailing `/mcp` path segment from a registered server's URL to
/// get the upstream's base, e.g. `http://u1/mcp` → `http://u1` (§4.6).
fn upstream_base(server: &McpServer) -> String {
	server.url.strip_suffix("/mcp").unwrap_or(&server.url).to_string()
}

async fn discovery_with_server(
	State(state): State<OAuthState>,
	Path((doc, name)): Path<(String, String)>,
	headers: HeaderMap,
) -> Response {
	forward_well_known(&state, &name, &doc, &headers).await
}

async fn discovery_alt_layout(
	State(state): State<OAuthState>,
	Path((name, doc)): Path<(String, String)>,
	headers: HeaderMap,
) -> Response {
	forward_well_known(&state, &name, &doc, &headers).await
}

async fn discovery_no_server(Path(_doc): Path<String>) -> Response {
	(
		StatusCode::BAD_REQUEST,
		Json(json!({ "error": "server_not_specified" })),
	)
		.into_response()
}

async fn forward_well_known(state: &OAuthState, name: &str, doc: &str, headers: &HeaderMap) -> Response {
	let Some(server) = state.registry.get(name) else {
		return StatusCode::NOT_FOUND.into_response();
	};
	let url = format!("{}/.well-known/{doc}", upstream_base(&server));
	forward_passthrough(state, &server, Method::GET, &url, headers, Vec::new()).await
}

async fn register(
	State(state): State<OAuthState>,
	Path(name): Path<String>,
	headers: HeaderMap,
	body: AxumBytes,
) -> Response {
	let Some(server) = state.registry.get(&name) else {
		return StatusCode::NOT_FOUND.into_response();
	};
	let url = format!("{}/register", upstream_base(&server));
	forward_passthrough(&state, &server, Method::POST, &url, &headers, body.to_vec()).await
}

/// Forwards verbatim, reusing the proxy's header-stripping policy. On a 401
/// response, preserves every upstream `Set-Cookie` and appends the
/// gateway-owned cookie identifying which server this 401 came from (§4.6,
/// §6, P4) — needed here too since discovery/registration share the same
/// browser-facing OAuth flow as the MCP endpoint.
async fn forward_passthrough(
	state: &OAuthState,
	server: &McpServer,
	method: Method,
	url: &str,
	headers: &HeaderMap,
	body: Vec<u8>,
) -> Response {
	let mut outbound = reqwest::header::HeaderMap::new();
	if let Some(accept) = headers.get(axum::http::header::ACCEPT) {
		outbound.insert(axum::http::header::ACCEPT, accept.clone());
	}
	if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) {
		outbound.insert(axum::http::header::AUTHORIZATION, auth.clone());
	}
	if method == Method::POST {
		if let Some(ct) = headers.get(axum::http::header::CONTENT_TYPE) {
			outbound.insert(axum::http::header::CONTENT_TYPE, ct.clone());
		}
	}
	for (name, value) in &server.headers {
		let Ok(header_name) = reqwest::header::HeaderName::from_bytes(name.to_lowercase().as_bytes()) else {
			continue;
		};
		if let Ok(header_value) = reqwest::header::HeaderValue::from_str(value) {
			outbound.insert(header_name, header_value);
		}
	}

	match client::forward(&state.http, method, url, outbound, body).await {
		Ok(upstream) => {
			let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
			let mut resp_headers = crate::proxy::headers::strip_auto_managed(upstream.headers());
			if status == StatusCode::UNAUTHORIZED {
				resp_headers.append(axum::http::header::SET_COOKIE, gateway_cookie(&server.name));
			}
			let bytes = upstream.bytes().await.unwrap_or_default();
			let mut response = (status, bytes).into_response();
			*response.headers_mut() = resp_headers;
			response
		},
		Err(e) => {
			warn!(server = %server.name, error = %e, "transport error on OAuth pass-through");
			StatusCode::BAD_GATEWAY.into_response()
		},
	}
}
