//! Header construction/filtering for the proxy router (§4.5 step 6, §6
//! "Header contract").

use std::collections::BTreeMap;

use reqwest::header::{
	ACCEPT, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderName,
	HeaderValue, TRANSFER_ENCODING,
};

pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-06-18";
pub const SESSION_ID_HEADER: &str = "mcp-session-id";
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Headers stripped from every upstream response before it reaches the
/// client (§4.5 step 6, §6): they describe the upstream's own transport
/// framing, not ours.
const AUTO_MANAGED_RESPONSE_HEADERS: [HeaderName; 3] =
	[CONTENT_LENGTH, TRANSFER_ENCODING, CONNECTION];

pub struct InboundRequest<'a> {
	pub accept: Option<&'a str>,
	pub authorization: Option<&'a str>,
	pub session_id: Option<&'a str>,
	pub protocol_version: Option<&'a str>,
	pub is_post: bool,
}

/// Builds the outbound header set sent to the upstream (§4.5 step 6, §6):
/// `Content-Type` only for POST, `MCP-Protocol-Version` passed through from
/// the client and defaulted only when absent, the session id forwarded only
/// when the client actually sent one (the gateway never synthesizes one —
/// §1 Non-goals), registered static headers with the auto-managed ones
/// stripped, and the client's `Accept`/`Authorization` passed through
/// verbatim.
pub fn build_outbound_headers(
	inbound: &InboundRequest<'_>,
	registered: &BTreeMap<String, String>,
) -> HeaderMap {
	let mut headers = HeaderMap::new();

	if inbound.is_post {
		headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	}
	let protocol_version = inbound.protocol_version.unwrap_or(DEFAULT_PROTOCOL_VERSION);
	if let Ok(v) = HeaderValue::from_str(protocol_version) {
		headers.insert(HeaderName::from_static(PROTOCOL_VERSION_HEADER), v);
	}
	if let Some(session_id) = inbound.session_id {
		if let Ok(v) = HeaderValue::from_str(session_id) {
			headers.insert(HeaderName::from_static(SESSION_ID_HEADER), v);
		}
	}
	for (name, value) in registered {
		let Ok(header_name) = HeaderName::from_bytes(name.to_lowercase().as_bytes()) else {
			continue;
		};
		if AUTO_MANAGED_RESPONSE_HEADERS.contains(&header_name) {
			continue;
		}
		if let Ok(header_value) = HeaderValue::from_str(value) {
			headers.insert(header_name, header_value);
		}
	}
	if let Some(accept) = inbound.accept {
		if let Ok(v) = HeaderValue::from_str(accept) {
			headers.insert(ACCEPT, v);
		}
	}
	if let Some(auth) = inbound.authorization {
		if let Ok(v) = HeaderValue::from_str(auth) {
			headers.insert(AUTHORIZATION, v);
		}
	}
	headers
}

/// Copies an upstream response's headers onto the client response,
/// dropping the auto-managed ones (§4.5 step 6, §6, P4).
pub fn strip_auto_managed(src: &HeaderMap) -> HeaderMap {
	let mut out = HeaderMap::new();
	for (name, value) in src.iter() {
		if AUTO_MANAGED_RESPONSE_HEADERS.contains(name) {
			continue;
		}
		out.append(name.clone(), value.clone());
	}
	out
}

/// The gateway-owned cookie appended alongside any upstream `Set-Cookie`
/// headers on a 401 pass-through (§4.6, §6, P4).
pub fn gateway_cookie(server_name: &str) -> HeaderValue {
	HeaderValue::from_str(&format!(
		"mcp-gateway-server={server_name}; Path=/.well-known; HttpOnly; SameSite=Lax"
	))
	.unwrap_or_else(|_| HeaderValue::from_static("mcp-gateway-server=; Path=/.well-known"))
}
