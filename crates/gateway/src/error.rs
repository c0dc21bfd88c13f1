//! Error taxonomy for the proxy (`ProxyError`) and query API (`ApiError`)
//! seams, shaped after the teacher's `mcp::Error` / `ProxyError` split
//! (§5.2 of SPEC_FULL.md, §7 of spec.md).

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Errors surfaced while validating/routing a request before it reaches an
/// upstream (§7: client input error, unknown upstream). Transport errors
/// and invalid upstream responses are handled separately, synthesized
/// through `capture::synthesize_error_response` so the client-visible body
/// and the captured row are built from the same value (P1) rather than
/// two independently-constructed JSON-RPC error bodies.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("unknown server {0:?}")]
	UnknownServer(String),
	#[error("malformed JSON-RPC request: {0}")]
	MalformedRequest(String),
}

impl ProxyError {
	/// JSON-RPC `code` to use when this error is synthesized into a
	/// response body.
	pub fn jsonrpc_code(&self) -> i64 {
		match self {
			ProxyError::MalformedRequest(_) => -32700,
			ProxyError::UnknownServer(_) => -32601,
		}
	}
}

impl IntoResponse for ProxyError {
	fn into_response(self) -> Response {
		let status = match &self {
			ProxyError::UnknownServer(_) => StatusCode::NOT_FOUND,
			ProxyError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
		};
		let body = json!({
			"jsonrpc": "2.0",
			"id": null,
			"error": {
				"code": self.jsonrpc_code(),
				"message": self.to_string(),
			}
		});
		(status, Json(body)).into_response()
	}
}

/// Errors surfaced by the query API (§4.9, §7: `400 INVALID_PARAM`, `500`
/// on read failure).
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
	#[error("invalid query parameter: {0}")]
	InvalidParam(String),
	#[error("storage read failed: {0}")]
	Storage(#[source] anyhow::Error),
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let (status, code) = match &self {
			ApiError::InvalidParam(_) => (StatusCode::BAD_REQUEST, "INVALID_PARAM"),
			ApiError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
		};
		let body = json!({
			"error": {
				"code": code,
				"message": self.to_string(),
			}
		});
		(status, Json(body)).into_response()
	}
}
