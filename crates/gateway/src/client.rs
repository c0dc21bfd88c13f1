//! Thin wrapper around `reqwest` for calling upstream MCP servers. Shared
//! by the proxy router (C5), OAuth pass-through (C6), and health checker
//! (C7) so all three inherit the same timeout/redirect policy.

use std::time::Duration;

use reqwest::{Client, Method, Response};

/// Default upstream forwarding timeout for non-SSE exchanges (§5
/// "Timeouts"). SSE reads are not subject to this — the caller issues the
/// request with this client but then reads the body stream without a
/// further deadline.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Short timeout for health-check probes (§4.7, §5).
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the shared `reqwest::Client`. Redirects are disabled: MCP
/// servers do not redirect, and transparently following one would change
/// which upstream we believe we captured traffic for.
pub fn build_http_client() -> Client {
	Client::builder()
		.redirect(reqwest::redirect::Policy::none())
		.build()
		.expect("static reqwest client configuration is valid")
}

/// Issues `method` against `url` with `body`/`headers`. Bounds only the
/// time to receive a response (status + headers) with `FORWARD_TIMEOUT`;
/// reqwest's own `.timeout()` would instead bound the *whole* exchange
/// including streaming the body, which would cut off long-lived SSE
/// streams the spec requires to be unbounded (§5 "Timeouts": "SSE reads
/// are unbounded; the reader is only terminated by close"). Returns the
/// raw `reqwest::Response` so the caller can inspect status/content-type
/// before deciding how to consume the body (plain JSON vs SSE, §4.5 step
/// 7) — body streaming itself is never subject to this deadline.
pub async fn forward(
	client: &Client,
	method: Method,
	url: &str,
	headers: reqwest::header::HeaderMap,
	body: Vec<u8>,
) -> Result<Response, ForwardError> {
	let send = client.request(method, url).headers(headers).body(body).send();
	match tokio::time::timeout(FORWARD_TIMEOUT, send).await {
		Ok(result) => result.map_err(ForwardError::Transport),
		Err(_) => Err(ForwardError::Timeout),
	}
}

/// Forwarding failure: either reqwest itself errored, or the response
/// didn't arrive within `FORWARD_TIMEOUT`.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
	#[error("transport error: {0}")]
	Transport(#[from] reqwest::Error),
	#[error("upstream did not respond within {FORWARD_TIMEOUT:?}")]
	Timeout,
}

impl ForwardError {
	pub fn is_timeout(&self) -> bool {
		matches!(self, ForwardError::Timeout)
	}
}
