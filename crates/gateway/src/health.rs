//! C7: the health checker. Periodically probes every registered upstream
//! with a synthetic `initialize` request and records the result on its
//! `McpServer` entry in the registry (§4.7).

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gateway_core::time::now_iso8601;

use crate::client::{self, HEALTH_CHECK_TIMEOUT};
use crate::registry::SharedRegistry;
use crate::types::HealthStatus;

/// Bounds how many upstreams are probed concurrently within a single tick
/// (§4.7 "Concurrent checks per tick are bounded by a fixed pool").
const MAX_CONCURRENT_CHECKS: usize = 8;

#[derive(Debug, Error)]
pub enum HealthCheckError {
	#[error("server not registered: {0}")]
	ServerNotFound(String),
}

/// One `{name, health, lastHealthCheck}` entry of a tick's update batch
/// (§4.7), handed to the registered observer callback.
#[derive(Debug, Clone)]
pub struct HealthUpdate {
	pub name: String,
	pub health: HealthStatus,
	pub last_health_check: String,
}

pub type HealthObserver = Arc<dyn Fn(Vec<HealthUpdate>) + Send + Sync>;

pub struct HealthChecker {
	registry: SharedRegistry,
	http: reqwest::Client,
	interval: Duration,
	observer: Option<HealthObserver>,
}

impl HealthChecker {
	pub fn new(registry: SharedRegistry, http: reqwest::Client, interval: Duration) -> Self {
		Self { registry, http, interval, observer: None }
	}

	pub fn with_observer(mut self, observer: HealthObserver) -> Self {
		self.observer = Some(observer);
		self
	}

	/// Runs the periodic probe loop until `cancel` fires. Intended to be
	/// driven from a single long-lived `tokio::spawn`.
	pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
		let mut ticker = tokio::time::interval(self.interval);
		loop {
			tokio::select! {
				_ = cancel.cancelled() => {
					debug!("health checker stopped");
					return;
				},
				_ = ticker.tick() => {
					self.tick().await;
				},
			}
		}
	}

	/// Probes every registered server concurrently, bounded by
	/// `MAX_CONCURRENT_CHECKS`, and emits a single update batch to the
	/// observer once the tick completes.
	async fn tick(&self) {
		let servers = self.registry.list();
		if servers.is_empty() {
			return;
		}
		let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_CHECKS));
		let updates: Vec<HealthUpdate> = stream::iter(servers.into_iter().map(|server| {
			let semaphore = semaphore.clone();
			async move {
				let _permit = semaphore.acquire().await.expect("semaphore never closed");
				self.probe_and_record(&server.name, &server.url, &server.headers).await
			}
		}))
		.buffer_unordered(MAX_CONCURRENT_CHECKS)
		.collect()
		.await;

		if let Some(observer) = &self.observer {
			observer(updates);
		}
	}

	/// Manual single-server trigger (§4.7 `checkOne`).
	pub async fn check_one(&self, name: &str) -> Result<HealthUpdate, HealthCheckError> {
		let server = self
			.registry
			.get(name)
			.ok_or_else(|| HealthCheckError::ServerNotFound(name.to_string()))?;
		Ok(self.probe_and_record(&server.name, &server.url, &server.headers).await)
	}

	async fn probe_and_record(
		&self,
		name: &str,
		url: &str,
		registered_headers: &std::collections::BTreeMap<String, String>,
	) -> HealthUpdate {
		let status = self.probe(url, registered_headers).await;
		let checked_at = now_iso8601();
		self.registry.update(name, |server| {
			server.health = status;
			server.last_health_check = Some(checked_at.clone());
		});
		HealthUpdate { name: name.to_string(), health: status, last_health_check: checked_at }
	}

	/// Issues the synthetic `initialize` probe. No `Authorization` header is
	/// sent (§4.7: "no authorization") even if one is among the registered
	/// static headers.
	async fn probe(&self, url: &str, registered_headers: &std::collections::BTreeMap<String, String>) -> HealthStatus {
		let mut headers = reqwest::header::HeaderMap::new();
		headers.insert(
			reqwest::header::CONTENT_TYPE,
			reqwest::header::HeaderValue::from_static("application/json"),
		);
		for (name, value) in registered_headers {
			if name.eq_ignore_ascii_case("authorization") {
				continue;
			}
			let Ok(header_name) = reqwest::header::HeaderName::from_bytes(name.to_lowercase().as_bytes()) else {
				continue;
			};
			if let Ok(header_value) = reqwest::header::HeaderValue::from_str(value) {
				headers.insert(header_name, header_value);
			}
		}

		let body = json!({
			"jsonrpc": "2.0",
			"id": "health-check",
			"method": "initialize",
			"params": {
				"protocolVersion": crate::proxy::headers::DEFAULT_PROTOCOL_VERSION,
				"capabilities": {},
				"clientInfo": { "name": "mcp-gateway-health", "version": env!("CARGO_PKG_VERSION") },
			}
		});
		let body_bytes = serde_json::to_vec(&body).unwrap_or_default();

		let mcp_url = if url.ends_with("/mcp") { url.to_string() } else { format!("{url}/mcp") };
		match tokio::time::timeout(
			HEALTH_CHECK_TIMEOUT,
			client::forward(&self.http, reqwest::Method::POST, &mcp_url, headers, body_bytes),
		)
		.await
		{
			Ok(Ok(resp)) if resp.status().is_success() => HealthStatus::Up,
			Ok(Ok(resp)) => {
				warn!(url = %mcp_url, status = %resp.status(), "health probe returned non-2xx");
				HealthStatus::Down
			},
			Ok(Err(e)) => {
				warn!(url = %mcp_url, error = %e, "health probe transport error");
				HealthStatus::Down
			},
			Err(_) => {
				warn!(url = %mcp_url, "health probe timed out");
				HealthStatus::Down
			},
		}
	}
}

/// Spawns the checker's loop on the current tokio runtime. Returns the
/// `CancellationToken` the caller should trigger on shutdown.
pub fn spawn(checker: Arc<HealthChecker>) -> CancellationToken {
	let cancel = CancellationToken::new();
	let token = cancel.clone();
	tokio::spawn(async move {
		info!("health checker started");
		checker.run(token).await;
	});
	cancel
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::Registry;
	use crate::types::McpServer;
	use std::sync::Mutex;
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	#[tokio::test]
	async fn check_one_marks_up_on_2xx() {
		let upstream = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/mcp"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"jsonrpc": "2.0", "id": "health-check", "result": { "serverInfo": { "version": "1.0" } }
			})))
			.mount(&upstream)
			.await;

		let registry = Arc::new(Registry::new());
		registry.add(McpServer::new("server1", format!("{}/mcp", upstream.uri())));
		let checker = HealthChecker::new(registry.clone(), client::build_http_client(), Duration::from_secs(60));

		let update = checker.check_one("server1").await.unwrap();
		assert_eq!(update.health, HealthStatus::Up);
		assert_eq!(registry.get("server1").unwrap().health, HealthStatus::Up);
	}

	#[tokio::test]
	async fn check_one_marks_down_on_5xx() {
		let upstream = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/mcp"))
			.respond_with(ResponseTemplate::new(500))
			.mount(&upstream)
			.await;

		let registry = Arc::new(Registry::new());
		registry.add(McpServer::new("server1", format!("{}/mcp", upstream.uri())));
		let checker = HealthChecker::new(registry.clone(), client::build_http_client(), Duration::from_secs(60));

		let update = checker.check_one("server1").await.unwrap();
		assert_eq!(update.health, HealthStatus::Down);
	}

	#[tokio::test]
	async fn check_one_unknown_server_errors() {
		let registry = Arc::new(Registry::new());
		let checker = HealthChecker::new(registry, client::build_http_client(), Duration::from_secs(60));
		let err = checker.check_one("nope").await.unwrap_err();
		assert!(matches!(err, HealthCheckError::ServerNotFound(name) if name == "nope"));
	}

	#[tokio::test]
	async fn tick_emits_batch_to_observer() {
		let upstream = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/mcp"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"jsonrpc": "2.0", "id": "health-check", "result": {}
			})))
			.mount(&upstream)
			.await;

		let registry = Arc::new(Registry::new());
		registry.add(McpServer::new("server1", format!("{}/mcp", upstream.uri())));
		registry.add(McpServer::new("server2", format!("{}/mcp", upstream.uri())));

		let seen: Arc<Mutex<Vec<HealthUpdate>>> = Arc::new(Mutex::new(Vec::new()));
		let seen_clone = seen.clone();
		let checker = HealthChecker::new(registry, client::build_http_client(), Duration::from_secs(60))
			.with_observer(Arc::new(move |updates| {
				seen_clone.lock().unwrap().extend(updates);
			}));

		checker.tick().await;
		assert_eq!(seen.lock().unwrap().len(), 2);
	}
}
