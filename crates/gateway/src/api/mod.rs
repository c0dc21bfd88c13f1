//! C8: the query API. Read-only aggregations and the expanded `GET /logs`
//! view over C1, plus the clear endpoint that empties C1 and C2 together
//! (§4.9).

mod filters;

use std::cmp::Ordering;
use std::sync::Arc;

use axum::extract::{Path, Query, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ApiError;
use crate::registry::SharedRegistry;
use crate::session::SessionStore;
use crate::store::{ApiLogEntry, SharedStore};
use crate::types::{CapturePayload, CaptureRecord, Direction, McpServer};

#[derive(Clone)]
pub struct ApiState {
	pub store: SharedStore,
	pub sessions: Arc<SessionStore>,
	pub registry: SharedRegistry,
}

pub fn router(state: ApiState) -> Router {
	Router::new()
		.route("/logs", get(get_logs))
		.route("/logs/clear", post(clear_logs))
		.route("/servers", get(get_servers))
		.route("/servers/{name}", get(get_server))
		.route("/sessions", get(get_sessions))
		.route("/clients", get(get_clients))
		.route("/methods", get(get_methods))
		.route("/healthz", get(healthz))
		.with_state(state)
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerScope {
	server: Option<String>,
}

#[derive(Serialize)]
struct Pagination {
	#[serde(rename = "hasMore")]
	has_more: bool,
	#[serde(rename = "oldestTimestamp")]
	oldest_timestamp: Option<String>,
	#[serde(rename = "newestTimestamp")]
	newest_timestamp: Option<String>,
}

async fn get_logs(State(state): State<ApiState>, RawQuery(raw): RawQuery) -> Response {
	match get_logs_inner(&state, raw.as_deref().unwrap_or("")).await {
		Ok(body) => (StatusCode::OK, Json(body)).into_response(),
		Err(e) => e.into_response(),
	}
}

async fn get_logs_inner(state: &ApiState, raw: &str) -> Result<serde_json::Value, ApiError> {
	let opts = filters::parse(raw)?;
	let result = state
		.store
		.query(&opts)
		.await
		.map_err(|e| ApiError::Storage(e.into()))?;

	let mut entries: Vec<ApiLogEntry> = result
		.records
		.into_iter()
		.zip(result.row_ids.into_iter())
		.map(|(record, id)| record_to_entry(id, record))
		.collect();
	// Order within a record is request before response before sse-event
	// (§4.9), independent of the overall timestamp sort direction.
	entries.sort_by(|a, b| {
		let primary = a.timestamp.cmp(&b.timestamp);
		let primary = match opts.order {
			crate::store::Order::Desc => primary.reverse(),
			crate::store::Order::Asc => primary,
		};
		primary.then_with(|| direction_rank(a.direction).cmp(&direction_rank(b.direction)))
	});

	Ok(json!({
		"data": entries,
		"pagination": Pagination {
			has_more: result.has_more,
			oldest_timestamp: result.oldest_timestamp,
			newest_timestamp: result.newest_timestamp,
		},
	}))
}

fn direction_rank(d: Direction) -> u8 {
	match d {
		Direction::Request => 0,
		Direction::Response => 1,
		Direction::SseEvent => 2,
	}
}

fn record_to_entry(id: i64, record: CaptureRecord) -> ApiLogEntry {
	let direction = record.direction();
	let payload = match record.payload {
		CapturePayload::Request(v) => v,
		CapturePayload::Response(v) => v,
		CapturePayload::SseEvent(ev) => serde_json::to_value(ev).unwrap_or(serde_json::Value::Null),
	};
	ApiLogEntry {
		id,
		timestamp: record.timestamp,
		method: record.method,
		request_id: record.id,
		direction,
		server_name: record.metadata.server_name,
		session_id: record.metadata.session_id,
		duration_ms: record.metadata.duration_ms,
		http_status: record.metadata.http_status,
		payload,
		client: record.metadata.client,
		server: record.metadata.server,
	}
}

async fn clear_logs(State(state): State<ApiState>) -> Response {
	match state.store.clear_all().await {
		Ok(()) => {
			state.sessions.clear_all();
			StatusCode::NO_CONTENT.into_response()
		},
		Err(e) => ApiError::Storage(e.into()).into_response(),
	}
}

#[derive(Serialize)]
struct ServerListEntry {
	#[serde(rename = "serverName")]
	server_name: String,
	#[serde(rename = "logCount")]
	log_count: i64,
	#[serde(rename = "sessionCount")]
	session_count: i64,
	status: &'static str,
}

async fn get_servers(State(state): State<ApiState>) -> Response {
	match state.store.get_servers().await {
		Ok(aggregates) => {
			let mut by_name: std::collections::BTreeMap<String, ServerListEntry> = aggregates
				.into_iter()
				.map(|a| {
					let status = if state.registry.contains(&a.server_name) { "online" } else { "deleted" };
					(
						a.server_name.clone(),
						ServerListEntry {
							server_name: a.server_name,
							log_count: a.log_count,
							session_count: a.session_count,
							status,
						},
					)
				})
				.collect();
			// §4.8: registry entries with no logs still appear, with counts 0.
			for server in state.registry.list() {
				by_name.entry(server.name.clone()).or_insert(ServerListEntry {
					server_name: server.name,
					log_count: 0,
					session_count: 0,
					status: "online",
				});
			}
			let entries: Vec<ServerListEntry> = by_name.into_values().collect();
			(StatusCode::OK, Json(entries)).into_response()
		},
		Err(e) => ApiError::Storage(e.into()).into_response(),
	}
}

/// `GET /servers/:name` (§6 of SPEC_FULL.md: supplemented single-server
/// registry lookup alongside the aggregated `GET /servers`).
async fn get_server(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
	match state.registry.get(&name) {
		Some(server) => (StatusCode::OK, Json(server)).into_response(),
		None => StatusCode::NOT_FOUND.into_response(),
	}
}

async fn get_sessions(State(state): State<ApiState>, Query(scope): Query<ServerScope>) -> Response {
	match state.store.get_sessions(scope.server.as_deref()).await {
		Ok(sessions) => (StatusCode::OK, Json(sessions)).into_response(),
		Err(e) => ApiError::Storage(e.into()).into_response(),
	}
}

async fn get_clients(State(state): State<ApiState>) -> Response {
	match state.store.get_clients().await {
		Ok(clients) => (StatusCode::OK, Json(clients)).into_response(),
		Err(e) => ApiError::Storage(e.into()).into_response(),
	}
}

async fn get_methods(State(state): State<ApiState>, Query(scope): Query<ServerScope>) -> Response {
	match state.store.get_methods(scope.server.as_deref()).await {
		Ok(methods) => (StatusCode::OK, Json(methods)).into_response(),
		Err(e) => ApiError::Storage(e.into()).into_response(),
	}
}

/// `GET /healthz` (§6 of SPEC_FULL.md: supplemented liveness endpoint for
/// the host process, distinct from the upstream health checker).
async fn healthz() -> Response {
	let build = gateway_core::BuildInfo::current();
	(StatusCode::OK, Json(json!({ "status": "ok", "version": build.pkg_version }))).into_response()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::capture::CaptureSink;
	use crate::registry::Registry;
	use crate::store::SqliteStore;
	use crate::types::{CaptureMetadata, JsonRpcId};
	use axum::body::Body as AxumBody;
	use axum::http::Request;
	use http_body_util::BodyExt;
	use tower::ServiceExt;

	async fn test_state() -> (ApiState, Arc<SqliteStore>) {
		let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
		let registry = Arc::new(Registry::new());
		registry.add(McpServer::new("server1", "http://u1/mcp"));
		let state = ApiState { store: store.clone(), sessions: Arc::new(SessionStore::new()), registry };
		(state, store)
	}

	async fn seed(store: &SqliteStore, server: &str, method: &str, payload: CapturePayload) {
		store
			.insert(CaptureRecord {
				timestamp: gateway_core::time::now_iso8601(),
				method: method.to_string(),
				id: Some(JsonRpcId::Number(1)),
				metadata: CaptureMetadata {
					server_name: server.to_string(),
					session_id: "s".to_string(),
					duration_ms: 5,
					http_status: 200,
					..Default::default()
				},
				payload,
			})
			.await;
	}

	#[tokio::test]
	async fn get_logs_expands_request_and_response_rows() {
		let (state, store) = test_state().await;
		seed(&store, "server1", "tools/call", CapturePayload::Request(json!({"jsonrpc":"2.0","id":1,"method":"tools/call"}))).await;
		seed(&store, "server1", "tools/call", CapturePayload::Response(json!({"jsonrpc":"2.0","id":1,"result":{}}))).await;

		let app = router(state);
		let req = Request::builder().uri("/logs?server=server1").body(AxumBody::empty()).unwrap();
		let resp = app.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		let bytes = resp.into_body().collect().await.unwrap().to_bytes();
		let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(body["data"].as_array().unwrap().len(), 2);
		assert_eq!(body["data"][0]["direction"], "request");
		assert_eq!(body["data"][1]["direction"], "response");
	}

	#[tokio::test]
	async fn get_servers_marks_unregistered_as_deleted() {
		let (state, store) = test_state().await;
		seed(&store, "ghost", "tools/call", CapturePayload::Response(json!({"jsonrpc":"2.0","id":1,"result":{}}))).await;

		let app = router(state);
		let req = Request::builder().uri("/servers").body(AxumBody::empty()).unwrap();
		let resp = app.oneshot(req).await.unwrap();
		let bytes = resp.into_body().collect().await.unwrap().to_bytes();
		let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(body[0]["status"], "deleted");
	}

	#[tokio::test]
	async fn get_servers_includes_registered_server_with_zero_logs() {
		let (state, _store) = test_state().await;
		// "server1" is registered in test_state() but never logged against.

		let app = router(state);
		let req = Request::builder().uri("/servers").body(AxumBody::empty()).unwrap();
		let resp = app.oneshot(req).await.unwrap();
		let bytes = resp.into_body().collect().await.unwrap().to_bytes();
		let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(body.as_array().unwrap().len(), 1);
		assert_eq!(body[0]["serverName"], "server1");
		assert_eq!(body[0]["logCount"], 0);
		assert_eq!(body[0]["sessionCount"], 0);
		assert_eq!(body[0]["status"], "online");
	}

	#[tokio::test]
	async fn invalid_query_param_is_400() {
		let (state, _store) = test_state().await;
		let app = router(state);
		let req = Request::builder().uri("/logs?durationGt=nope").body(AxumBody::empty()).unwrap();
		let resp = app.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn clear_empties_logs_and_sessions() {
		let (state, store) = test_state().await;
		seed(&store, "server1", "tools/call", CapturePayload::Response(json!({"jsonrpc":"2.0","id":1,"result":{}}))).await;
		state.sessions.set_client_info("S", crate::types::ClientInfo { name: "c".into(), version: "1".into(), title: None });

		let app = router(state.clone());
		let req = Request::builder().method("POST").uri("/logs/clear").body(AxumBody::empty()).unwrap();
		let resp = app.oneshot(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::NO_CONTENT);
		assert!(state.sessions.get_client_info("S").is_none());

		let result = state.store.query(&crate::store::LogQueryOptions::new()).await.unwrap();
		assert!(result.records.is_empty());
	}
}
