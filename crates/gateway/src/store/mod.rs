//! C1: the storage backend. A single SQLite `logs` table (§4.8), written
//! through the WAL journal with a busy-timeout so the single-writer /
//! multi-reader discipline the spec calls for (§5 "Shared-resource
//! policy") comes from the backing store rather than an app-level mutex.

mod query;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::warn;

pub use query::{
	LogQueryOptions, NumericFilter, Order, PaginatedResult, StringFilter, StringOp,
};

use crate::capture::CaptureSink;
use crate::types::{
	CaptureMetadata, CapturePayload, CaptureRecord, ClientInfo, Direction, JsonRpcId, RawSseEvent,
	ServerInfo,
};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("sqlite error: {0}")]
	Sqlite(#[from] sqlx::Error),
}

/// An expanded row as returned by the query API (§4.9): a record with both
/// `request` and `response` becomes two `ApiLogEntry`s.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiLogEntry {
	pub id: i64,
	pub timestamp: String,
	pub method: String,
	#[serde(rename = "requestId")]
	pub request_id: Option<JsonRpcId>,
	pub direction: Direction,
	#[serde(rename = "serverName")]
	pub server_name: String,
	#[serde(rename = "sessionId")]
	pub session_id: String,
	#[serde(rename = "durationMs")]
	pub duration_ms: i64,
	#[serde(rename = "httpStatus")]
	pub http_status: u16,
	pub payload: Value,
	pub client: Option<ClientInfo>,
	pub server: Option<ServerInfo>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerAggregate {
	#[serde(rename = "serverName")]
	pub server_name: String,
	#[serde(rename = "logCount")]
	pub log_count: i64,
	#[serde(rename = "sessionCount")]
	pub session_count: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionAggregate {
	#[serde(rename = "sessionId")]
	pub session_id: String,
	#[serde(rename = "serverName")]
	pub server_name: String,
	#[serde(rename = "logCount")]
	pub log_count: i64,
	#[serde(rename = "startTime")]
	pub start_time: String,
	#[serde(rename = "endTime")]
	pub end_time: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ClientAggregate {
	#[serde(rename = "clientName")]
	pub client_name: String,
	#[serde(rename = "clientVersion")]
	pub client_version: String,
}

/// The SQLite-backed capture store (C1).
#[derive(Clone)]
pub struct SqliteStore {
	pool: SqlitePool,
}

impl SqliteStore {
	/// Opens (creating if needed) the database at `path`, with WAL
	/// journaling and a 5000ms busy-timeout (§4.8 durability policy).
	pub async fn open(path: &Path) -> Result<Self, StoreError> {
		let options = SqliteConnectOptions::new()
			.filename(path)
			.create_if_missing(true)
			.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
			.busy_timeout(std::time::Duration::from_millis(5000));
		let pool = SqlitePoolOptions::new()
			.max_connections(8)
			.connect_with(options)
			.await?;
		let store = Self { pool };
		store.migrate().await?;
		Ok(store)
	}

	/// In-memory store for tests: still goes through SQLite (not a stub),
	/// so query/aggregation behavior under test matches production.
	pub async fn open_in_memory() -> Result<Self, StoreError> {
		let options = SqliteConnectOptions::new()
			.filename(":memory:")
			.create_if_missing(true);
		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.connect_with(options)
			.await?;
		let store = Self { pool };
		store.migrate().await?;
		Ok(store)
	}

	async fn migrate(&self) -> Result<(), StoreError> {
		sqlx::query(
			r#"
			CREATE TABLE IF NOT EXISTS logs (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				timestamp TEXT NOT NULL,
				method TEXT NOT NULL,
				jsonrpc_id TEXT,
				server_name TEXT NOT NULL,
				session_id TEXT NOT NULL,
				duration_ms INTEGER NOT NULL,
				http_status INTEGER NOT NULL,
				request_json TEXT,
				response_json TEXT,
				error_json TEXT,
				client_name TEXT,
				client_version TEXT,
				client_title TEXT,
				server_version TEXT,
				server_title TEXT,
				user_agent TEXT,
				client_ip TEXT,
				tokens INTEGER
			)
			"#,
		)
		.execute(&self.pool)
		.await?;
		for stmt in [
			"CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp)",
			"CREATE INDEX IF NOT EXISTS idx_logs_method ON logs(method)",
			"CREATE INDEX IF NOT EXISTS idx_logs_server ON logs(server_name)",
			"CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id)",
		] {
			sqlx::query(stmt).execute(&self.pool).await?;
		}
		Ok(())
	}

	async fn insert_inner(&self, record: &CaptureRecord) -> Result<(), StoreError> {
		let jsonrpc_id = record.id.as_ref().map(|id| match id {
			JsonRpcId::Null => "null".to_string(),
			other => other.to_string(),
		});
		let (request_json, response_json, error_json) = match &record.payload {
			CapturePayload::Request(v) => (Some(v.to_string()), None, None),
			CapturePayload::Response(v) => {
				let error_json = v.get("error").map(|e| e.to_string());
				(None, Some(v.to_string()), error_json)
			},
			CapturePayload::SseEvent(ev) => (None, Some(sse_event_json(ev).to_string()), None),
		};
		let meta = &record.metadata;
		sqlx::query(
			r#"
			INSERT INTO logs (
				timestamp, method, jsonrpc_id, server_name, session_id,
				duration_ms, http_status, request_json, response_json, error_json,
				client_name, client_version, client_title,
				server_version, server_title, user_agent, client_ip, tokens
			) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,NULL)
			"#,
		)
		.bind(&record.timestamp)
		.bind(&record.method)
		.bind(jsonrpc_id)
		.bind(&meta.server_name)
		.bind(&meta.session_id)
		.bind(meta.duration_ms)
		.bind(meta.http_status as i64)
		.bind(request_json)
		.bind(response_json)
		.bind(error_json)
		.bind(meta.client.as_ref().map(|c| c.name.clone()))
		.bind(meta.client.as_ref().map(|c| c.version.clone()))
		.bind(meta.client.as_ref().and_then(|c| c.title.clone()))
		.bind(meta.server.as_ref().map(|s| s.version.clone()))
		.bind(meta.server.as_ref().and_then(|s| s.title.clone()))
		.bind(&meta.user_agent)
		.bind(&meta.client_ip)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	pub async fn query(&self, opts: &LogQueryOptions) -> Result<PaginatedResult, StoreError> {
		query::run(&self.pool, opts).await
	}

	pub async fn get_servers(&self) -> Result<Vec<ServerAggregate>, StoreError> {
		let rows = sqlx::query(
			r#"
			SELECT server_name, COUNT(*) as log_count, COUNT(DISTINCT session_id) as session_count
			FROM logs GROUP BY server_name
			"#,
		)
		.fetch_all(&self.pool)
		.await?;
		Ok(rows
			.into_iter()
			.map(|r| ServerAggregate {
				server_name: r.get("server_name"),
				log_count: r.get("log_count"),
				session_count: r.get("session_count"),
			})
			.collect())
	}

	pub async fn get_sessions(
		&self,
		server_name: Option<&str>,
	) -> Result<Vec<SessionAggregate>, StoreError> {
		let rows = if let Some(name) = server_name {
			sqlx::query(
				r#"
				SELECT session_id, server_name, COUNT(*) as log_count,
					MIN(timestamp) as start_time, MAX(timestamp) as end_time
				FROM logs WHERE server_name = ?
				GROUP BY session_id, server_name
				ORDER BY MIN(timestamp) DESC
				"#,
			)
			.bind(name)
			.fetch_all(&self.pool)
			.await?
		} else {
			sqlx::query(
				r#"
				SELECT session_id, server_name, COUNT(*) as log_count,
					MIN(timestamp) as start_time, MAX(timestamp) as end_time
				FROM logs
				GROUP BY session_id, server_name
				ORDER BY MIN(timestamp) DESC
				"#,
			)
			.fetch_all(&self.pool)
			.await?
		};
		Ok(rows
			.into_iter()
			.map(|r| SessionAggregate {
				session_id: r.get("session_id"),
				server_name: r.get("server_name"),
				log_count: r.get("log_count"),
				start_time: r.get("start_time"),
				end_time: r.get("end_time"),
			})
			.collect())
	}

	pub async fn get_clients(&self) -> Result<Vec<ClientAggregate>, StoreError> {
		let rows = sqlx::query(
			r#"
			SELECT DISTINCT client_name, client_version FROM logs
			WHERE client_name IS NOT NULL
			ORDER BY client_name, client_version
			"#,
		)
		.fetch_all(&self.pool)
		.await?;
		Ok(rows
			.into_iter()
			.map(|r| ClientAggregate {
				client_name: r.get("client_name"),
				client_version: r.get::<Option<String>, _>("client_version").unwrap_or_default(),
			})
			.collect())
	}

	pub async fn get_methods(&self, server_name: Option<&str>) -> Result<Vec<String>, StoreError> {
		let rows = if let Some(name) = server_name {
			sqlx::query("SELECT DISTINCT method FROM logs WHERE server_name = ? ORDER BY method")
				.bind(name)
				.fetch_all(&self.pool)
				.await?
		} else {
			sqlx::query("SELECT DISTINCT method FROM logs ORDER BY method")
				.fetch_all(&self.pool)
				.await?
		};
		Ok(rows.into_iter().map(|r| r.get("method")).collect())
	}

	/// `updateServerInfoForInitializeRequest` (§4.8): backfills the single
	/// matching `initialize` *request* row once the paired response
	/// reveals `serverInfo` (§4.5 step 7, P3).
	pub async fn update_server_info_for_initialize_request(
		&self,
		server: &str,
		session: &str,
		request_id: &JsonRpcId,
		server_info: &ServerInfo,
	) -> Result<(), StoreError> {
		sqlx::query(
			r#"
			UPDATE logs SET server_version = ?, server_title = ?
			WHERE method = 'initialize' AND request_json IS NOT NULL
				AND server_name = ? AND session_id = ? AND jsonrpc_id = ?
			"#,
		)
		.bind(&server_info.version)
		.bind(&server_info.title)
		.bind(server)
		.bind(session)
		.bind(request_id.to_string())
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	/// `clearAll` (§4.8): truncates the logs table, invoked by the query
	/// API's clear endpoint (§4.9) alongside `SessionStore::clear_all`.
	pub async fn clear_all(&self) -> Result<(), StoreError> {
		sqlx::query("DELETE FROM logs").execute(&self.pool).await?;
		Ok(())
	}
}

fn sse_event_json(ev: &RawSseEvent) -> Value {
	serde_json::to_value(ev).unwrap_or(Value::Null)
}

#[async_trait]
impl CaptureSink for SqliteStore {
	/// Storage write failures are logged at warn and dropped, never
	/// propagated to the client path (§7).
	async fn insert(&self, record: CaptureRecord) {
		if let Err(e) = self.insert_inner(&record).await {
			warn!(error = %e, "failed to persist capture record");
		}
	}
}

pub type SharedStore = Arc<SqliteStore>;
