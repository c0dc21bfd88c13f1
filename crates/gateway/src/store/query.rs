//! The `GET /logs` filter grammar and query execution (§4.8 "Query
//! operation", §4.9, §9 "Filter grammar").

use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::StoreError;
use crate::types::{
	CaptureMetadata, CapturePayload, CaptureRecord, ClientInfo, JsonRpcId, RawSseEvent, ServerInfo,
};

/// Match mode for a multi-select string filter field (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOp {
	/// Exact match, case-sensitive.
	Is,
	/// Substring match, case-insensitive.
	Contains,
}

/// A multi-select filter over one string column: values are OR'd
/// together, the operator applies uniformly to all of them (§4.8).
#[derive(Debug, Clone, Default)]
pub struct StringFilter {
	pub op: Option<StringOp>,
	pub values: Vec<String>,
}

impl StringFilter {
	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}
}

/// A numeric filter field: `eq` may be single-or-array (OR'd); the
/// comparison operators are single-valued (§4.8).
#[derive(Debug, Clone, Default)]
pub struct NumericFilter {
	pub eq: Vec<i64>,
	pub gt: Option<i64>,
	pub lt: Option<i64>,
	pub gte: Option<i64>,
	pub lte: Option<i64>,
}

impl NumericFilter {
	pub fn is_empty(&self) -> bool {
		self.eq.is_empty()
			&& self.gt.is_none()
			&& self.lt.is_none()
			&& self.gte.is_none()
			&& self.lte.is_none()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
	Asc,
	#[default]
	Desc,
}

impl Order {
	fn sql(self) -> &'static str {
		match self {
			Order::Asc => "ASC",
			Order::Desc => "DESC",
		}
	}
}

/// Parsed `GET /logs` query (§4.8).
#[derive(Debug, Clone, Default)]
pub struct LogQueryOptions {
	pub server: StringFilter,
	pub session: StringFilter,
	pub client: StringFilter,
	pub method: StringFilter,
	pub duration_ms: NumericFilter,
	pub tokens: NumericFilter,
	pub search_queries: Vec<String>,
	pub after: Option<String>,
	pub before: Option<String>,
	pub limit: u32,
	pub order: Order,
}

impl LogQueryOptions {
	pub fn new() -> Self {
		Self {
			limit: 100,
			order: Order::Desc,
			..Default::default()
		}
	}
}

pub struct PaginatedResult {
	pub records: Vec<CaptureRecord>,
	pub row_ids: Vec<i64>,
	pub has_more: bool,
	pub oldest_timestamp: Option<String>,
	pub newest_timestamp: Option<String>,
}

fn push_string_filter(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, filter: &StringFilter) {
	if filter.is_empty() {
		return;
	}
	let op = filter.op.unwrap_or(StringOp::Is);
	qb.push(" AND (");
	for (i, value) in filter.values.iter().enumerate() {
		if i > 0 {
			qb.push(" OR ");
		}
		match op {
			StringOp::Is => {
				qb.push(format!("{column} = "));
				qb.push_bind(value.clone());
			},
			StringOp::Contains => {
				qb.push(format!("LOWER({column}) LIKE "));
				qb.push_bind(format!("%{}%", value.to_lowercase()));
			},
		}
	}
	qb.push(")");
}

fn push_numeric_filter(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, filter: &NumericFilter) {
	if !filter.eq.is_empty() {
		qb.push(format!(" AND ({column} IN ("));
		let mut sep = qb.separated(", ");
		for v in &filter.eq {
			sep.push_bind(*v);
		}
		qb.push("))");
	}
	if let Some(v) = filter.gt {
		qb.push(format!(" AND {column} > "));
		qb.push_bind(v);
	}
	if let Some(v) = filter.lt {
		qb.push(format!(" AND {column} < "));
		qb.push_bind(v);
	}
	if let Some(v) = filter.gte {
		qb.push(format!(" AND {column} >= "));
		qb.push_bind(v);
	}
	if let Some(v) = filter.lte {
		qb.push(format!(" AND {column} <= "));
		qb.push_bind(v);
	}
}

pub(super) async fn run(
	pool: &SqlitePool,
	opts: &LogQueryOptions,
) -> Result<PaginatedResult, StoreError> {
	let limit = opts.limit.clamp(1, 1000);

	let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
		r#"SELECT id, timestamp, method, jsonrpc_id, server_name, session_id,
			duration_ms, http_status, request_json, response_json, error_json,
			client_name, client_version, client_title, server_version, server_title,
			user_agent, client_ip
		FROM logs WHERE 1=1"#,
	);

	push_string_filter(&mut qb, "server_name", &opts.server);
	push_string_filter(&mut qb, "session_id", &opts.session);
	push_string_filter(&mut qb, "client_name", &opts.client);
	push_string_filter(&mut qb, "method", &opts.method);
	push_numeric_filter(&mut qb, "duration_ms", &opts.duration_ms);
	push_numeric_filter(&mut qb, "tokens", &opts.tokens);

	for term in &opts.search_queries {
		qb.push(" AND (LOWER(COALESCE(request_json,'') || COALESCE(response_json,'')) LIKE ");
		qb.push_bind(format!("%{}%", term.to_lowercase()));
		qb.push(")");
	}
	if let Some(after) = &opts.after {
		qb.push(" AND timestamp > ");
		qb.push_bind(after.clone());
	}
	if let Some(before) = &opts.before {
		qb.push(" AND timestamp < ");
		qb.push_bind(before.clone());
	}

	qb.push(format!(" ORDER BY timestamp {}", opts.order.sql()));
	// Fetch limit + 1 to detect hasMore without a second COUNT query (§4.8
	// pagination contract).
	qb.push(" LIMIT ");
	qb.push_bind((limit + 1) as i64);

	let rows = qb.build().fetch_all(pool).await?;
	let has_more = rows.len() as u32 > limit;
	let mut rows = rows;
	rows.truncate(limit as usize);

	let oldest_timestamp = rows.last().map(|r| r.get::<String, _>("timestamp"));
	let newest_timestamp = rows.first().map(|r| r.get::<String, _>("timestamp"));

	let mut records = Vec::with_capacity(rows.len());
	let mut row_ids = Vec::with_capacity(rows.len());
	for row in &rows {
		row_ids.push(row.get::<i64, _>("id"));
		records.push(row_to_record(row));
	}

	Ok(PaginatedResult {
		records,
		row_ids,
		has_more,
		oldest_timestamp,
		newest_timestamp,
	})
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> CaptureRecord {
	let jsonrpc_id: Option<String> = row.get("jsonrpc_id");
	let id = jsonrpc_id.map(|s| {
		if s == "null" {
			JsonRpcId::Null
		} else if let Ok(n) = s.parse::<i64>() {
			JsonRpcId::Number(n)
		} else {
			JsonRpcId::String(s)
		}
	});

	let client_name: Option<String> = row.get("client_name");
	let client = client_name.map(|name| ClientInfo {
		name,
		version: row.get::<Option<String>, _>("client_version").unwrap_or_default(),
		title: row.get("client_title"),
	});
	let server_version: Option<String> = row.get("server_version");
	let server = server_version.map(|version| ServerInfo {
		name: None,
		version,
		title: row.get("server_title"),
	});

	let request_json: Option<String> = row.get("request_json");
	let response_json: Option<String> = row.get("response_json");
	// Defensive parse: a corrupt payload yields a null value rather than
	// aborting the whole query (§4.8).
	let payload = if let Some(raw) = request_json {
		CapturePayload::Request(parse_defensive(&raw))
	} else if let Some(raw) = response_json {
		match serde_json::from_str::<RawSseEvent>(&raw) {
			Ok(ev) if looks_like_sse_event(&raw) => CapturePayload::SseEvent(ev),
			_ => CapturePayload::Response(parse_defensive(&raw)),
		}
	} else {
		CapturePayload::Response(Value::Null)
	};

	CaptureRecord {
		timestamp: row.get("timestamp"),
		method: row.get("method"),
		id,
		metadata: CaptureMetadata {
			server_name: row.get("server_name"),
			session_id: row.get("session_id"),
			duration_ms: row.get("duration_ms"),
			http_status: row.get::<i64, _>("http_status") as u16,
			client,
			server,
			user_agent: row.get("user_agent"),
			client_ip: row.get("client_ip"),
		},
		payload,
	}
}

fn parse_defensive(raw: &str) -> Value {
	serde_json::from_str(raw).unwrap_or(Value::Null)
}

// SSE event rows are stored in response_json but have no jsonrpc envelope;
// distinguish them from a genuine (possibly malformed) JSON-RPC response
// by checking for the sentinel fields RawSseEvent serializes.
fn looks_like_sse_event(raw: &str) -> bool {
	match serde_json::from_str::<Value>(raw) {
		Ok(Value::Object(obj)) => {
			!obj.contains_key("jsonrpc")
				&& (obj.contains_key("data") || obj.contains_key("event") || obj.contains_key("retry"))
		},
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::capture::CaptureSink;
	use crate::store::SqliteStore;
	use crate::types::{CaptureMetadata, CapturePayload, JsonRpcId};
	use serde_json::json;

	async fn seed(store: &SqliteStore, server: &str, session: &str, method: &str, dur: i64) {
		store
			.insert(CaptureRecord {
				timestamp: gateway_core::time::now_iso8601(),
				method: method.to_string(),
				id: Some(JsonRpcId::Number(1)),
				metadata: CaptureMetadata {
					server_name: server.to_string(),
					session_id: session.to_string(),
					duration_ms: dur,
					http_status: 200,
					..Default::default()
				},
				payload: CapturePayload::Response(json!({"jsonrpc":"2.0","id":1,"result":{}})),
			})
			.await;
	}

	#[tokio::test]
	async fn multi_select_server_filter_ors_values() {
		let store = SqliteStore::open_in_memory().await.unwrap();
		seed(&store, "server1", "s", "tools/call", 10).await;
		seed(&store, "server2", "s", "tools/call", 10).await;
		seed(&store, "server3", "s", "tools/call", 10).await;

		let mut opts = LogQueryOptions::new();
		opts.server = StringFilter {
			op: Some(StringOp::Is),
			values: vec!["server1".into(), "server2".into()],
		};
		let result = store.query(&opts).await.unwrap();
		assert_eq!(result.records.len(), 2);
	}

	#[tokio::test]
	async fn pagination_reports_has_more() {
		let store = SqliteStore::open_in_memory().await.unwrap();
		for _ in 0..5 {
			seed(&store, "server1", "s", "tools/call", 1).await;
		}
		let mut opts = LogQueryOptions::new();
		opts.limit = 3;
		let result = store.query(&opts).await.unwrap();
		assert_eq!(result.records.len(), 3);
		assert!(result.has_more);
	}

	#[tokio::test]
	async fn contains_is_case_insensitive() {
		let store = SqliteStore::open_in_memory().await.unwrap();
		seed(&store, "Server1", "s", "tools/call", 1).await;
		let mut opts = LogQueryOptions::new();
		opts.server = StringFilter {
			op: Some(StringOp::Contains),
			values: vec!["serv".into()],
		};
		let result = store.query(&opts).await.unwrap();
		assert_eq!(result.records.len(), 1);
	}
}
