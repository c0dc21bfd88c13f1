//! `GET /logs` filter grammar (§4.8, §6, §9 "Filter grammar"): each query
//! key maps to a field; repeated keys OR together; an `is:`/`contains:`
//! prefix on a value switches that field's match mode.

use std::collections::HashMap;

use crate::error::ApiError;
use crate::store::{LogQueryOptions, NumericFilter, Order, StringFilter, StringOp};

const IS_PREFIX: &str = "is:";
const CONTAINS_PREFIX: &str = "contains:";

/// Groups a raw query string's pairs by key, preserving the order values
/// arrive in so repeated `?server=a&server=b` becomes `["a", "b"]`.
fn group(raw: &str) -> HashMap<String, Vec<String>> {
	let mut out: HashMap<String, Vec<String>> = HashMap::new();
	for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
		out.entry(key.into_owned()).or_default().push(value.into_owned());
	}
	out
}

fn string_filter(values: Option<&Vec<String>>, default_op: StringOp) -> StringFilter {
	let Some(values) = values else {
		return StringFilter::default();
	};
	let mut op = None;
	let mut stripped = Vec::with_capacity(values.len());
	for v in values {
		if let Some(rest) = v.strip_prefix(IS_PREFIX) {
			op = Some(StringOp::Is);
			stripped.push(rest.to_string());
		} else if let Some(rest) = v.strip_prefix(CONTAINS_PREFIX) {
			op = Some(StringOp::Contains);
			stripped.push(rest.to_string());
		} else {
			stripped.push(v.clone());
		}
	}
	StringFilter { op: Some(op.unwrap_or(default_op)), values: stripped }
}

fn parse_i64(field: &str, raw: &str) -> Result<i64, ApiError> {
	raw.parse::<i64>()
		.map_err(|_| ApiError::InvalidParam(format!("{field} must be an integer, got {raw:?}")))
}

fn numeric_filter(params: &HashMap<String, Vec<String>>, field: &str) -> Result<NumericFilter, ApiError> {
	let mut filter = NumericFilter::default();
	if let Some(values) = params.get(&format!("{field}Eq")) {
		for v in values {
			filter.eq.push(parse_i64(&format!("{field}Eq"), v)?);
		}
	}
	if let Some(v) = params.get(&format!("{field}Gt")).and_then(|v| v.first()) {
		filter.gt = Some(parse_i64(&format!("{field}Gt"), v)?);
	}
	if let Some(v) = params.get(&format!("{field}Lt")).and_then(|v| v.first()) {
		filter.lt = Some(parse_i64(&format!("{field}Lt"), v)?);
	}
	if let Some(v) = params.get(&format!("{field}Gte")).and_then(|v| v.first()) {
		filter.gte = Some(parse_i64(&format!("{field}Gte"), v)?);
	}
	if let Some(v) = params.get(&format!("{field}Lte")).and_then(|v| v.first()) {
		filter.lte = Some(parse_i64(&format!("{field}Lte"), v)?);
	}
	Ok(filter)
}

/// Parses a raw query string into `LogQueryOptions` (§4.8, §6). Field
/// defaults: `server`/`session`/`client` default to `is`, `method`
/// defaults to `contains` (§6).
pub fn parse(raw: &str) -> Result<LogQueryOptions, ApiError> {
	let params = group(raw);

	let mut opts = LogQueryOptions::new();
	opts.server = string_filter(params.get("server"), StringOp::Is);
	opts.session = string_filter(params.get("session"), StringOp::Is);
	opts.client = string_filter(params.get("client"), StringOp::Is);
	opts.method = string_filter(params.get("method"), StringOp::Contains);
	opts.duration_ms = numeric_filter(&params, "duration")?;
	opts.tokens = numeric_filter(&params, "tokens")?;
	opts.search_queries = params.get("q").cloned().unwrap_or_default();
	opts.after = params.get("after").and_then(|v| v.first()).cloned();
	opts.before = params.get("before").and_then(|v| v.first()).cloned();

	if let Some(limit) = params.get("limit").and_then(|v| v.first()) {
		opts.limit = limit
			.parse::<u32>()
			.map_err(|_| ApiError::InvalidParam(format!("limit must be a positive integer, got {limit:?}")))?;
	}
	if let Some(order) = params.get("order").and_then(|v| v.first()) {
		opts.order = match order.as_str() {
			"asc" => Order::Asc,
			"desc" => Order::Desc,
			other => return Err(ApiError::InvalidParam(format!("order must be \"asc\" or \"desc\", got {other:?}"))),
		};
	}

	Ok(opts)
}
