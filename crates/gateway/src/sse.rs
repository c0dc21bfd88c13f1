//! C4: SSE frame stream. Parses an octet stream into a lazy sequence of
//! `SseEvent`s using the standard SSE grammar (§4.4), and classifies each
//! event's `data` as an embedded JSON-RPC message or an opaque SSE event.
//!
//! Implemented as a [`tokio_util::codec::Decoder`] so it composes with
//! [`tokio_util::io::StreamReader`]/`FramedRead` over any upstream body
//! byte-stream — the same "frame an async byte stream" idiom the teacher
//! uses via `sse_stream::SseStream::from_byte_stream`.

use bytes::{Buf, BytesMut};
use serde_json::Value;
use std::io;

use crate::types::RawSseEvent;

/// One parsed SSE frame (`event:`/`data:`/`id:`/`retry:` fields,
/// terminated by a blank line, §4.4). `data` is the concatenation of
/// successive `data:` lines within one frame, joined with `\n`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
	pub id: Option<String>,
	pub event: Option<String>,
	pub data: Option<String>,
	pub retry: Option<u64>,
}

impl From<SseEvent> for RawSseEvent {
	fn from(e: SseEvent) -> Self {
		RawSseEvent {
			id: e.id,
			event: e.event,
			data: e.data,
			retry: e.retry,
		}
	}
}

/// Incremental SSE frame decoder. Buffers bytes across calls until a
/// blank-line-terminated frame is complete; never blocks on partial
/// multi-byte UTF-8 sequences because the grammar's delimiters (`\n`,
/// `\r\n`) never appear inside a UTF-8 continuation byte.
#[derive(Debug, Default)]
pub struct SseDecoder {
	// Fields accumulated for the frame currently being built.
	id: Option<String>,
	event: Option<String>,
	data: Vec<String>,
	retry: Option<u64>,
	saw_any_field: bool,
}

impl SseDecoder {
	pub fn new() -> Self {
		Self::default()
	}

	fn reset(&mut self) {
		self.id = None;
		self.event = None;
		self.data.clear();
		self.retry = None;
		self.saw_any_field = false;
	}

	fn take_frame(&mut self) -> Option<SseEvent> {
		if !self.saw_any_field {
			return None;
		}
		let event = SseEvent {
			id: self.id.take(),
			event: self.event.take(),
			data: if self.data.is_empty() {
				None
			} else {
				Some(self.data.join("\n"))
			},
			retry: self.retry.take(),
		};
		self.reset();
		Some(event)
	}

	fn apply_field(&mut self, line: &str) {
		self.saw_any_field = true;
		let (field, value) = match line.split_once(':') {
			Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
			None => (line, ""),
		};
		match field {
			"event" => self.event = Some(value.to_string()),
			"data" => self.data.push(value.to_string()),
			"id" => self.id = Some(value.to_string()),
			"retry" => self.retry = value.trim().parse().ok(),
			// comments (lines starting with ':') and unknown fields are ignored
			_ => {},
		}
	}
}

impl tokio_util::codec::Decoder for SseDecoder {
	type Item = SseEvent;
	type Error = io::Error;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		loop {
			let Some(nl) = src.iter().position(|&b| b == b'\n') else {
				return Ok(None);
			};
			let mut line = src.split_to(nl + 1);
			line.truncate(line.len() - 1); // drop trailing \n
			if line.last() == Some(&b'\r') {
				line.truncate(line.len() - 1); // drop trailing \r (CRLF)
			}

			if line.is_empty() {
				// blank line: frame terminator
				if let Some(frame) = self.take_frame() {
					return Ok(Some(frame));
				}
				continue; // blank line with nothing buffered: ignore and keep scanning
			}
			if line.first() == Some(&b':') {
				continue; // SSE comment line
			}
			let text = String::from_utf8_lossy(&line).into_owned();
			self.apply_field(&text);
		}
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		match self.decode(src)? {
			Some(frame) => Ok(Some(frame)),
			None => {
				if src.is_empty() {
					Ok(self.take_frame())
				} else {
					// trailing partial line with no terminating \n: flush what we have
					let line = src.split_to(src.len());
					if !line.is_empty() {
						let text = String::from_utf8_lossy(&line).into_owned();
						self.apply_field(&text);
					}
					Ok(self.take_frame())
				}
			},
		}
	}
}

/// A JSON-RPC message embedded in an SSE event's `data` (§4.4).
#[derive(Debug, Clone)]
pub struct EmbeddedJsonRpc {
	pub value: Value,
	pub is_response: bool,
}

/// Attempts to classify `event.data` as an embedded JSON-RPC 2.0 message.
/// Returns `None` for non-JSON or non-JSON-RPC payloads, which the caller
/// treats as an opaque SSE event instead (§4.4).
pub fn classify(event: &SseEvent) -> Option<EmbeddedJsonRpc> {
	let data = event.data.as_ref()?;
	if data.trim().is_empty() {
		return None;
	}
	let value: Value = serde_json::from_str(data).ok()?;
	let obj = value.as_object()?;
	if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
		return None;
	}
	let has_method = obj.contains_key("method");
	let is_response = obj.contains_key("result") || obj.contains_key("error");
	if !has_method && !is_response {
		return None;
	}
	Some(EmbeddedJsonRpc { value, is_response })
}

/// Drains every complete frame currently buffered in `buf` through
/// `decoder`, without requiring EOF. Used by the background tee consumer
/// (§4.5) which feeds bytes as they arrive and wants frames as soon as
/// they are complete rather than waiting for the stream to end.
pub fn drain_ready(decoder: &mut SseDecoder, buf: &mut BytesMut) -> Vec<SseEvent> {
	use tokio_util::codec::Decoder;
	let mut out = Vec::new();
	while let Ok(Some(ev)) = decoder.decode(buf) {
		out.push(ev);
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio_util::codec::Decoder;

	#[test]
	fn parses_single_event() {
		let mut dec = SseDecoder::new();
		let mut buf = BytesMut::from("event: message\ndata: hello\n\n");
		let ev = dec.decode(&mut buf).unwrap().unwrap();
		assert_eq!(ev.event.as_deref(), Some("message"));
		assert_eq!(ev.data.as_deref(), Some("hello"));
	}

	#[test]
	fn joins_multiple_data_lines_with_lf() {
		let mut dec = SseDecoder::new();
		let mut buf = BytesMut::from("data: line1\ndata: line2\n\n");
		let ev = dec.decode(&mut buf).unwrap().unwrap();
		assert_eq!(ev.data.as_deref(), Some("line1\nline2"));
	}

	#[test]
	fn handles_split_chunks_across_decode_calls() {
		let mut dec = SseDecoder::new();
		let mut buf = BytesMut::from("data: hel");
		assert_eq!(dec.decode(&mut buf).unwrap(), None);
		buf.extend_from_slice(b"lo\n\n");
		let ev = dec.decode(&mut buf).unwrap().unwrap();
		assert_eq!(ev.data.as_deref(), Some("hello"));
	}

	#[test]
	fn ignores_comment_lines() {
		let mut dec = SseDecoder::new();
		let mut buf = BytesMut::from(": keep-alive\ndata: x\n\n");
		let ev = dec.decode(&mut buf).unwrap().unwrap();
		assert_eq!(ev.data.as_deref(), Some("x"));
	}

	#[test]
	fn classifies_embedded_jsonrpc_response() {
		let ev = SseEvent {
			data: Some(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#.to_string()),
			..Default::default()
		};
		let parsed = classify(&ev).expect("should classify");
		assert!(parsed.is_response);
	}

	#[test]
	fn classifies_embedded_jsonrpc_notification_as_non_response() {
		let ev = SseEvent {
			data: Some(r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{}}"#.to_string()),
			..Default::default()
		};
		let parsed = classify(&ev).expect("should classify");
		assert!(!parsed.is_response);
	}

	#[test]
	fn non_jsonrpc_data_is_opaque() {
		let ev = SseEvent {
			data: Some(r#"{"hello":"world"}"#.to_string()),
			..Default::default()
		};
		assert!(classify(&ev).is_none());
	}

	#[test]
	fn crlf_line_endings_supported() {
		let mut dec = SseDecoder::new();
		let mut buf = BytesMut::from("data: x\r\n\r\n");
		let ev = dec.decode(&mut buf).unwrap().unwrap();
		assert_eq!(ev.data.as_deref(), Some("x"));
	}
}
