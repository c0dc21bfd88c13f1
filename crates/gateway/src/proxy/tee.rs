//! SSE tee: splits one upstream byte stream into a byte-faithful client
//! stream and a sibling channel for the background JSON-RPC parser (§2
//! "SSE tee-and-parse pipeline", §4.5 "SSE branch", P5).

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

/// Bounded so a slow parser can't let an unbounded number of chunks pile
/// up in memory; a full channel just means the tee briefly backpressures
/// the upstream read, which is fine since the client branch is still
/// draining independently.
const TEE_CHANNEL_CAPACITY: usize = 64;

/// Consumes `upstream`, a byte-chunk stream from the upstream response,
/// and returns two independent streams of the same bytes: one for the
/// client response body, one for the background parser. Reading the
/// upstream stream happens once, driven by a forwarding task so neither
/// consumer can starve the other.
pub fn tee<S, E>(
	upstream: S,
) -> (
	impl Stream<Item = Result<Bytes, std::io::Error>>,
	mpsc::Receiver<Bytes>,
)
where
	S: Stream<Item = Result<Bytes, E>> + Send + 'static,
	E: std::fmt::Display + Send + 'static,
{
	let mut upstream = Box::pin(upstream);
	let (client_tx, client_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(TEE_CHANNEL_CAPACITY);
	let (parser_tx, parser_rx) = mpsc::channel::<Bytes>(TEE_CHANNEL_CAPACITY);

	tokio::spawn(async move {
		while let Some(next) = upstream.next().await {
			match next {
				Ok(chunk) => {
					// Parser branch is best-effort: a full/closed channel
					// never blocks or fails the client branch (§5
					// "never propagate its failures back to the client
					// path"), but a dropped frame is still logged (§7
					// "SSE capture failure: logged; does not affect the
					// client stream").
					if let Err(e) = parser_tx.try_send(chunk.clone()) {
						warn!(error = %e, "dropping SSE chunk for capture: parser channel full or closed");
					}
					if client_tx.send(Ok(chunk)).await.is_err() {
						break; // client disconnected
					}
				},
				Err(e) => {
					let io_err = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
					let _ = client_tx.send(Err(io_err)).await;
					break;
				},
			}
		}
		// Dropping both senders here closes each receiver, which is how
		// the client body and the background parser learn the upstream
		// stream ended.
	});

	(ReceiverStream::new(client_rx), parser_rx)
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures_util::stream;

	#[tokio::test]
	async fn both_branches_see_every_chunk() {
		let chunks: Vec<Result<Bytes, std::convert::Infallible>> =
			vec![Ok(Bytes::from("a")), Ok(Bytes::from("b")), Ok(Bytes::from("c"))];
		let (client_stream, mut parser_rx) = tee(stream::iter(chunks));

		let client_bytes: Vec<Bytes> = client_stream
			.map(|r| r.unwrap())
			.collect::<Vec<_>>()
			.await;
		assert_eq!(client_bytes, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);

		let mut parser_bytes = Vec::new();
		while let Some(b) = parser_rx.recv().await {
			parser_bytes.push(b);
		}
		assert_eq!(parser_bytes, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
	}
}
