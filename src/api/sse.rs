use crate::error::CastorError;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};

/// Upstream SSE events are framed by a blank line with CRLF line endings.
const EVENT_DELIMITER: &[u8] = b"\r\n\r\n";

/// How many complete events must arrive before any byte reaches the client.
/// Upstream connections that open a stream and immediately die never get past
/// this, so the request can be retried on another credential.
const REQUIRED_EVENTS: usize = 2;

/// Validate the head of an SSE body.
///
/// Buffers upstream chunks until `REQUIRED_EVENTS` complete events have been
/// observed and returns everything read so far (the buffered events plus any
/// tail bytes) for replay ahead of the live stream. Fails if the upstream
/// closes or errors first; nothing has been emitted to the client by then.
pub async fn precheck<S, E>(stream: &mut S) -> Result<Bytes, CastorError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut buffer = BytesMut::new();
    let mut events = 0usize;
    let mut scan_from = 0usize;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| CastorError::SsePrecheck(format!("stream failed mid pre-check: {e}")))?;
        buffer.extend_from_slice(&chunk);

        while events < REQUIRED_EVENTS {
            match delimiter_end(&buffer, scan_from) {
                Some(end) => {
                    events += 1;
                    scan_from = end;
                }
                None => break,
            }
        }

        if events >= REQUIRED_EVENTS {
            return Ok(buffer.freeze());
        }
    }

    Err(CastorError::SsePrecheck(format!(
        "upstream closed after {events} complete event(s)"
    )))
}

/// Position one past the next event delimiter at or after `from`, if any.
fn delimiter_end(haystack: &[u8], from: usize) -> Option<usize> {
    haystack[from..]
        .windows(EVENT_DELIMITER.len())
        .position(|w| w == EVENT_DELIMITER)
        .map(|i| from + i + EVENT_DELIMITER.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::convert::Infallible;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, Infallible>> + Unpin {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn two_events_in_one_chunk_pass() {
        let mut body = chunks(&["data: one\r\n\r\ndata: two\r\n\r\n"]);
        let prelude = precheck(&mut body).await.expect("pre-check");
        assert_eq!(&prelude[..], b"data: one\r\n\r\ndata: two\r\n\r\n");
    }

    #[tokio::test]
    async fn delimiter_split_across_chunks_is_found() {
        let mut body = chunks(&["data: one\r\n", "\r\ndata: two\r\n\r", "\ndata: tail"]);
        let prelude = precheck(&mut body).await.expect("pre-check");
        // Everything read so far comes back, including the partial third event.
        assert_eq!(
            &prelude[..],
            b"data: one\r\n\r\ndata: two\r\n\r\ndata: tail"
        );
    }

    #[tokio::test]
    async fn single_event_then_close_fails() {
        let mut body = chunks(&["data: only\r\n\r\n"]);
        let err = precheck(&mut body).await.expect_err("must fail");
        assert!(matches!(err, CastorError::SsePrecheck(_)));
    }

    #[tokio::test]
    async fn empty_stream_fails() {
        let mut body = chunks(&[]);
        let err = precheck(&mut body).await.expect_err("must fail");
        assert!(matches!(err, CastorError::SsePrecheck(_)));
    }
}
