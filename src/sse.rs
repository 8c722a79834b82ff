//! Decoding of the inference server's Server-Sent-Events response body.
//!
//! The upstream emits `data: {json}` lines, optionally terminated by
//! `data: [DONE]`. llama.cpp itself marks its last chunk with `"stop": true`
//! instead, so either marker ends the generation.

use std::time::Duration;

use futures_util::{Stream, StreamExt};

use crate::protocol::StreamEvent;
use crate::upstream::CompletionChunk;

pub const DATA_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";
/// Longest unterminated line kept while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Incremental decoder that turns raw body chunks into [`StreamEvent`]s.
///
/// Lines may be split across chunks at any byte; the unterminated tail is
/// kept until the next chunk arrives, up to [`MAX_LINE_BYTES`]; a longer
/// line ends the stream with an `Error`. Once a terminal event has been
/// produced, further input is ignored.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.decode_line(&line[..line.len() - 1], &mut events);
            if self.finished {
                self.buffer.clear();
                break;
            }
        }
        if !self.finished && self.buffer.len() > MAX_LINE_BYTES {
            tracing::warn!(buffered = self.buffer.len(), "event-stream line exceeds limit");
            self.buffer.clear();
            self.finished = true;
            events.push(StreamEvent::Error {
                message: format!("event-stream line longer than {MAX_LINE_BYTES} bytes"),
            });
        }
        events
    }

    /// Flushes the trailing partial line at end of body. Always ends with a
    /// terminal event unless one was already produced.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() {
            self.decode_line(&rest, &mut events);
        }
        if !self.finished {
            self.finished = true;
            events.push(StreamEvent::Done);
        }
        events
    }

    fn decode_line(&mut self, raw: &[u8], events: &mut Vec<StreamEvent>) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return;
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload).trim_end();

        if payload == DONE_SENTINEL {
            self.finished = true;
            events.push(StreamEvent::Done);
            return;
        }

        match serde_json::from_str::<CompletionChunk>(payload) {
            Ok(chunk) => {
                if !chunk.content.is_empty() {
                    events.push(StreamEvent::Token {
                        text: chunk.content,
                    });
                }
                if chunk.stop {
                    self.finished = true;
                    events.push(StreamEvent::Done);
                }
            }
            Err(err) => {
                tracing::debug!(%err, payload, "skipping malformed event-stream payload");
            }
        }
    }
}

/// Adapts a byte stream into a stream of [`StreamEvent`]s ending in exactly
/// one `Done` or `Error`.
///
/// With `idle_timeout` set, a gap between chunks longer than the limit ends
/// the stream with an `Error`.
pub fn decode_stream<S, B, E>(
    body: S,
    idle_timeout: Option<Duration>,
) -> impl Stream<Item = StreamEvent> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut body = Box::pin(body);
        let mut decoder = EventStreamDecoder::new();

        loop {
            let next = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, body.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::warn!(timeout_secs = limit.as_secs(), "upstream stream stalled");
                        yield StreamEvent::Error {
                            message: format!(
                                "inference server sent no data for {}s",
                                limit.as_secs()
                            ),
                        };
                        return;
                    }
                },
                None => body.next().await,
            };

            match next {
                Some(Ok(chunk)) => {
                    for event in decoder.push(chunk.as_ref()) {
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                }
                Some(Err(err)) => {
                    yield StreamEvent::Error {
                        message: format!("upstream stream failed: {err}"),
                    };
                    return;
                }
                None => {
                    for event in decoder.finish() {
                        yield event;
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(text: &str) -> StreamEvent {
        StreamEvent::Token { text: text.into() }
    }

    #[test]
    fn emits_tokens_in_order_then_done() {
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(
            b"data: {\"content\":\"Hel\"}\n\ndata: {\"content\":\"lo\"}\n\ndata: [DONE]\n\n",
        );
        assert_eq!(events, vec![token("Hel"), token("lo"), StreamEvent::Done]);
        assert!(decoder.is_finished());
    }

    #[test]
    fn lines_split_across_chunks_are_reassembled() {
        let whole = b"data: {\"content\":\"a\"}\n\ndata: {\"content\":\"b\"}\n\ndata: [DONE]\n\n";
        for split in 1..whole.len() {
            let mut decoder = EventStreamDecoder::new();
            let mut events = decoder.push(&whole[..split]);
            events.extend(decoder.push(&whole[split..]));
            assert_eq!(
                events,
                vec![token("a"), token("b"), StreamEvent::Done],
                "split at {split}"
            );
        }
    }

    #[test]
    fn malformed_payloads_are_skipped() {
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(
            b"data: {\"content\":\"x\"}\ndata: {oops\n: keep-alive comment\ndata: {\"content\":\"y\"}\n",
        );
        assert_eq!(events, vec![token("x"), token("y")]);
        assert!(!decoder.is_finished());
    }

    #[test]
    fn stop_flag_ends_the_stream_after_its_content() {
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(b"data: {\"content\":\"end\",\"stop\":true}\r\n\r\n");
        assert_eq!(events, vec![token("end"), StreamEvent::Done]);
        assert!(decoder.push(b"data: {\"content\":\"late\"}\n").is_empty());
    }

    #[test]
    fn empty_content_is_not_a_token() {
        let mut decoder = EventStreamDecoder::new();
        assert!(decoder.push(b"data: {\"content\":\"\"}\n").is_empty());
    }

    #[test]
    fn finish_flushes_tail_and_terminates_once() {
        let mut decoder = EventStreamDecoder::new();
        assert!(decoder.push(b"data: {\"content\":\"tail\"}").is_empty());
        assert_eq!(decoder.finish(), vec![token("tail"), StreamEvent::Done]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn oversized_partial_line_ends_with_error() {
        let mut decoder = EventStreamDecoder::new();
        assert_eq!(
            decoder.push(b"data: {\"content\":\"ok\"}\ndata: "),
            vec![token("ok")]
        );
        let filler = vec![b'x'; MAX_LINE_BYTES];
        let events = decoder.push(&filler);
        assert!(matches!(events.as_slice(), [StreamEvent::Error { .. }]));
        assert!(decoder.is_finished());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn line_at_the_limit_is_still_buffered() {
        let mut decoder = EventStreamDecoder::new();
        assert!(decoder.push(&vec![b' '; MAX_LINE_BYTES]).is_empty());
        assert!(!decoder.is_finished());
    }

    #[tokio::test]
    async fn decode_stream_reports_transport_errors() {
        let chunks: Vec<Result<&'static [u8], String>> = vec![
            Ok(b"data: {\"content\":\"one\"}\n"),
            Err("connection reset".to_string()),
            Ok(b"data: {\"content\":\"two\"}\n"),
        ];
        let events: Vec<_> = decode_stream(futures_util::stream::iter(chunks), None)
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], token("one"));
        assert!(matches!(&events[1], StreamEvent::Error { message } if message.contains("connection reset")));
    }

    #[tokio::test(start_paused = true)]
    async fn decode_stream_times_out_on_stall() {
        let body = futures_util::stream::iter(vec![Ok::<_, String>(
            b"data: {\"content\":\"first\"}\n" as &'static [u8],
        )])
        .chain(futures_util::stream::pending());
        let events: Vec<_> = decode_stream(body, Some(Duration::from_secs(5)))
            .collect()
            .await;
        assert_eq!(events[0], token("first"));
        assert!(matches!(events[1], StreamEvent::Error { .. }));
        assert_eq!(events.len(), 2);
    }
}
