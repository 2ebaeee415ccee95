//! Incremental Server-Sent Events decoding for provider streams.
//!
//! All four back-ends stream over HTTP SSE. [`SseDecoder`] is a push-style
//! decoder: feed it raw byte chunks as they arrive and it yields the `data:`
//! payload strings, handling:
//!
//! - partial lines buffered across reads (chunks may split mid-line)
//! - `data: ` prefix extraction (with and without the space)
//! - `[DONE]` end-marker filtering
//! - a final flush for providers that end without a trailing newline

use std::collections::VecDeque;

use bytes::BytesMut;

use crate::abort::AbortState;
use crate::provider::{ProviderError, TextChunkStream};

/// Push-style SSE line decoder.
///
/// Chunks are delivered to [`feed`](Self::feed) in receipt order; the decoder
/// never reorders or drops payloads and buffers at most one partial trailing
/// line between reads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
}

impl SseDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Feed one chunk of bytes, returning every complete `data:` payload it
    /// completes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            // Zero-copy split of the line bytes out of the buffer
            let mut line_bytes = self.buffer.split_to(newline_pos + 1);
            line_bytes.truncate(line_bytes.len() - 1);
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.truncate(line_bytes.len() - 1);
            }

            let Ok(line) = std::str::from_utf8(&line_bytes) else {
                continue; // skip invalid UTF-8 lines
            };
            if let Some(data) = extract_sse_data(line) {
                out.push(data);
            }
        }
        out
    }

    /// Flush the remaining buffer after the stream ends.
    ///
    /// Some providers leave the final event without a trailing newline; the
    /// OpenAI-style `[DONE]` marker makes this a no-op there.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let remaining = self.buffer.split();
        let line = std::str::from_utf8(&remaining).ok()?;
        extract_sse_data(line.trim())
    }
}

/// Extract the data payload from an SSE line.
///
/// Returns `Some(data)` for valid data lines, `None` for comments, empty
/// lines, non-data fields, and `[DONE]` markers.
fn extract_sse_data(line: &str) -> Option<String> {
    let trimmed = line.trim();

    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }

    let data = trimmed
        .strip_prefix("data: ")
        .or_else(|| trimmed.strip_prefix("data:"))?;
    let data = data.trim();

    if data == "[DONE]" || data.is_empty() {
        return None;
    }

    Some(data.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Response adaptation
// ─────────────────────────────────────────────────────────────────────────────

struct ResponseStreamState {
    response: reqwest::Response,
    decoder: SseDecoder,
    abort: AbortState,
    extract: fn(&str) -> Option<String>,
    pending: VecDeque<String>,
    finished: bool,
}

/// Adapt an SSE response body into a text chunk stream.
///
/// Every read races against `abort`, so a deadline or external cancel during
/// a long gap between events surfaces as the appropriate error instead of
/// hanging. `extract` maps one decoded `data:` payload to its text fragment;
/// payloads it rejects are dropped silently.
pub fn response_text_stream(
    response: reqwest::Response,
    abort: AbortState,
    extract: fn(&str) -> Option<String>,
) -> TextChunkStream {
    let state = ResponseStreamState {
        response,
        decoder: SseDecoder::new(),
        abort,
        extract,
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures::stream::try_unfold(state, |mut state| async move {
        loop {
            if let Some(chunk) = state.pending.pop_front() {
                return Ok(Some((chunk, state)));
            }
            if state.finished {
                return Ok(None);
            }

            let ResponseStreamState {
                response, abort, ..
            } = &mut state;
            let next = abort
                .run(async { response.chunk().await.map_err(ProviderError::from) })
                .await?;

            match next {
                Some(bytes) => {
                    for data in state.decoder.feed(&bytes) {
                        if let Some(text) = (state.extract)(&data) {
                            state.pending.push_back(text);
                        }
                    }
                }
                None => {
                    state.finished = true;
                    if let Some(data) = state.decoder.finish() {
                        if let Some(text) = (state.extract)(&data) {
                            state.pending.push_back(text);
                        }
                    }
                }
            }
        }
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(chunks: &[&[u8]]) -> Vec<String> {
        let mut decoder = SseDecoder::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(decoder.feed(chunk));
        }
        out.extend(decoder.finish());
        out
    }

    // ── extract_sse_data ─────────────────────────────────────────────────

    #[test]
    fn extract_data_line() {
        assert_eq!(
            extract_sse_data("data: {\"type\":\"message\"}"),
            Some("{\"type\":\"message\"}".into())
        );
    }

    #[test]
    fn extract_data_line_no_space() {
        assert_eq!(
            extract_sse_data("data:{\"a\":1}"),
            Some("{\"a\":1}".into())
        );
    }

    #[test]
    fn extract_skips_done_marker() {
        assert_eq!(extract_sse_data("data: [DONE]"), None);
    }

    #[test]
    fn extract_skips_empty_data() {
        assert_eq!(extract_sse_data("data: "), None);
        assert_eq!(extract_sse_data("data:"), None);
    }

    #[test]
    fn extract_skips_comments_and_other_fields() {
        assert_eq!(extract_sse_data(": keep-alive"), None);
        assert_eq!(extract_sse_data("event: message"), None);
        assert_eq!(extract_sse_data("id: 3"), None);
        assert_eq!(extract_sse_data(""), None);
    }

    // ── Decoder ──────────────────────────────────────────────────────────

    #[test]
    fn single_chunk_single_event() {
        let out = decode_all(&[b"data: {\"a\":1}\n\n"]);
        assert_eq!(out, vec!["{\"a\":1}"]);
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let out = decode_all(&[b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n"]);
        assert_eq!(out, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn event_split_mid_line() {
        let out = decode_all(&[b"data: {\"par", b"tial\":true}\n\n"]);
        assert_eq!(out, vec!["{\"partial\":true}"]);
    }

    #[test]
    fn split_boundaries_do_not_change_output() {
        let full: &[u8] = b"data: {\"a\":1}\r\n\r\ndata: {\"b\":2}\n\ndata: [DONE]\n\n";
        let expected = decode_all(&[full]);

        // Every split point must decode identically to one big chunk.
        for split in 1..full.len() {
            let (left, right) = full.split_at(split);
            assert_eq!(decode_all(&[left, right]), expected, "split at {split}");
        }
    }

    #[test]
    fn byte_at_a_time_matches_single_chunk() {
        let full: &[u8] = b"data: {\"x\":\"y\"}\n\ndata: {\"z\":1}\n\n";
        let singles: Vec<&[u8]> = full.chunks(1).collect();
        assert_eq!(decode_all(&singles), decode_all(&[full]));
    }

    #[test]
    fn done_marker_filtered() {
        let out = decode_all(&[b"data: {\"ok\":true}\n\ndata: [DONE]\n\n"]);
        assert_eq!(out, vec!["{\"ok\":true}"]);
    }

    #[test]
    fn comments_and_other_fields_skipped() {
        let out = decode_all(&[b": ping\n\ndata: {\"v\":1}\n\nevent: end\n\n"]);
        assert_eq!(out, vec!["{\"v\":1}"]);
    }

    #[test]
    fn trailing_data_without_newline_flushed() {
        let out = decode_all(&[b"data: {\"trailing\":true}"]);
        assert_eq!(out, vec!["{\"trailing\":true}"]);
    }

    #[test]
    fn carriage_returns_stripped() {
        let out = decode_all(&[b"data: {\"cr\":true}\r\n\r\n"]);
        assert_eq!(out, vec!["{\"cr\":true}"]);
    }

    #[test]
    fn empty_input_no_output() {
        let out = decode_all(&[]);
        assert!(out.is_empty());
        let out = decode_all(&[b""]);
        assert!(out.is_empty());
    }

    #[test]
    fn decoder_reusable_after_finish_drains() {
        let mut decoder = SseDecoder::new();
        let _ = decoder.feed(b"data: partial");
        assert!(decoder.finish().is_some());
        assert!(decoder.finish().is_none());
    }
}
