//! Decoder for the agent's line-framed streaming response.
//!
//! Each event arrives as one `data: <json>\n` line. The literal `data: [DONE]`
//! ends the stream; lines without the `data: ` marker are ignored and
//! unparsable payloads are logged and skipped.

use crate::error::DecodeError;
use crate::lines::LineReader;
use crate::protocol::StreamChunk;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_SENTINEL: &str = "[DONE]";

const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLine {
    Chunk(StreamChunk),
    Done,
    Ignored,
    Malformed { payload: String, reason: String },
}

pub fn classify_line(line: &str) -> DecodedLine {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return DecodedLine::Ignored;
    };

    if payload == DONE_SENTINEL {
        return DecodedLine::Done;
    }

    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => DecodedLine::Chunk(chunk),
        Err(err) => DecodedLine::Malformed {
            payload: payload.to_string(),
            reason: err.to_string(),
        },
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderOptions {
    /// Classify an unterminated last line when the stream closes instead of
    /// discarding it.
    pub flush_trailing_line: bool,
}

/// How a decoded stream came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Sentinel,
    Closed,
    Cancelled,
}

/// Per-request decoder state. Created fresh for every response body.
#[derive(Debug)]
pub struct StreamDecoder {
    lines: LineReader,
    options: DecoderOptions,
    finished: bool,
}

impl StreamDecoder {
    pub fn new(options: DecoderOptions) -> Self {
        Self {
            lines: LineReader::new(),
            options,
            finished: false,
        }
    }

    /// True once the `[DONE]` sentinel has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn pending(&self) -> usize {
        self.lines.pending()
    }

    /// Feeds a block of bytes and returns every chunk it completed, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        if self.finished {
            return chunks;
        }

        self.lines.push(bytes);
        while let Some(line) = self.lines.next_line() {
            if self.accept(&line, &mut chunks) {
                self.finished = true;
                self.lines.clear();
                break;
            }
        }
        chunks
    }

    /// Called at natural end of stream.
    pub fn finish(&mut self) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        if self.finished {
            return chunks;
        }
        self.finished = true;

        let Some(tail) = self.lines.take_remainder() else {
            return chunks;
        };
        if self.options.flush_trailing_line {
            self.accept(&tail, &mut chunks);
        } else {
            debug!(bytes = tail.len(), "discarding unterminated trailing line");
        }
        chunks
    }

    // Returns true when the line was the sentinel.
    fn accept(&self, line: &str, chunks: &mut Vec<StreamChunk>) -> bool {
        match classify_line(line) {
            DecodedLine::Chunk(chunk) => chunks.push(chunk),
            DecodedLine::Done => return true,
            DecodedLine::Ignored => {}
            DecodedLine::Malformed { payload, reason } => {
                warn!(
                    error = %reason,
                    data_preview = preview(&payload),
                    "skipping malformed stream line"
                );
            }
        }
        false
    }
}

/// Reads `stream` to completion, dispatching every decoded chunk to
/// `on_chunk` in arrival order.
///
/// Reads are sequential. Cancelling `cancel` stops further reads and drops
/// the stream; any partial line still buffered is never dispatched.
pub async fn decode_stream<S, E, F, Fut>(
    mut stream: S,
    cancel: &CancellationToken,
    options: DecoderOptions,
    mut on_chunk: F,
) -> Result<StreamEnd, DecodeError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
    F: FnMut(StreamChunk) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut decoder = StreamDecoder::new(options);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(pending = decoder.pending(), "stream cancelled");
                return Ok(StreamEnd::Cancelled);
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                for chunk in decoder.push(&bytes) {
                    if cancel.is_cancelled() {
                        return Ok(StreamEnd::Cancelled);
                    }
                    on_chunk(chunk).await;
                }
                if decoder.is_finished() {
                    return Ok(StreamEnd::Sentinel);
                }
            }
            Some(Err(err)) => return Err(DecodeError::Read(err.into())),
            None => {
                for chunk in decoder.finish() {
                    on_chunk(chunk).await;
                }
                return Ok(StreamEnd::Closed);
            }
        }
    }
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn decode_all(reads: &[&[u8]]) -> Vec<StreamChunk> {
        let mut decoder = StreamDecoder::new(DecoderOptions::default());
        let mut chunks = Vec::new();
        for read in reads {
            chunks.extend(decoder.push(read));
        }
        chunks.extend(decoder.finish());
        chunks
    }

    fn byte_stream(
        reads: Vec<&'static str>,
    ) -> impl Stream<Item = Result<Bytes, io::Error>> + Unpin {
        futures::stream::iter(reads.into_iter().map(|r| Ok(Bytes::from(r))))
    }

    const BODY: &str = concat!(
        "data: {\"type\":\"thinking\",\"content\":\"Looking up \u{1f4d8} notes\",\"action\":\"search\"}\n",
        ": keep-alive\n",
        "data: {\"type\":\"content\",\"content\":\"Les r\u{e9}sultats \u{2014} \"}\n",
        "data: {\"type\":\"content\",\"content\":\"sont pr\u{ea}ts\"}\n",
        "data: {\"type\":\"files\",\"files\":[{\"id\":\"1\",\"name\":\"quiz.pdf\",\"mimeType\":\"application/pdf\",\"downloadUrl\":\"https://x/1\"}]}\n",
        "data: [DONE]\n",
    );

    #[test]
    fn classify_recognizes_each_line_kind() {
        assert_eq!(
            classify_line(r#"data: {"type":"content","content":"Hi"}"#),
            DecodedLine::Chunk(StreamChunk::content("Hi"))
        );
        assert_eq!(classify_line("data: [DONE]"), DecodedLine::Done);
        assert_eq!(classify_line("event: message"), DecodedLine::Ignored);
        assert_eq!(classify_line(""), DecodedLine::Ignored);
        assert_eq!(classify_line("data:[DONE]"), DecodedLine::Ignored);
        assert!(matches!(
            classify_line("data: {not json"),
            DecodedLine::Malformed { .. }
        ));
    }

    #[test]
    fn every_single_split_point_gives_same_chunks() {
        let bytes = BODY.as_bytes();
        let expected = decode_all(&[bytes]);
        assert_eq!(expected.len(), 4);

        for split in 0..=bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(decode_all(&[a, b]), expected, "split at {split}");
        }
    }

    #[test]
    fn byte_at_a_time_gives_same_chunks() {
        let bytes = BODY.as_bytes();
        let expected = decode_all(&[bytes]);
        let reads: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(decode_all(&reads), expected);

        for size in [2, 3, 5, 7, 13] {
            let reads: Vec<&[u8]> = bytes.chunks(size).collect();
            assert_eq!(decode_all(&reads), expected, "reads of {size} bytes");
        }
    }

    #[test]
    fn done_stops_lines_already_buffered() {
        let chunks = decode_all(&[concat!(
            "data: {\"type\":\"content\",\"content\":\"a\"}\n",
            "data: [DONE]\n",
            "data: {\"type\":\"content\",\"content\":\"never\"}\n",
        )
        .as_bytes()]);
        assert_eq!(chunks, vec![StreamChunk::content("a")]);
    }

    #[test]
    fn pushes_after_done_are_ignored() {
        let mut decoder = StreamDecoder::new(DecoderOptions::default());
        assert!(decoder.push(b"data: [DONE]\n").is_empty());
        assert!(decoder.is_finished());
        assert!(
            decoder
                .push(b"data: {\"type\":\"content\",\"content\":\"late\"}\n")
                .is_empty()
        );
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn malformed_line_does_not_stop_later_lines() {
        let chunks = decode_all(&[concat!(
            "data: {\"type\":\"content\",\"content\":\"one\"}\n",
            "data: {\"type\":\"content\",\"cont\n",
            "data: {\"type\":\"mystery\"}\n",
            "data: {\"type\":\"content\",\"content\":\"two\"}\n",
        )
        .as_bytes()]);
        assert_eq!(
            chunks,
            vec![StreamChunk::content("one"), StreamChunk::content("two")]
        );
    }

    #[test]
    fn lines_without_marker_never_reach_the_handler() {
        let chunks = decode_all(&[concat!(
            "{\"type\":\"content\",\"content\":\"bare\"}\n",
            "data:{\"type\":\"content\",\"content\":\"no space\"}\n",
            "id: 7\n",
            "\n",
        )
        .as_bytes()]);
        assert!(chunks.is_empty());
    }

    #[test]
    fn trailing_line_discarded_unless_flushing() {
        let body: &[u8] = b"data: {\"type\":\"error\",\"error\":\"quota\"}";
        assert!(decode_all(&[body]).is_empty());

        let mut decoder = StreamDecoder::new(DecoderOptions {
            flush_trailing_line: true,
        });
        assert!(decoder.push(body).is_empty());
        assert_eq!(
            decoder.finish(),
            vec![StreamChunk::Error {
                error: "quota".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn three_read_scenario_dispatches_one_chunk() {
        let stream = byte_stream(vec![
            "data: {\"typ",
            "e\":\"content\",\"content\":\"Hi\"}\ndata: [DO",
            "NE]\n",
            "data: {\"type\":\"content\",\"content\":\"after\"}\n",
        ]);
        let mut seen = Vec::new();
        let end = decode_stream(
            stream,
            &CancellationToken::new(),
            DecoderOptions::default(),
            |chunk| {
                seen.push(chunk);
                async {}
            },
        )
        .await
        .unwrap();

        assert_eq!(end, StreamEnd::Sentinel);
        assert_eq!(seen, vec![StreamChunk::content("Hi")]);
    }

    #[tokio::test]
    async fn natural_close_without_sentinel() {
        let stream = byte_stream(vec!["data: {\"type\":\"content\",\"content\":\"x\"}\n"]);
        let mut seen = Vec::new();
        let end = decode_stream(
            stream,
            &CancellationToken::new(),
            DecoderOptions::default(),
            |chunk| {
                seen.push(chunk);
                async {}
            },
        )
        .await
        .unwrap();

        assert_eq!(end, StreamEnd::Closed);
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn read_error_is_terminal() {
        let stream = futures::stream::iter(vec![
            Ok(Bytes::from("data: {\"type\":\"content\",\"content\":\"a\"}\n")),
            Err(io::Error::other("connection reset")),
            Ok(Bytes::from("data: {\"type\":\"content\",\"content\":\"b\"}\n")),
        ]);
        let mut seen = Vec::new();
        let result = decode_stream(
            stream,
            &CancellationToken::new(),
            DecoderOptions::default(),
            |chunk| {
                seen.push(chunk);
                async {}
            },
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(seen, vec![StreamChunk::content("a")]);
    }

    #[tokio::test]
    async fn cancellation_stops_reads_and_drops_partial_line() {
        let stream = byte_stream(vec![
            "data: {\"type\":\"content\",\"content\":\"first\"}\ndata: {\"type\":\"content\",\"content\":\"par",
        ])
        .chain(futures::stream::pending());
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();

        let handler_cancel = cancel.clone();
        let end = decode_stream(stream, &cancel, DecoderOptions::default(), |chunk| {
            seen.push(chunk);
            handler_cancel.cancel();
            async {}
        })
        .await
        .unwrap();

        assert_eq!(end, StreamEnd::Cancelled);
        assert_eq!(seen, vec![StreamChunk::content("first")]);
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let long = "\u{e9}".repeat(150);
        assert_eq!(preview(&long).chars().count(), PREVIEW_CHARS);
        assert_eq!(preview("short"), "short");
    }
}
