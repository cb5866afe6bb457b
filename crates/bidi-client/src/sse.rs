//! # SSE Decoder
//!
//! Incremental Server-Sent Events decoder for the push stream.
//!
//! - Line buffering from chunked responses (`\n` or `\r\n` line endings)
//! - `event`, `data`, `id` and `retry` fields
//! - Multi-line `data` joined with `\n`
//! - Comment lines (`:`) ignored, which covers keep-alive pings
//!
//! A frame is dispatched on the blank line that ends it. A trailing frame
//! without its blank line is discarded at end of stream.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tracing::trace;

use bidi_core::protocol::MESSAGE_EVENT;

/// One dispatched SSE event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name; `message` when the frame carried no `event` field.
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
    /// Last `id` field seen in this frame.
    pub id: Option<String>,
    /// Reconnection hint in milliseconds.
    pub retry: Option<u64>,
}

/// Stateful decoder fed with raw body chunks.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: BytesMut,
    event: Option<String>,
    data: String,
    has_data: bool,
    id: Option<String>,
    retry: Option<u64>,
}

impl SseDecoder {
    /// An empty decoder.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            event: None,
            data: String::new(),
            has_data: false,
            id: None,
            retry: None,
        }
    }

    /// Append `chunk` and return every frame it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line_bytes = self.buffer.split_to(newline_pos + 1);
            line_bytes.truncate(line_bytes.len() - 1);
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.truncate(line_bytes.len() - 1);
            }

            let Ok(line) = std::str::from_utf8(&line_bytes) else {
                trace!("skipping non UTF-8 SSE line");
                continue;
            };

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
            } else {
                self.process_line(line);
            }
        }
        frames
    }

    fn process_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" if !value.contains('\0') => self.id = Some(value.to_owned()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(ms);
                }
            }
            _ => trace!(field, "ignoring unknown SSE field"),
        }
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let retry = self.retry.take();
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        Some(SseFrame {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| MESSAGE_EVENT.to_owned()),
            data: std::mem::take(&mut self.data),
            id: self.id.clone(),
            retry,
        })
    }
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a byte stream into SSE frames.
///
/// Read errors are passed through; the stream ends after the first one.
pub fn frames<S, E>(byte_stream: S) -> impl Stream<Item = Result<SseFrame, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Send + 'static,
{
    futures::stream::unfold(
        (byte_stream, SseDecoder::new(), Vec::<SseFrame>::new().into_iter(), false),
        |(mut stream, mut decoder, mut pending, done)| async move {
            loop {
                if let Some(frame) = pending.next() {
                    return Some((Ok(frame), (stream, decoder, pending, done)));
                }
                if done {
                    return None;
                }
                match stream.next().await {
                    Some(Ok(chunk)) => pending = decoder.feed(&chunk).into_iter(),
                    Some(Err(e)) => return Some((Err(e), (stream, decoder, pending, true))),
                    None => return None,
                }
            }
        },
    )
}
