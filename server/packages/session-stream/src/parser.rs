//! Incremental decoder for the upstream event stream.
//!
//! Upstream frames are server-sent-event blocks terminated by a blank line.
//! The parser keeps whatever trails the last complete block and retries it
//! when the next chunk arrives, so payloads split across reads are never
//! treated as errors. Raw block bytes are preserved exactly for forwarding.

use bytes::{Bytes, BytesMut};
use serde_json::Value;

/// Literal payload the upstream sends to mark the end of a generation.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    /// `data:` payload decoded as a JSON object.
    Json(Value),
    /// The termination sentinel.
    Done,
    /// Comments, keep-alives and payloads that are not JSON objects.
    Opaque,
}

#[derive(Debug, Clone)]
pub struct Frame {
    raw: Bytes,
    payload: FramePayload,
}

/// Text a frame contributes to the session's derived status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextDelta<'a> {
    Content(&'a str),
    Reasoning(&'a str),
}

impl Frame {
    pub fn decode(raw: Bytes) -> Self {
        let payload = decode_payload(&raw);
        Self { raw, payload }
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn payload(&self) -> &FramePayload {
        &self.payload
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self.payload, FramePayload::Done)
    }

    /// Textual `content` carried by a JSON payload, if any.
    ///
    /// `reasoning` payloads feed a separate channel and `error` payloads are
    /// never accumulated.
    pub fn text_delta(&self) -> Option<TextDelta<'_>> {
        let FramePayload::Json(value) = &self.payload else {
            return None;
        };
        let content = value.get("content")?.as_str()?;
        match value.get("type").and_then(Value::as_str) {
            Some("reasoning") => Some(TextDelta::Reasoning(content)),
            Some("error") => None,
            _ => Some(TextDelta::Content(content)),
        }
    }
}

#[derive(Debug, Default)]
pub struct FrameParser {
    remainder: BytesMut,
    scanned: usize,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one upstream chunk and return every block it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.remainder.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(end) = find_block_end(&self.remainder, self.scanned) {
            let raw = self.remainder.split_to(end).freeze();
            frames.push(Frame::decode(raw));
            self.scanned = 0;
        }
        // A delimiter may straddle the next chunk boundary.
        self.scanned = self.remainder.len().saturating_sub(2);
        frames
    }

    /// Flush the trailing partial block once the upstream has ended.
    pub fn finish(&mut self) -> Option<Frame> {
        self.scanned = 0;
        let raw = self.remainder.split().freeze();
        if raw.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(Frame::decode(raw))
    }

    pub fn remainder(&self) -> &[u8] {
        &self.remainder
    }
}

/// Index just past the first blank-line delimiter at or after `from`.
fn find_block_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut idx = from;
    while idx < buf.len() {
        if buf[idx] == b'\n' {
            match buf.get(idx + 1) {
                Some(b'\n') => return Some(idx + 2),
                Some(b'\r') if buf.get(idx + 2) == Some(&b'\n') => return Some(idx + 3),
                _ => {}
            }
        }
        idx += 1;
    }
    None
}

fn decode_payload(raw: &[u8]) -> FramePayload {
    let Ok(text) = std::str::from_utf8(raw) else {
        return FramePayload::Opaque;
    };

    let data = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|line| line.strip_prefix(' ').unwrap_or(line))
        .collect::<Vec<_>>();
    if data.is_empty() {
        return FramePayload::Opaque;
    }

    let data = data.join("\n");
    let data = data.trim();
    if data == DONE_SENTINEL {
        return FramePayload::Done;
    }

    match serde_json::from_str::<Value>(data) {
        Ok(value) if value.is_object() => FramePayload::Json(value),
        _ => FramePayload::Opaque,
    }
}
