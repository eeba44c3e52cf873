use crate::classify::ProtocolFamily;
use crate::usage::{self, UsageRecord};
use bytes::{Bytes, BytesMut};

/// Trailing-window cap for an unterminated SSE frame. Anything larger is
/// not a usage frame; older bytes are discarded rather than buffered.
const MAX_PENDING_FRAME: usize = 1024 * 1024;

/// Observes SSE chunks as they pass through to the client, extracting the
/// usage object from terminal frames. Chunks are never modified or
/// re-framed — the relay forwards the exact bytes it received.
pub struct SseObserver {
    family: ProtocolFamily,
    pending: BytesMut,
    usage: UsageRecord,
    seen_usage: bool,
    saw_done: bool,
}

impl SseObserver {
    pub fn new(family: ProtocolFamily) -> Self {
        Self {
            family,
            pending: BytesMut::new(),
            usage: UsageRecord::default(),
            seen_usage: false,
            saw_done: false,
        }
    }

    /// Feed one relayed chunk. Complete frames (terminated by a blank line)
    /// are scanned; the unterminated tail is kept for the next chunk.
    pub fn observe(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);

        loop {
            let Some(boundary) = find_frame_boundary(&self.pending) else {
                break;
            };
            let frame = self.pending.split_to(boundary.end);
            self.scan_frame(&frame[..boundary.start]);
        }

        if self.pending.len() > MAX_PENDING_FRAME {
            let excess = self.pending.len() - MAX_PENDING_FRAME;
            let _ = self.pending.split_to(excess);
        }
    }

    fn scan_frame(&mut self, frame: &[u8]) {
        for line in frame.split(|&b| b == b'\n') {
            let line = trim_cr(line);
            let Some(data) = strip_data_prefix(line) else {
                continue;
            };
            if data == b"[DONE]" {
                self.saw_done = true;
                continue;
            }
            let Ok(payload) = serde_json::from_slice::<serde_json::Value>(data) else {
                continue;
            };
            if let Some(incoming) = usage::from_stream_event(self.family, &payload) {
                self.usage.merge(incoming);
                self.seen_usage = true;
            }
        }
    }

    /// Flush any unterminated tail (streams that end without a trailing
    /// blank line) and return the accumulated usage.
    pub fn finish(mut self) -> Option<UsageRecord> {
        if !self.pending.is_empty() {
            let tail = self.pending.split();
            self.scan_frame(&tail);
        }
        self.seen_usage.then_some(self.usage)
    }

    pub fn saw_done(&self) -> bool {
        self.saw_done
    }
}

struct FrameBoundary {
    /// Frame content length (exclusive of the separator).
    start: usize,
    /// Offset just past the separator.
    end: usize,
}

/// SSE frames end at a blank line: `\n\n` or `\r\n\r\n`.
fn find_frame_boundary(buf: &[u8]) -> Option<FrameBoundary> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some(FrameBoundary {
                start: i,
                end: i + 2,
            });
        }
        if i + 3 < buf.len() && &buf[i..i + 4] == b"\r\n\r\n" {
            return Some(FrameBoundary {
                start: i,
                end: i + 4,
            });
        }
        i += 1;
    }
    None
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn strip_data_prefix(line: &[u8]) -> Option<&[u8]> {
    let rest = line.strip_prefix(b"data:")?;
    Some(rest.strip_prefix(b" ").unwrap_or(rest))
}

/// Bounded capture of a relayed (non-SSE) response body so usage can be
/// parsed after the stream ends. The relay itself stays unbounded; only
/// the captured copy is capped.
pub struct BodyCapture {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

/// Marker appended when the captured copy was cut off at the cap.
pub const RECORDING_TRUNCATED: &str = "[RECORDING_TRUNCATED]";

impl BodyCapture {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            truncated: false,
        }
    }

    pub fn observe(&mut self, chunk: &[u8]) {
        if self.truncated {
            return;
        }
        let remaining = self.cap.saturating_sub(self.buf.len());
        if chunk.len() > remaining {
            self.buf.extend_from_slice(&chunk[..remaining]);
            self.buf.extend_from_slice(RECORDING_TRUNCATED.as_bytes());
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(chunk);
        }
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }

    /// Parse the captured body as JSON. Truncated captures never parse —
    /// by construction the sentinel breaks the JSON — which is the correct
    /// outcome: a half-recorded payload must not produce usage numbers.
    pub fn parse_json(&self) -> Option<serde_json::Value> {
        if self.truncated {
            return None;
        }
        serde_json::from_slice(&self.buf).ok()
    }
}
