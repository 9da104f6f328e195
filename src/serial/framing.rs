//! Newline framing for the inbound byte stream.
use std::fmt;
use std::ops::Deref;

/// Cap on buffered bytes without a terminator. On overflow the oldest bytes go.
pub const MAX_BUFFERED_BYTES: usize = 4096;

/// One received text frame, terminator already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line(String);

impl Line {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Deref for Line {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Line {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Counters reported by `LineFramer::push`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramingStats {
    pub trimmed_bytes: usize,
    pub lossy_lines: usize,
}

/// Accumulates raw bytes and yields complete lines. CR, LF and CRLF all terminate
/// a line; blank lines are dropped.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    capacity: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_capacity(MAX_BUFFERED_BYTES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity.min(MAX_BUFFERED_BYTES)),
            capacity: capacity.max(1),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Append `bytes` and drain every complete line, oldest first.
    pub fn push(&mut self, bytes: &[u8]) -> (Vec<Line>, FramingStats) {
        let mut stats = FramingStats::default();
        let mut lines = Vec::new();

        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let body = &raw[..raw.len() - 1];
            if let Some(line) = decode_line(body, &mut stats) {
                lines.push(line);
            }
        }

        if self.buffer.len() > self.capacity {
            let excess = self.buffer.len() - self.capacity;
            self.buffer.drain(..excess);
            stats.trimmed_bytes += excess;
            log::warn!("Line buffer overflow, dropped {} oldest bytes", excess);
        }

        (lines, stats)
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_line(body: &[u8], stats: &mut FramingStats) -> Option<Line> {
    let text = match std::str::from_utf8(body) {
        Ok(s) => s.to_string(),
        Err(_) => {
            stats.lossy_lines += 1;
            String::from_utf8_lossy(body).into_owned()
        }
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(Line(trimmed.to_string()))
    }
}
