// Bounded capture of child process output

use crate::redact::Redactor;
use serde::{Deserialize, Serialize};

/// Bytes kept past the cap so a secret straddling the boundary is still
/// recognised by the redactor before the text is cut.
const REDACTION_LOOKAHEAD: usize = 512;

/// Longest partial line held back while streaming before it is flushed anyway
const MAX_PENDING_LINE: usize = 4096;

/// Which pipe a piece of output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A redacted piece of output forwarded while the tool is still running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

/// Final, redacted and capped output of one stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
    /// Bytes the process actually wrote
    pub original_size: usize,
}

/// Keeps the first `cap` bytes (plus lookahead) and counts the rest
#[derive(Debug)]
pub struct BoundedCapture {
    cap: usize,
    buf: Vec<u8>,
    total: usize,
}

impl BoundedCapture {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: Vec::with_capacity(cap.min(64 * 1024)),
            total: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.total += data.len();
        let room = (self.cap + REDACTION_LOOKAHEAD).saturating_sub(self.buf.len());
        if room > 0 {
            self.buf.extend_from_slice(&data[..data.len().min(room)]);
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Redact, then cut to the cap on a character boundary
    pub fn finish(&self, redactor: &Redactor) -> CapturedOutput {
        let text = redactor.redact(&String::from_utf8_lossy(&self.buf));
        let truncated = self.total > self.cap || text.len() > self.cap;
        CapturedOutput {
            text: truncate_at_char_boundary(text, self.cap),
            truncated,
            original_size: self.total,
        }
    }
}

fn truncate_at_char_boundary(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

/// Splits streamed bytes into lines for progress chunks, within a byte budget
#[derive(Debug)]
pub struct LineSplitter {
    pending: Vec<u8>,
    budget: usize,
}

impl LineSplitter {
    pub fn new(budget: usize) -> Self {
        Self {
            pending: Vec::new(),
            budget,
        }
    }

    /// Feed bytes, returning every complete line (newline included)
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        if self.budget == 0 {
            return lines;
        }

        self.pending.extend_from_slice(data);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(text) = self.take_budget(&line) {
                lines.push(text);
            }
        }

        if self.pending.len() >= MAX_PENDING_LINE {
            let line = std::mem::take(&mut self.pending);
            if let Some(text) = self.take_budget(&line) {
                lines.push(text);
            }
        }
        lines
    }

    /// Whatever is left once the stream closes
    pub fn flush(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.pending);
        if line.is_empty() {
            None
        } else {
            self.take_budget(&line)
        }
    }

    fn take_budget(&mut self, line: &[u8]) -> Option<String> {
        if self.budget == 0 {
            return None;
        }
        let slice = &line[..line.len().min(self.budget)];
        self.budget -= slice.len();
        Some(String::from_utf8_lossy(slice).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_output_not_truncated() {
        let mut capture = BoundedCapture::new(100);
        capture.push(b"hello world\n");
        let out = capture.finish(&Redactor::new());
        assert_eq!(out.text, "hello world\n");
        assert!(!out.truncated);
        assert_eq!(out.original_size, 12);
    }

    #[test]
    fn test_large_output_truncated_to_cap() {
        let mut capture = BoundedCapture::new(1024);
        for _ in 0..100 {
            capture.push(&[b'x'; 1000]);
        }
        let out = capture.finish(&Redactor::new());
        assert!(out.truncated);
        assert!(out.text.len() <= 1024);
        assert_eq!(out.original_size, 100_000);
    }

    #[test]
    fn test_truncation_respects_utf8() {
        let mut capture = BoundedCapture::new(5);
        capture.push("ééééé".as_bytes());
        let out = capture.finish(&Redactor::new());
        assert!(out.truncated);
        assert_eq!(out.text, "éé");
    }

    #[test]
    fn test_secret_at_boundary_is_redacted() {
        let mut capture = BoundedCapture::new(20);
        capture.push(b"0123456789abcd password=hunter2hunter2");
        let out = capture.finish(&Redactor::new());
        assert!(!out.text.contains("hunter"));
        assert!(out.text.len() <= 20);
    }

    #[test]
    fn test_line_splitter() {
        let mut splitter = LineSplitter::new(1000);
        assert!(splitter.push(b"par").is_empty());
        assert_eq!(splitter.push(b"tial\nnext\nrest"), vec!["partial\n", "next\n"]);
        assert_eq!(splitter.flush().as_deref(), Some("rest"));
        assert_eq!(splitter.flush(), None);
    }

    #[test]
    fn test_line_splitter_budget() {
        let mut splitter = LineSplitter::new(8);
        assert_eq!(splitter.push(b"12345\n67890\nabc\n"), vec!["12345\n", "67"]);
        assert!(splitter.push(b"more\n").is_empty());
    }
}
