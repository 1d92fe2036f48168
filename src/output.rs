//! Captured subprocess output.
//!
//! `kubectl` and `sql-tapd` report their failures on stderr. The runner keeps the
//! tail of that stream in a `StderrTail` so terminal errors can quote it without
//! the operator having to re-run anything.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use strip_ansi_escapes::strip;

/// Lines kept per subprocess.
pub const DEFAULT_TAIL_LINES: usize = 20;

/// A fixed-capacity ring buffer of output lines.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: String) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Joins the buffered lines into one line of error text.
    pub fn joined(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" / ")
    }
}

/// Shared handle to the stderr tail of a running subprocess.
#[derive(Debug, Clone)]
pub struct StderrTail {
    inner: Arc<Mutex<LogBuffer>>,
}

impl StderrTail {
    pub fn new(max_lines: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogBuffer::new(max_lines))),
        }
    }

    pub fn push_line(&self, line: &str) {
        self.inner.lock().push(sanitize_text(line));
    }

    /// The captured text, or `None` when nothing was written.
    pub fn text(&self) -> Option<String> {
        let buffer = self.inner.lock();
        if buffer.is_empty() {
            return None;
        }
        let joined = buffer.joined();
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }
}

/// Strips ANSI escape codes. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_drops_oldest() {
        let mut buffer = LogBuffer::new(2);
        buffer.push("a".into());
        buffer.push("b".into());
        let dropped = buffer.push("c".into());
        assert!(dropped);
        assert_eq!(buffer.joined(), "b / c");
    }

    #[test]
    fn stderr_tail_strips_escape_codes() {
        let tail = StderrTail::new(4);
        assert_eq!(tail.text(), None);
        tail.push_line("\u{1b}[31merror:\u{1b}[0m unable to listen on port 5432");
        tail.push_line("   ");
        assert_eq!(
            tail.text().as_deref(),
            Some("error: unable to listen on port 5432")
        );
    }
}
