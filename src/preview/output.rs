use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lines kept per project, across restarts.
pub const MAX_LOG_LINES: usize = 1000;

/// Lines of output attached to a failed start or crash.
pub const ERROR_TAIL_LINES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Monotonic per-project line number.
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub text: String,
}

/// Bounded output history for one project's preview server.
#[derive(Debug, Default)]
pub struct OutputLog {
    lines: VecDeque<LogLine>,
    next_index: u64,
    run_start: u64,
}

impl OutputLog {
    pub fn push(&mut self, stream: LogStream, text: impl Into<String>) {
        self.lines.push_back(LogLine {
            index: self.next_index,
            timestamp: Utc::now(),
            stream,
            text: text.into(),
        });
        self.next_index += 1;
        if self.lines.len() > MAX_LOG_LINES {
            self.lines.pop_front();
        }
    }

    /// Mark the start of a new process run. [`OutputLog::error_tail`] only
    /// looks at lines pushed after this.
    pub fn begin_run(&mut self) {
        self.run_start = self.next_index;
    }

    /// Last `limit` lines, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<LogLine> {
        let skip = self.lines.len().saturating_sub(limit);
        self.lines.iter().skip(skip).cloned().collect()
    }

    /// Process output (not system lines) of the current run, joined.
    pub fn error_tail(&self) -> String {
        let mut tail: Vec<&str> = self
            .lines
            .iter()
            .rev()
            .take_while(|l| l.index >= self.run_start)
            .filter(|l| l.stream != LogStream::System)
            .take(ERROR_TAIL_LINES)
            .map(|l| l.text.as_str())
            .collect();
        tail.reverse();
        tail.join("\n")
    }
}

/// Case-insensitive readiness check. `marker_lower` must already be
/// lowercase.
pub fn contains_marker(line: &str, marker_lower: &str) -> bool {
    line.to_lowercase().contains(marker_lower)
}
