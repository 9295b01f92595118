use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub enum Query {
    Snapshot,
    Resize { cols: usize, rows: usize },
}

#[derive(Debug, Clone)]
pub enum QueryResponse {
    Snapshot(ScreenSnapshot),
    Ok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub row: usize,
    pub col: usize,
    pub visible: bool,
}

/// Emulator state at a point in the session's output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSnapshot {
    pub cols: usize,
    pub rows: usize,
    /// Scrollback followed by the visible screen, oldest first, with
    /// trailing whitespace trimmed.
    pub lines: Vec<String>,
    /// Index into `lines` of the first visible row.
    pub first_visible: usize,
    pub cursor: Cursor,
    /// Sequence number of the last output chunk reflected here; 0 if none.
    pub through_seq: u64,
}

impl ScreenSnapshot {
    pub fn scrollback(&self) -> &[String] {
        &self.lines[..self.first_visible]
    }

    pub fn visible(&self) -> &[String] {
        &self.lines[self.first_visible..]
    }

    /// All text with trailing blank lines removed.
    pub fn text(&self) -> String {
        let end = self
            .lines
            .iter()
            .rposition(|l| !l.is_empty())
            .map_or(0, |i| i + 1);
        self.lines[..end].join("\n")
    }

    /// Escape sequence that repaints a freshly reset terminal of the same
    /// size: scrollback first, so it scrolls off the top, then the visible
    /// rows, then the cursor.
    pub fn replay(&self) -> String {
        let mut out = String::from("\x1b[0m\x1b[H\x1b[2J\x1b[3J");
        out.push_str(&self.lines.join("\r\n"));
        out.push_str(&format!("\x1b[{};{}H", self.cursor.row + 1, self.cursor.col + 1));
        if !self.cursor.visible {
            out.push_str("\x1b[?25l");
        }
        out
    }
}
