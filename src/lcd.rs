//! Scrolling on-printer status line with a priority carousel, used to
//! surface persistent wrongness — no network, no Connect, 4xx/5xx,
//! fan error, etc. (spec.md §2 component 15, §7 "Error handling design").
//!
//! Grounded on `original_source/prusa/link/printer_adapter/structures/
//! carousel.py`'s `Carousel`/`Screen`/`LCDLine`: only the screens tied
//! for the highest enabled priority are shown (`get_set_to_show`), and
//! each screen's text longer than 19 chars scrolls across multiple
//! lines (`Screen.lines`) rather than the whole carousel round-robining
//! through every active status regardless of priority.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::LCD_QUEUE_SIZE;

const LINE_WIDTH: usize = 19;
const SCROLL_AMOUNT: usize = 10;

/// One status condition the carousel can display (spec.md §7's "user
/// visible surface for persistent wrongness").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LcdStatus {
    NoConnect,
    ConnectError(String),
    FanError(String),
    Custom { priority: i32, text: String },
}

impl LcdStatus {
    fn priority(&self) -> i32 {
        match self {
            LcdStatus::NoConnect => 10,
            LcdStatus::ConnectError(_) => 20,
            LcdStatus::FanError(_) => 30,
            LcdStatus::Custom { priority, .. } => *priority,
        }
    }

    fn text(&self) -> String {
        match self {
            LcdStatus::NoConnect => "No Connect link".to_string(),
            LcdStatus::ConnectError(detail) => format!("Connect error: {}", detail),
            LcdStatus::FanError(name) => format!("{} fan error", name),
            LcdStatus::Custom { text, .. } => text.clone(),
        }
    }
}

/// Cuts `text` into scrolling 19-char windows the way `Screen.lines`
/// does: each step shows the next 19 chars, advancing by
/// [`SCROLL_AMOUNT`] until what's left fits on one line.
fn scroll_lines(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut lines = Vec::new();
    let mut start = 0;
    loop {
        let remaining = chars.len() - start;
        if remaining <= LINE_WIDTH {
            lines.push(chars[start..].iter().collect());
            break;
        }
        let end = (start + LINE_WIDTH).min(chars.len());
        lines.push(chars[start..end].iter().collect());
        start += SCROLL_AMOUNT.min(remaining - LINE_WIDTH);
    }
    lines
}

struct Inner {
    statuses: Vec<LcdStatus>,
    lines: VecDeque<String>,
}

impl Inner {
    fn max_priority_statuses(&self) -> Vec<&LcdStatus> {
        let Some(max_priority) = self.statuses.iter().map(|s| s.priority()).max() else {
            return Vec::new();
        };
        self.statuses.iter().filter(|s| s.priority() == max_priority).collect()
    }

    /// Rewinds the carousel: rebuilds the scroll queue from the current
    /// max-priority screens, in the order they were set.
    fn rewind(&mut self) {
        self.lines.clear();
        for status in self.max_priority_statuses() {
            self.lines.extend(scroll_lines(&status.text()));
        }
    }
}

/// A bounded, priority-ordered carousel of status lines (spec.md §3
/// "LCD printer").
pub struct LcdPrinter {
    inner: Mutex<Inner>,
}

impl LcdPrinter {
    pub fn new() -> Self {
        LcdPrinter {
            inner: Mutex::new(Inner {
                statuses: Vec::with_capacity(LCD_QUEUE_SIZE),
                lines: VecDeque::new(),
            }),
        }
    }

    /// Adds or updates a status line and rewinds the carousel, capped at
    /// [`LCD_QUEUE_SIZE`] tracked statuses. Only the statuses tied for
    /// the highest priority are ever shown.
    pub fn set_status(&self, status: LcdStatus) {
        let mut inner = self.inner.lock().unwrap();
        inner.statuses.retain(|s| std::mem::discriminant(s) != std::mem::discriminant(&status));
        inner.statuses.push(status);
        if inner.statuses.len() > LCD_QUEUE_SIZE {
            inner.statuses.remove(0);
        }
        inner.rewind();
    }

    /// Clears a previously-set status of the same kind (e.g. fan error
    /// resolved).
    pub fn clear_status(&self, status: &LcdStatus) {
        let mut inner = self.inner.lock().unwrap();
        inner.statuses.retain(|s| std::mem::discriminant(s) != std::mem::discriminant(status));
        inner.rewind();
    }

    /// Advances the carousel and returns the next line to display.
    /// Rewinds (recomputes from the current max-priority screens) once
    /// the queue runs dry.
    pub fn next_line(&self) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.lines.is_empty() {
            inner.rewind();
        }
        inner.lines.pop_front()
    }

    pub fn is_clear(&self) -> bool {
        self.inner.lock().unwrap().statuses.is_empty()
    }
}

impl Default for LcdPrinter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_status_sorts_first() {
        let lcd = LcdPrinter::new();
        lcd.set_status(LcdStatus::NoConnect);
        lcd.set_status(LcdStatus::FanError("Print".to_string()));
        let first = lcd.next_line().unwrap();
        assert_eq!(first, "Print fan error");
    }

    #[test]
    fn lower_priority_status_is_not_shown_at_all() {
        let lcd = LcdPrinter::new();
        lcd.set_status(LcdStatus::NoConnect);
        lcd.set_status(LcdStatus::FanError("Print".to_string()));
        for _ in 0..4 {
            assert_eq!(lcd.next_line().unwrap(), "Print fan error");
        }
    }

    #[test]
    fn long_text_scrolls_in_19_char_windows() {
        let lcd = LcdPrinter::new();
        lcd.set_status(LcdStatus::Custom { priority: 5, text: "Connect error: connection refused".to_string() });
        let first = lcd.next_line().unwrap();
        assert_eq!(first.chars().count(), 19);
        assert_eq!(first, "Connect error: conn");
        let second = lcd.next_line().unwrap();
        assert_eq!(second, "ror: connection ref");
    }

    #[test]
    fn clearing_status_removes_it() {
        let lcd = LcdPrinter::new();
        lcd.set_status(LcdStatus::NoConnect);
        assert!(!lcd.is_clear());
        lcd.clear_status(&LcdStatus::NoConnect);
        assert!(lcd.is_clear());
    }

    #[test]
    fn setting_same_kind_twice_replaces_not_duplicates() {
        let lcd = LcdPrinter::new();
        lcd.set_status(LcdStatus::ConnectError("a".to_string()));
        lcd.set_status(LcdStatus::ConnectError("b".to_string()));
        let line = lcd.next_line().unwrap();
        assert_eq!(line, "Connect error: b");
        assert!(lcd.next_line().is_some());
    }
}
