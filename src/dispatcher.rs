//! Priority-ordered regex routing of printer output lines to handlers
//! (spec.md §4.2). Grounded on the teacher's `socket.rs`/`util.rs` regex
//! style (`LazyLock<Regex>` statics, `regex::Regex`) and on
//! `original_source/prusa/link/serial/serial_parser.py`'s
//! `ThreadedSerialParser.add_handler` priority semantics.

use std::sync::Mutex;

use log::warn;
use regex::Regex;

/// A single callback invoked with the matched line and its `regex::Match`.
pub type Handler = Box<dyn Fn(&str, &regex::Captures) + Send + Sync>;

struct Entry {
    regex: Regex,
    priority: f64,
    handlers: Vec<Handler>,
}

/// Priority used for the confirmation ("ok") regex — always evaluated first.
pub const CONFIRMATION_PRIORITY: f64 = f64::INFINITY;

/// Routes each inbound serial line to the highest-priority matching regex's
/// handlers. Adding the same pattern twice raises its priority to the max
/// of the two and unions the handler sets, matching the original's
/// `add_handler` semantics.
pub struct LineDispatcher {
    entries: Mutex<Vec<Entry>>,
}

impl Default for LineDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDispatcher {
    pub fn new() -> Self {
        LineDispatcher {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Registers `handler` for `regex` at `priority`. Descending priority
    /// order determines which handler set runs first when multiple regexes
    /// would match the same line — only the single highest-priority match
    /// fires.
    pub fn add_handler(&self, regex: Regex, priority: f64, handler: Handler) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.iter_mut().find(|e| e.regex.as_str() == regex.as_str()) {
            entry.priority = entry.priority.max(priority);
            entry.handlers.push(handler);
        } else {
            entries.push(Entry {
                regex,
                priority,
                handlers: vec![handler],
            });
        }
        entries.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap());
    }

    /// Removes every handler registered for a pattern matching `regex`'s
    /// source text. Used to tear down an instruction's capture regexes once
    /// it confirms.
    pub fn remove_handlers(&self, regex: &Regex) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|e| e.regex.as_str() != regex.as_str());
    }

    /// Dispatches one inbound line: finds the first (highest-priority)
    /// matching regex and invokes every handler registered for it. Handler
    /// panics are caught and logged so one broken handler cannot take down
    /// the reader loop.
    pub fn dispatch(&self, line: &str) {
        let snapshot: Vec<(Regex, usize)> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .enumerate()
                .map(|(i, e)| (e.regex.clone(), i))
                .collect()
        };
        for (regex, idx) in snapshot {
            if let Some(caps) = regex.captures(line) {
                let entries = self.entries.lock().unwrap();
                let Some(entry) = entries.get(idx) else {
                    continue;
                };
                if entry.regex.as_str() != regex.as_str() {
                    continue;
                }
                for handler in &entry.handlers {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        handler(line, &caps);
                    }));
                    if let Err(e) = result {
                        warn!("line dispatcher handler panicked: {:?}", e);
                    }
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn highest_priority_wins() {
        let dispatcher = LineDispatcher::new();
        let low_hits = Arc::new(AtomicUsize::new(0));
        let high_hits = Arc::new(AtomicUsize::new(0));

        let lo = low_hits.clone();
        dispatcher.add_handler(
            Regex::new(r"^ok").unwrap(),
            1.0,
            Box::new(move |_, _| {
                lo.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let hi = high_hits.clone();
        dispatcher.add_handler(
            Regex::new(r"^ok").unwrap(),
            CONFIRMATION_PRIORITY,
            Box::new(move |_, _| {
                hi.fetch_add(1, Ordering::SeqCst);
            }),
        );

        dispatcher.dispatch("ok");
        assert_eq!(low_hits.load(Ordering::SeqCst), 1);
        assert_eq!(high_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_pattern_unions_handlers() {
        let dispatcher = LineDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let c = calls.clone();
            dispatcher.add_handler(
                Regex::new(r"^Resend:").unwrap(),
                0.0,
                Box::new(move |_, _| {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        dispatcher.dispatch("Resend: 4");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn non_matching_line_invokes_nothing() {
        let dispatcher = LineDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        dispatcher.add_handler(
            Regex::new(r"^ok").unwrap(),
            0.0,
            Box::new(move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        dispatcher.dispatch("echo:busy: processing");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
