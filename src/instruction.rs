//! Value objects representing one G-code submission to the printer.
//!
//! Grounded on `original_source/prusa/link/serial/instruction.py`:
//! `Instruction`, `MatchableInstruction`, `MandatoryMatchableInstruction`.
//! The "Collecting" variant (begin/end regex capture) generalizes the
//! original's ad-hoc multi-line capture used by the file printer's
//! checkpoint recovery and M27 handling, per spec.md §3.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::Notify;

static NEXT_INSTRUCTION_ID: AtomicU32 = AtomicU32::new(1);

/// What an instruction's captured regex matches, if anything, is required
/// before it may be confirmed.
#[derive(Debug, Default)]
struct Captures {
    matches: Vec<String>,
    collecting_lines: Vec<String>,
    collecting_closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmability {
    /// Always confirmable once an `ok` arrives.
    Always,
    /// Must have captured at least one match of `capture_matching`.
    MandatoryMatch,
    /// Must have seen the end regex fire (collecting instructions).
    MandatoryTerminator,
}

/// One submission to the printer (spec.md §3 "Instruction").
pub struct Instruction {
    id: u32,
    message: String,
    checksummed: bool,
    message_number: Mutex<Option<u32>>,
    capturing_regexes: Vec<Regex>,
    collecting_end_regex: Option<Regex>,
    confirmability: Confirmability,
    captures: Mutex<Captures>,
    sent_at: Mutex<Option<Instant>>,
    confirmed_at: Mutex<Option<Instant>>,
    sent_notify: Notify,
    confirmed_notify: Notify,
    sent: std::sync::atomic::AtomicBool,
    confirmed: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Instruction #{} '{}'", self.id, self.message.trim())
    }
}

impl Instruction {
    fn new_raw(
        message: String,
        checksummed: bool,
        capturing_regexes: Vec<Regex>,
        collecting_end_regex: Option<Regex>,
        confirmability: Confirmability,
    ) -> Arc<Self> {
        assert!(
            !message.contains('\n'),
            "instructions cannot contain newlines"
        );
        Arc::new(Instruction {
            id: NEXT_INSTRUCTION_ID.fetch_add(1, Ordering::Relaxed),
            message,
            checksummed,
            message_number: Mutex::new(None),
            capturing_regexes,
            collecting_end_regex,
            confirmability,
            captures: Mutex::new(Captures::default()),
            sent_at: Mutex::new(None),
            confirmed_at: Mutex::new(None),
            sent_notify: Notify::new(),
            confirmed_notify: Notify::new(),
            sent: std::sync::atomic::AtomicBool::new(false),
            confirmed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// A plain instruction that confirms as soon as `ok` arrives.
    pub fn plain(message: impl Into<String>, checksummed: bool) -> Arc<Self> {
        Self::new_raw(message.into(), checksummed, Vec::new(), None, Confirmability::Always)
    }

    /// Captures matches of `capture` but does not require any.
    pub fn matchable(message: impl Into<String>, checksummed: bool, capture: Regex) -> Arc<Self> {
        Self::new_raw(
            message.into(),
            checksummed,
            vec![capture],
            None,
            Confirmability::Always,
        )
    }

    /// Like [`matchable`](Self::matchable) but refuses confirmation if
    /// nothing matched (`MandatoryMatchableInstruction` in the original).
    pub fn mandatory_matchable(
        message: impl Into<String>,
        checksummed: bool,
        capture: Regex,
    ) -> Arc<Self> {
        Self::new_raw(
            message.into(),
            checksummed,
            vec![capture],
            None,
            Confirmability::MandatoryMatch,
        )
    }

    /// Collects every line between `begin` and `end`, refusing confirmation
    /// until `end` has matched.
    pub fn collecting(
        message: impl Into<String>,
        checksummed: bool,
        begin: Regex,
        end: Regex,
    ) -> Arc<Self> {
        Self::new_raw(
            message.into(),
            checksummed,
            vec![begin],
            Some(end),
            Confirmability::MandatoryTerminator,
        )
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_checksummed(&self) -> bool {
        self.checksummed
    }

    pub fn message_number(&self) -> Option<u32> {
        *self.message_number.lock().unwrap()
    }

    pub fn set_message_number(&self, number: u32) {
        *self.message_number.lock().unwrap() = Some(number);
    }

    pub fn capturing_regexes(&self) -> &[Regex] {
        &self.capturing_regexes
    }

    /// Called by the dispatcher when a registered regex matches a line.
    pub fn output_captured(&self, regex: &Regex, line: &str) {
        let mut captures = self.captures.lock().unwrap();
        if let Some(end) = &self.collecting_end_regex {
            if end.is_match(line) {
                captures.collecting_closed = true;
                return;
            }
            if regex.is_match(line) {
                captures.collecting_lines.push(line.to_string());
            }
        } else if regex.is_match(line) {
            captures.matches.push(line.to_string());
        }
    }

    pub fn matches(&self) -> Vec<String> {
        self.captures.lock().unwrap().matches.clone()
    }

    pub fn collected_lines(&self) -> Vec<String> {
        self.captures.lock().unwrap().collecting_lines.clone()
    }

    /// Marks the instruction sent, recording the timestamp used to compute
    /// `time_to_confirm` later.
    pub fn mark_sent(&self) {
        *self.sent_at.lock().unwrap() = Some(Instant::now());
        self.sent.store(true, Ordering::SeqCst);
        self.sent_notify.notify_waiters();
    }

    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }

    /// Marks sent only if not already, without disturbing an existing
    /// `sent_at` timestamp. Used when force-confirming an instruction that
    /// may never actually have gone out (queue flush, shutdown).
    pub fn mark_sent_if_unset(&self) {
        if !self.is_sent() {
            self.mark_sent();
        }
    }

    /// Resets send state so the instruction can be retransmitted (RX-yeet,
    /// resend recovery).
    pub fn reset_send(&self) {
        *self.sent_at.lock().unwrap() = None;
        self.sent.store(false, Ordering::SeqCst);
    }

    /// Attempts to confirm the instruction. Returns `false` (and leaves the
    /// instruction in-flight) if a mandatory capture/terminator is missing.
    pub fn try_confirm(&self) -> bool {
        let ok = match self.confirmability {
            Confirmability::Always => true,
            Confirmability::MandatoryMatch => !self.captures.lock().unwrap().matches.is_empty(),
            Confirmability::MandatoryTerminator => {
                self.captures.lock().unwrap().collecting_closed
            }
        };
        if !ok {
            return false;
        }
        let sent_at = *self.sent_at.lock().unwrap();
        if let Some(sent_at) = sent_at {
            *self.confirmed_at.lock().unwrap() = Some(Instant::now());
            self.confirmed.store(true, Ordering::SeqCst);
            self.confirmed_notify.notify_waiters();
            let _ = sent_at;
        }
        true
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::SeqCst)
    }

    pub fn time_to_confirm(&self) -> Option<Duration> {
        let sent_at = (*self.sent_at.lock().unwrap())?;
        let confirmed_at = (*self.confirmed_at.lock().unwrap())?;
        confirmed_at.checked_duration_since(sent_at)
    }

    /// Confirms unconditionally, bypassing mandatory capture/terminator
    /// checks. Used when flushing the queue or force-draining on shutdown.
    pub fn force_confirm(&self) {
        if self.sent_at.lock().unwrap().is_none() {
            self.mark_sent();
        }
        *self.confirmed_at.lock().unwrap() = Some(Instant::now());
        self.confirmed.store(true, Ordering::SeqCst);
        self.confirmed_notify.notify_waiters();
    }

    /// Waits for `confirmed_notify`. Registers interest via `enable()`
    /// before re-checking the flag so a confirmation landing between the
    /// check and the await is never missed (`notify_waiters` does not
    /// buffer a permit the way `notify_one` does).
    pub async fn wait_for_confirmation(&self) {
        let notified = self.confirmed_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_confirmed() {
            return;
        }
        notified.await;
    }

    pub async fn wait_for_sent(&self) {
        let notified = self.sent_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_sent() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_confirms_without_capture() {
        let instr = Instruction::plain("M105", false);
        instr.mark_sent();
        assert!(instr.try_confirm());
        assert!(instr.is_confirmed());
    }

    #[test]
    fn mandatory_matchable_refuses_without_capture() {
        let re = Regex::new(r"^ok T:").unwrap();
        let instr = Instruction::mandatory_matchable("M105", false, re);
        instr.mark_sent();
        assert!(!instr.try_confirm());
        assert!(!instr.is_confirmed());
    }

    #[test]
    fn mandatory_matchable_confirms_after_capture() {
        let re = Regex::new(r"^ok T:").unwrap();
        let instr = Instruction::mandatory_matchable("M105", false, re.clone());
        instr.mark_sent();
        instr.output_captured(&re, "ok T:200");
        assert!(instr.try_confirm());
    }

    #[test]
    fn collecting_waits_for_terminator() {
        let begin = Regex::new(r".*").unwrap();
        let end = Regex::new(r"^ok$").unwrap();
        let instr = Instruction::collecting("M503", false, begin.clone(), end);
        instr.mark_sent();
        instr.output_captured(&begin, "echo:  G21");
        assert!(!instr.try_confirm());
        instr.output_captured(&begin, "ok");
        assert!(instr.try_confirm());
        assert_eq!(instr.collected_lines(), vec!["echo:  G21".to_string()]);
    }

    #[test]
    fn reset_send_clears_sent_flag() {
        let instr = Instruction::plain("G28", false);
        instr.mark_sent();
        assert!(instr.is_sent());
        instr.reset_send();
        assert!(!instr.is_sent());
    }
}
