//! Layered state model reconstructed from asynchronous serial chatter,
//! with causal attribution of transitions to commands (spec.md §4.5).
//!
//! Grounded on `original_source/prusa/link/printer_adapter/state_manager.py`
//! (`StateManager`, `StateChange`, the `ERROR_REASON_TIMEOUT` waiter task,
//! and the fan-error/`believe_not_printing` guards) and on the teacher's
//! `Mutex`-protected-inner-struct-plus-broadcast-signal shape used in
//! `queue.rs`/`dispatcher.rs` of this crate.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, info, warn};
use tokio::sync::{broadcast, Notify};
use tokio::time::sleep;

use crate::dispatcher::LineDispatcher;
use crate::regexes;
use crate::types::{BaseState, OverrideState, PrintingState, Source, State, ERROR_REASON_TIMEOUT, STATE_HISTORY_SIZE};

/// A planned transition the runner registers before dispatching a command,
/// so the next externally-visible state change can be attributed back to
/// it (spec.md §3 "StateChange reservation").
#[derive(Debug, Clone, Default)]
pub struct StateChange {
    pub command_id: Option<u32>,
    pub from_source: HashMap<State, Source>,
    pub to_source: HashMap<State, Source>,
    pub default_source: Option<Source>,
    pub reason: Option<String>,
    pub ready: bool,
}

impl StateChange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command_id(mut self, id: u32) -> Self {
        self.command_id = Some(id);
        self
    }

    pub fn to(mut self, state: State, source: Source) -> Self {
        self.to_source.insert(state, source);
        self
    }

    pub fn from(mut self, state: State, source: Source) -> Self {
        self.from_source.insert(state, source);
        self
    }

    pub fn default_source(mut self, source: Source) -> Self {
        self.default_source = Some(source);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Picks the attributed source for a `from -> to` transition: prefer the
    /// source registered against `from` (good for leaving ATTENTION/ERROR),
    /// then the one registered against `to`, then the default.
    fn resolve(&self, from: State, to: State) -> Option<Source> {
        self.from_source
            .get(&from)
            .or_else(|| self.to_source.get(&to))
            .copied()
            .or(self.default_source)
    }
}

/// One observed external state transition, broadcast to every observer
/// exactly once, in order (spec.md §5 "Ordering guarantees").
#[derive(Debug, Clone)]
pub struct StateChangedEvent {
    pub from: State,
    pub to: State,
    pub command_id: Option<u32>,
    pub source: Option<Source>,
    pub reason: Option<String>,
    pub ready: bool,
}

struct Inner {
    base: BaseState,
    printing: Option<PrintingState>,
    overlay: Option<OverrideState>,
    history: VecDeque<(State, State, Instant)>,
    last_external: State,
    error_count: u32,
    fan_error_pending: Option<String>,
    awaiting_error_reason: bool,
    resuming_from_fan_error: bool,
    believe_not_printing: bool,
    unsure_whether_printing: bool,
    reservation: Option<StateChange>,
    started_at: Option<Instant>,
}

impl Inner {
    fn external(&self) -> State {
        if let Some(o) = self.overlay {
            return match o {
                OverrideState::Attention => State::Attention,
                OverrideState::Error => State::Error,
            };
        }
        if let Some(p) = self.printing {
            return match p {
                PrintingState::Printing => State::Printing,
                PrintingState::Paused => State::Paused,
                PrintingState::Finished => State::Finished,
                PrintingState::Stopped => State::Stopped,
            };
        }
        match self.base {
            BaseState::Busy => State::Busy,
            BaseState::Idle => State::Idle,
            BaseState::Ready => State::Ready,
        }
    }
}

/// Owns the single externally-visible printer state (spec.md §3
/// "Ownership": all other components only read it).
pub struct StateManager {
    inner: Mutex<Inner>,
    changed_tx: broadcast::Sender<StateChangedEvent>,
    error_reason_notify: Notify,
}

impl StateManager {
    pub fn new() -> Arc<Self> {
        let (changed_tx, _) = broadcast::channel(64);
        Arc::new(StateManager {
            inner: Mutex::new(Inner {
                base: BaseState::Idle,
                printing: None,
                overlay: None,
                history: VecDeque::with_capacity(STATE_HISTORY_SIZE),
                last_external: State::Idle,
                error_count: 0,
                fan_error_pending: None,
                awaiting_error_reason: false,
                resuming_from_fan_error: false,
                believe_not_printing: false,
                unsure_whether_printing: true,
                reservation: None,
                started_at: None,
            }),
            changed_tx,
            error_reason_notify: Notify::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChangedEvent> {
        self.changed_tx.subscribe()
    }

    pub fn current(&self) -> State {
        self.inner.lock().unwrap().external()
    }

    /// Registers the runner's expectation for the next state change. At
    /// most one reservation is held at a time; overriding an existing one
    /// logs (spec.md §4.5 "Attribution").
    pub fn expect_change(&self, change: StateChange) {
        let mut inner = self.inner.lock().unwrap();
        if inner.reservation.is_some() {
            warn!("overriding an already-pending state-change reservation");
        }
        inner.reservation = Some(change);
    }

    pub fn stop_expecting_change(&self) {
        self.inner.lock().unwrap().reservation = None;
    }

    fn state_may_have_changed(&self, inner: &mut Inner) {
        let to = inner.external();
        let from = inner.last_external;
        if from == to {
            return;
        }
        let reservation = inner.reservation.take();
        let (command_id, source, reason, ready) = match &reservation {
            // Only attach the reservation's details if this transition is
            // actually the one it describes (matches `is_expected()` in the
            // original); an unrelated transition still consumes the slot
            // (at most one reservation outstanding) but gets no attribution.
            Some(r) if r.from_source.contains_key(&from) || r.to_source.contains_key(&to) || r.default_source.is_some() => {
                (r.command_id, r.resolve(from, to), r.reason.clone(), r.ready)
            }
            _ => (None, None, None, false),
        };
        if inner.history.len() == STATE_HISTORY_SIZE {
            inner.history.pop_front();
        }
        inner.history.push_back((from, to, Instant::now()));
        inner.last_external = to;
        info!("state {:?} -> {:?} (source={:?}, command={:?})", from, to, source, command_id);
        let _ = self.changed_tx.send(StateChangedEvent {
            from,
            to,
            command_id,
            source,
            reason,
            ready,
        });
    }

    // --- Event entry points (spec.md §4.5 "State transition rules") ---

    pub fn busy(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.base == BaseState::Idle {
            inner.base = BaseState::Busy;
        }
        self.state_may_have_changed(&mut inner);
    }

    pub fn not_printing(&self) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.printing, Some(PrintingState::Printing) | Some(PrintingState::Paused)) {
            inner.printing = None;
        }
        self.state_may_have_changed(&mut inner);
    }

    pub fn printing(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.printing.is_none() || inner.printing == Some(PrintingState::Paused) {
            inner.printing = Some(PrintingState::Printing);
            inner.unsure_whether_printing = false;
        }
        self.state_may_have_changed(&mut inner);
    }

    pub fn finished(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.printing == Some(PrintingState::Printing) {
            inner.printing = Some(PrintingState::Finished);
        }
        self.state_may_have_changed(&mut inner);
    }

    pub fn stopped(&self) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.printing, Some(PrintingState::Printing) | Some(PrintingState::Paused)) {
            inner.printing = Some(PrintingState::Stopped);
        }
        self.state_may_have_changed(&mut inner);
    }

    pub fn paused(&self) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.printing, Some(PrintingState::Printing) | None) {
            inner.printing = Some(PrintingState::Paused);
        }
        if inner.fan_error_pending.is_some() && inner.overlay != Some(OverrideState::Error) {
            inner.overlay = Some(OverrideState::Attention);
        }
        self.state_may_have_changed(&mut inner);
    }

    pub fn resumed(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.printing == Some(PrintingState::Paused) {
            inner.printing = Some(PrintingState::Printing);
        }
        if inner.resuming_from_fan_error {
            inner.resuming_from_fan_error = false;
            if inner.overlay == Some(OverrideState::Attention) {
                inner.overlay = None;
            }
        }
        self.state_may_have_changed(&mut inner);
    }

    pub fn attention(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !matches!(inner.printing, Some(PrintingState::Finished) | Some(PrintingState::Stopped)) {
            inner.overlay = Some(OverrideState::Attention);
        }
        self.state_may_have_changed(&mut inner);
    }

    pub fn error(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.overlay = Some(OverrideState::Error);
        self.state_may_have_changed(&mut inner);
    }

    pub fn error_resolved(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.error_count == 0 && inner.overlay == Some(OverrideState::Error) {
            inner.overlay = None;
        }
        self.state_may_have_changed(&mut inner);
    }

    /// An independent `Condition` observer (SN, firmware, printer type,
    /// RPi, ...) reported bad/good; the aggregate count decides ERROR.
    pub fn condition_changed(&self, ok: bool) {
        let mut inner = self.inner.lock().unwrap();
        if ok {
            inner.error_count = inner.error_count.saturating_sub(1);
        } else {
            inner.error_count += 1;
        }
        if inner.error_count > 0 {
            inner.overlay = Some(OverrideState::Error);
        } else if inner.overlay == Some(OverrideState::Error) {
            inner.overlay = None;
        }
        self.state_may_have_changed(&mut inner);
    }

    pub fn instruction_confirmed(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.base == BaseState::Busy {
            inner.base = BaseState::Idle;
        }
        self.state_may_have_changed(&mut inner);
    }

    /// FINISHED/STOPPED only last one tick; the printer acking readiness
    /// clears them with `ready=true` attribution (spec.md's
    /// `printer_ready` row).
    pub fn printer_ready(&self) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.printing, Some(PrintingState::Finished) | Some(PrintingState::Stopped)) {
            inner.printing = None;
            if let Some(r) = inner.reservation.as_mut() {
                r.ready = true;
            } else {
                inner.reservation = Some(StateChange::new());
                inner.reservation.as_mut().unwrap().ready = true;
            }
        }
        self.state_may_have_changed(&mut inner);
    }

    /// Start-print observed with the false-start filter armed (spec.md
    /// §4.5 "False-start filter" / §9 `believe_not_printing`).
    pub fn start_print_observed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.believe_not_printing = false;
        inner.started_at = Some(Instant::now());
        drop(inner);
        self.printing();
    }

    /// Cancel observed from the printer. The first cancel seen shortly
    /// after a start is tolerated once; a second is respected.
    pub fn cancel_observed(&self) {
        let should_ignore = {
            let mut inner = self.inner.lock().unwrap();
            let recently_started = inner
                .started_at
                .map(|t| t.elapsed() < std::time::Duration::from_secs(2))
                .unwrap_or(false);
            if recently_started && !inner.believe_not_printing {
                inner.believe_not_printing = true;
                true
            } else {
                false
            }
        };
        if should_ignore {
            debug!("tolerating a single spurious cancel right after print start");
            return;
        }
        self.not_printing();
    }

    // --- Fan error sub-state (spec.md §4.5 "Fan error sub-state") ---

    fn fan_error_observed(&self, fan_name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fan_error_pending = Some(fan_name.to_string());
        if !matches!(inner.printing, Some(PrintingState::Printing)) && inner.overlay != Some(OverrideState::Error) {
            inner.overlay = Some(OverrideState::Attention);
        }
        self.state_may_have_changed(&mut inner);
    }

    fn fan_rpm_observed(&self, running_above_commanded: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.fan_error_pending.is_some() && running_above_commanded {
            inner.fan_error_pending = None;
            if inner.printing == Some(PrintingState::Paused) {
                inner.resuming_from_fan_error = true;
            } else if inner.overlay == Some(OverrideState::Attention) {
                inner.overlay = None;
            }
        }
        self.state_may_have_changed(&mut inner);
    }

    // --- Error reason protocol (spec.md §4.5) ---

    /// A bare `Error:` line arrived with no explanation attached yet.
    /// Mirrors `error_handler`/`error_reason_waiter` in the original: the
    /// override transition to ERROR does *not* fire here — only once the
    /// reason is known (`error_reason_observed`) or the waiter times out
    /// does the reservation get filled in and `error()` actually called,
    /// so the reason always lands on the same `StateChangedEvent` as the
    /// transition instead of racing it.
    fn begin_generic_error(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.overlay == Some(OverrideState::Error) {
                return;
            }
            inner.awaiting_error_reason = true;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.wait_for_error_reason().await;
        });
    }

    /// Races the timeout against `error_reason_observed`'s notification.
    /// If the reason arrives first, `error_reason_observed` has already
    /// filled the reservation and fired the transition, so this task has
    /// nothing left to do. If the timeout elapses first, it fills in the
    /// 404 fallback reason itself and fires the transition.
    async fn wait_for_error_reason(self: Arc<Self>) {
        tokio::select! {
            _ = sleep(ERROR_REASON_TIMEOUT) => {
                let mut inner = self.inner.lock().unwrap();
                if inner.awaiting_error_reason {
                    inner.awaiting_error_reason = false;
                    inner.reservation = Some(
                        StateChange::new()
                            .to(State::Error, Source::Marlin)
                            .reason("404 Reason not found"),
                    );
                    drop(inner);
                    warn!("no error reason arrived before timeout, falling back to 404");
                    self.error();
                }
            }
            _ = self.error_reason_notify.notified() => {}
        }
    }

    /// A specific `ERROR_REASON`/`ATTENTION_REASON` (GENERIC_ERROR branch
    /// only) line arrived while a reason was awaited. Fills the
    /// reservation with the real reason *before* firing the transition,
    /// so `state_may_have_changed`'s attribution gate sees a `to_source`
    /// match and the reason survives onto the `StateChangedEvent`.
    fn error_reason_observed(&self, reason: String) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.awaiting_error_reason {
            return;
        }
        inner.awaiting_error_reason = false;
        inner.reservation = Some(StateChange::new().to(State::Error, Source::Marlin).reason(reason));
        drop(inner);
        self.error_reason_notify.notify_one();
        self.error();
    }

    /// `ATTENTION_REASON` lines that aren't tied to a pending generic
    /// error (bed-leveling sensor failures) attribute straight to the
    /// ATTENTION transition they precede, independent of the
    /// `awaiting_error_reason` gate used by the ERROR path above.
    fn attention_reason_observed(&self, reason: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.reservation = Some(StateChange::new().to(State::Attention, Source::Marlin).reason(reason));
        drop(inner);
        self.attention();
    }

    /// Registers every regex handler on `dispatcher` (spec.md §4.5 lists
    /// busy/attention/paused/resumed/cancel/start-print/print-done/generic
    /// error/error-reason/attention-reason/fan-error as the manager's
    /// inputs).
    pub fn install_handlers(self: &Arc<Self>, dispatcher: &LineDispatcher) {
        let m = self.clone();
        dispatcher.add_handler(regexes::BUSY.clone(), 1.0, Box::new(move |_, _| m.busy()));

        let m = self.clone();
        dispatcher.add_handler(
            regexes::PAUSED.clone(),
            1.0,
            Box::new(move |_, _| m.paused()),
        );
        let m = self.clone();
        dispatcher.add_handler(
            regexes::RESUMED.clone(),
            1.0,
            Box::new(move |_, _| m.resumed()),
        );
        let m = self.clone();
        dispatcher.add_handler(
            regexes::CANCEL.clone(),
            1.0,
            Box::new(move |_, _| m.cancel_observed()),
        );
        let m = self.clone();
        dispatcher.add_handler(
            regexes::START_PRINT.clone(),
            1.0,
            Box::new(move |_, _| m.start_print_observed()),
        );
        let m = self.clone();
        dispatcher.add_handler(
            regexes::PRINT_DONE.clone(),
            1.0,
            Box::new(move |_, _| m.finished()),
        );
        let m = self.clone();
        dispatcher.add_handler(
            regexes::FAN_ERROR.clone(),
            2.0,
            Box::new(move |_, caps| {
                let name = caps.name("fan_name").map(|m| m.as_str()).unwrap_or("fan");
                m.fan_error_observed(name);
            }),
        );
        let m = self.clone();
        dispatcher.add_handler(
            regexes::FAN.clone(),
            0.5,
            Box::new(move |_, caps| {
                let rpm: u32 = caps.name("print_rpm").and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
                let power: u32 = caps.name("print_power").and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
                m.fan_rpm_observed(power > 0 && rpm > 0);
            }),
        );
        let m = self.clone();
        dispatcher.add_handler(
            regexes::ATTENTION_REASON.clone(),
            2.0,
            Box::new(move |_, caps| {
                let reason = if caps.name("not_triggered").is_some() {
                    "Bed leveling sensor didn't trigger"
                } else {
                    "Bed leveling sensor triggered too high"
                };
                m.attention_reason_observed(reason.to_string());
            }),
        );
        let m = self.clone();
        dispatcher.add_handler(
            regexes::ERROR_REASON.clone(),
            2.0,
            Box::new(move |_, caps| {
                let reason = describe_error_reason(caps);
                m.error_reason_observed(reason);
            }),
        );
        let m = self.clone();
        dispatcher.add_handler(
            regexes::GENERIC_ERROR.clone(),
            1.0,
            Box::new(move |_, _| m.begin_generic_error()),
        );
    }
}

/// Composes the error-reason regex's capture groups into a human-readable
/// reason string, per spec.md §4.5.
fn describe_error_reason(caps: &regex::Captures) -> String {
    if caps.name("runaway").is_some() {
        return "Thermal runaway".to_string();
    }
    if caps.name("malfunction").is_some() {
        return "Heater/sensor malfunction".to_string();
    }
    let component = caps.name("component").map(|m| m.as_str()).unwrap_or("heater");
    if caps.name("mintemp").is_some() {
        return format!("MINTEMP error on {}", component);
    }
    if caps.name("maxtemp").is_some() {
        return format!("MAXTEMP error on {}", component);
    }
    "404 Reason not found".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_idle() {
        let manager = StateManager::new();
        assert_eq!(manager.current(), State::Idle);
    }

    #[test]
    fn busy_then_confirmed_returns_to_idle() {
        let manager = StateManager::new();
        manager.busy();
        assert_eq!(manager.current(), State::Busy);
        manager.instruction_confirmed();
        assert_eq!(manager.current(), State::Idle);
    }

    #[test]
    fn printing_lifecycle() {
        let manager = StateManager::new();
        manager.printing();
        assert_eq!(manager.current(), State::Printing);
        manager.paused();
        assert_eq!(manager.current(), State::Paused);
        manager.resumed();
        assert_eq!(manager.current(), State::Printing);
        manager.finished();
        assert_eq!(manager.current(), State::Finished);
    }

    #[test]
    fn attribution_prefers_from_source() {
        let manager = StateManager::new();
        manager.error();
        manager.expect_change(
            StateChange::new()
                .with_command_id(42)
                .from(State::Error, Source::Connect)
                .to(State::Idle, Source::Http),
        );
        let mut rx = manager.subscribe();
        manager.error_resolved();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.from, State::Error);
        assert_eq!(event.to, State::Idle);
        assert_eq!(event.source, Some(Source::Connect));
        assert_eq!(event.command_id, Some(42));
    }

    #[test]
    fn unrelated_transition_is_not_tagged_with_pending_reservation() {
        let manager = StateManager::new();
        manager.expect_change(
            StateChange::new()
                .with_command_id(7)
                .to(State::Printing, Source::Connect),
        );
        let mut rx = manager.subscribe();
        // An unrelated transition (Idle -> Busy) happens before the one the
        // reservation describes; it must not inherit the pending command id.
        manager.busy();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.to, State::Busy);
        assert_eq!(event.command_id, None);
        assert_eq!(event.source, None);
    }

    #[test]
    fn false_start_filter_tolerates_one_cancel() {
        let manager = StateManager::new();
        manager.start_print_observed();
        assert_eq!(manager.current(), State::Printing);
        manager.cancel_observed();
        assert_eq!(manager.current(), State::Printing, "first spurious cancel should be ignored");
    }

    #[test]
    fn fan_error_forces_attention_then_clears() {
        let manager = StateManager::new();
        manager.fan_error_observed("Print");
        assert_eq!(manager.current(), State::Attention);
        manager.fan_rpm_observed(true);
        assert_eq!(manager.current(), State::Idle);
    }

    #[tokio::test]
    async fn generic_error_then_reason_fires_once_with_reason_attached() {
        let manager = StateManager::new();
        let mut rx = manager.subscribe();

        manager.begin_generic_error();
        // No transition until the reason is known or the waiter times out.
        assert_eq!(manager.current(), State::Idle);
        assert!(rx.try_recv().is_err());

        manager.error_reason_observed("Thermal runaway".to_string());

        assert_eq!(manager.current(), State::Error);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.from, State::Idle);
        assert_eq!(event.to, State::Error);
        assert_eq!(event.source, Some(Source::Marlin));
        assert_eq!(event.reason.as_deref(), Some("Thermal runaway"));
    }

    #[tokio::test]
    async fn generic_error_is_a_no_op_once_already_in_error() {
        let manager = StateManager::new();
        manager.begin_generic_error();
        manager.error_reason_observed("Thermal runaway".to_string());
        assert_eq!(manager.current(), State::Error);

        // A further Error: line shouldn't reopen the awaiting-reason window.
        manager.begin_generic_error();
        assert_eq!(manager.current(), State::Error);
        manager.error_reason_observed("Heater/sensor malfunction".to_string());
        assert_eq!(manager.current(), State::Error, "already in error, second reason is a no-op");
    }

    #[test]
    fn condition_error_count_gates_error_override() {
        let manager = StateManager::new();
        manager.condition_changed(false);
        assert_eq!(manager.current(), State::Error);
        manager.condition_changed(false);
        assert_eq!(manager.current(), State::Error);
        manager.condition_changed(true);
        assert_eq!(manager.current(), State::Error);
        manager.condition_changed(true);
        assert_eq!(manager.current(), State::Idle);
    }
}
