//! Checksummed G-code submission with numbering, resend handling,
//! RX-buffer-loss recovery, priority scheduling, stall detection, and
//! message-number reset (spec.md §4.3 "Serial queue").
//!
//! Grounded on `original_source/prusa/link/serial/serial_queue.py`
//! (`SerialQueue`/`MonitoredSerialQueue`): `peek_next`/`_next_instruction`
//! priority order, `_send`'s M110 workaround and checksum assembly,
//! `_resend`'s history replay, `_rx_got_yeeted`, and the stall watchdog's
//! `stuck_counter > 2` boundary.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{LineDispatcher, CONFIRMATION_PRIORITY};
use crate::instruction::Instruction;
use crate::planner_fed::IsPlannerFed;
use crate::regexes;
use crate::transport::SerialTransport;
use crate::types::{HISTORY_LENGTH, MAX_MESSAGE_NUMBER, RX_SIZE, SERIAL_QUEUE_MONITOR_INTERVAL, SERIAL_QUEUE_TIMEOUT};

/// One entry of the bounded send history, kept so a resend request can be
/// replayed byte for byte.
struct HistoryEntry {
    number: u32,
    instruction: Arc<Instruction>,
    wire: Vec<u8>,
}

struct QueueState {
    ordinary: VecDeque<Arc<Instruction>>,
    priority: VecDeque<Arc<Instruction>>,
    current: Option<Arc<Instruction>>,
    recovery: Vec<Arc<Instruction>>,
    rx_yeet: Option<Arc<Instruction>>,
    m110_workaround: Option<Arc<Instruction>>,
    worked_around_m110: bool,
    send_history: VecDeque<HistoryEntry>,
    message_number: u32,
    closed: bool,
    blocked: bool,
    stuck_counter: u8,
    last_event_on: Instant,
}

impl QueueState {
    fn is_empty(&self) -> bool {
        self.ordinary.is_empty()
            && self.priority.is_empty()
            && self.recovery.is_empty()
            && self.rx_yeet.is_none()
            && self.m110_workaround.is_none()
    }

    fn can_write(&self) -> bool {
        self.current.is_none() && !self.is_empty() && !self.closed
    }
}

/// Single logical producer of serial bytes (spec.md §4.3).
pub struct SerialQueue {
    state: Mutex<QueueState>,
    transport: Arc<SerialTransport>,
    dispatcher: Arc<LineDispatcher>,
    planner_fed: Arc<IsPlannerFed>,
    send_event: Notify,
    has_failed: AtomicBool,
    failed_tx: broadcast::Sender<()>,
    message_number_tx: broadcast::Sender<u32>,
    instruction_confirmed_tx: broadcast::Sender<()>,
    cancel: CancellationToken,
}

impl SerialQueue {
    pub fn new(
        transport: Arc<SerialTransport>,
        dispatcher: Arc<LineDispatcher>,
        planner_fed: Arc<IsPlannerFed>,
    ) -> Arc<Self> {
        let (failed_tx, _) = broadcast::channel(16);
        let (message_number_tx, _) = broadcast::channel(16);
        let (instruction_confirmed_tx, _) = broadcast::channel(64);
        let queue = Arc::new(SerialQueue {
            state: Mutex::new(QueueState {
                ordinary: VecDeque::new(),
                priority: VecDeque::new(),
                current: None,
                recovery: Vec::new(),
                rx_yeet: None,
                m110_workaround: None,
                worked_around_m110: false,
                send_history: VecDeque::with_capacity(HISTORY_LENGTH),
                message_number: 0,
                closed: false,
                blocked: false,
                stuck_counter: 0,
                last_event_on: Instant::now(),
            }),
            transport,
            dispatcher,
            planner_fed,
            send_event: Notify::new(),
            has_failed: AtomicBool::new(false),
            failed_tx,
            message_number_tx,
            instruction_confirmed_tx,
            cancel: CancellationToken::new(),
        });
        queue.install_handlers();
        queue
    }

    pub fn subscribe_failed(&self) -> broadcast::Receiver<()> {
        self.failed_tx.subscribe()
    }

    pub fn subscribe_instruction_confirmed(&self) -> broadcast::Receiver<()> {
        self.instruction_confirmed_tx.subscribe()
    }

    pub fn has_failed(&self) -> bool {
        self.has_failed.load(Ordering::SeqCst)
    }

    /// The highest message number assigned so far, used by the file
    /// printer's power-panic checkpoint (spec.md §4.10).
    pub fn last_confirmed_message_number(&self) -> u32 {
        self.state.lock().unwrap().message_number
    }

    fn install_handlers(self: &Arc<Self>) {
        let confirm_q = self.clone();
        self.dispatcher.add_handler(
            regexes::CONFIRMATION.clone(),
            CONFIRMATION_PRIORITY,
            Box::new(move |_, _| confirm_q.on_confirmation()),
        );
        let resend_q = self.clone();
        self.dispatcher.add_handler(
            regexes::RESEND.clone(),
            0.0,
            Box::new(move |_, caps| {
                if let Some(m) = caps.name("cmd_number") {
                    if let Ok(number) = m.as_str().parse::<u32>() {
                        resend_q.on_resend(number);
                    }
                }
            }),
        );
        for re in [&*regexes::BUSY, &*regexes::ATTENTION] {
            let renew_q = self.clone();
            self.dispatcher
                .add_handler(re.clone(), 0.0, Box::new(move |_, _| renew_q.renew_timeout(true)));
        }
    }

    /// Enqueues one instruction. `to_front` routes it to the priority
    /// deque so commands jump ahead of background polling.
    pub fn enqueue_one(self: &Arc<Self>, instruction: Arc<Instruction>, to_front: bool) {
        {
            let mut state = self.state.lock().unwrap();
            if to_front {
                state.priority.push_front(instruction);
            } else {
                state.ordinary.push_front(instruction);
            }
        }
        self.nudge();
    }

    fn nudge(&self) {
        self.send_event.notify_one();
    }

    pub fn block_sending(&self) {
        self.state.lock().unwrap().blocked = true;
    }

    pub fn unblock_sending(&self) {
        let should_nudge = {
            let mut state = self.state.lock().unwrap();
            if state.blocked {
                state.blocked = false;
                true
            } else {
                false
            }
        };
        if should_nudge {
            self.nudge();
        }
    }

    /// Removes every checksummed (print-origin) instruction from the
    /// queues and force-confirms the in-flight one without sending
    /// further data. Used on stop-print.
    pub fn flush_print_queue(&self) {
        let mut state = self.state.lock().unwrap();
        state.priority.retain(|i| !i.is_checksummed());
        state.ordinary.retain(|i| !i.is_checksummed());
        state.recovery.clear();
        if let Some(current) = state.current.take() {
            current.try_confirm_forced();
        }
    }

    /// Runs the dedicated sender task: waits to be nudged, then sends the
    /// highest priority pending instruction.
    pub async fn run_sender(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.send_event.notified() => {}
            }
            loop {
                let prepared = {
                    let mut state = self.state.lock().unwrap();
                    if state.blocked || !state.can_write() {
                        None
                    } else {
                        self.prepare_next(&mut state)
                    }
                };
                let Some((instruction, wire)) = prepared else {
                    break;
                };
                if let Err(e) = self.transport.write(&wire).await {
                    debug!("serial write failed, waiting for reconnect: {}", e);
                    break;
                }
                let _ = instruction;
                // Another instruction may already be ready (e.g. the
                // M110 workaround primer); loop without waiting again.
                let more = {
                    let state = self.state.lock().unwrap();
                    state.can_write()
                };
                if !more {
                    break;
                }
            }
        }
    }

    /// Pops the next instruction per priority order, assembles its wire
    /// bytes, registers capture handlers, and marks it sent. Returns the
    /// wire bytes to write, or `None` if nothing is ready.
    fn prepare_next(self: &Arc<Self>, state: &mut QueueState) -> Option<(Arc<Instruction>, Vec<u8>)> {
        // M110 workaround: prepend a synthetic M400 before every M110.
        if let Some(peek) = self.peek_next(state) {
            if regexes::M110_ARG.is_match(peek.message())
                && state.m110_workaround.is_none()
                && !state.worked_around_m110
            {
                state.m110_workaround = Some(Instruction::plain("M400", false));
                state.worked_around_m110 = true;
            }
        }

        let instruction = self.pop_next(state)?;

        let m110_match = regexes::M110_ARG.captures(instruction.message());
        if m110_match.is_some() {
            state.worked_around_m110 = false;
        }

        let wire = if instruction.is_checksummed() {
            state.message_number += 1;
            if state.message_number >= MAX_MESSAGE_NUMBER {
                let reset = Instruction::plain("M110 N0", false);
                state.priority.push_back(reset);
            }
            let number = state.message_number;
            instruction.set_message_number(number);
            let wire = build_checksummed_wire(number, instruction.message());
            if state.send_history.len() == HISTORY_LENGTH {
                state.send_history.pop_front();
            }
            state.send_history.push_back(HistoryEntry {
                number,
                instruction: instruction.clone(),
                wire: wire.clone(),
            });
            wire
        } else {
            let mut wire = instruction.message().as_bytes().to_vec();
            wire.push(b'\n');
            wire
        };

        if wire.len() > RX_SIZE {
            warn!(
                "outbound line for '{}' is {}B, exceeds the {}B RX buffer",
                instruction.message(),
                wire.len(),
                RX_SIZE
            );
        }

        if let Some(number) = m110_match.and_then(|c| c.name("number")) {
            if let Ok(n) = number.as_str().parse::<u32>() {
                state.message_number = n;
            } else {
                state.message_number = 0;
            }
            state.send_history.clear();
            let _ = self.message_number_tx.send(state.message_number);
        } else if m110_match.is_some() {
            state.message_number = 0;
            state.send_history.clear();
            let _ = self.message_number_tx.send(0);
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        for regex in instruction.capturing_regexes() {
            let captured = instruction.clone();
            let re = regex.clone();
            self.dispatcher.add_handler(
                regex.clone(),
                now,
                Box::new(move |line, _| captured.output_captured(&re, line)),
            );
        }

        instruction.mark_sent();
        state.current = Some(instruction.clone());
        state.last_event_on = Instant::now();

        Some((instruction, wire))
    }

    fn peek_next(&self, state: &QueueState) -> Option<Arc<Instruction>> {
        if let Some(i) = &state.m110_workaround {
            return Some(i.clone());
        }
        if let Some(i) = &state.rx_yeet {
            return Some(i.clone());
        }
        if let Some(i) = state.recovery.last() {
            return Some(i.clone());
        }
        if let Some(front) = state.priority.back() {
            if self.planner_fed.is_fed() && !state.ordinary.is_empty() {
                return state.ordinary.back().cloned();
            }
            return Some(front.clone());
        }
        state.ordinary.back().cloned()
    }

    fn pop_next(&self, state: &mut QueueState) -> Option<Arc<Instruction>> {
        if state.m110_workaround.is_some() {
            return state.m110_workaround.take();
        }
        if state.rx_yeet.is_some() {
            return state.rx_yeet.take();
        }
        if let Some(i) = state.recovery.pop() {
            return Some(i);
        }
        if !state.priority.is_empty() {
            if self.planner_fed.is_fed() && !state.ordinary.is_empty() {
                self.planner_fed.invalidate();
                debug!("allowing a non-priority instruction through");
                return state.ordinary.pop_back();
            }
            return state.priority.pop_back();
        }
        state.ordinary.pop_back()
    }

    fn on_confirmation(self: &Arc<Self>) {
        self.renew_timeout(true);
        let current = {
            let state = self.state.lock().unwrap();
            state.current.clone()
        };
        let Some(current) = current else {
            warn!("unexpected confirmation line, no instruction in flight");
            return;
        };
        if !current.is_sent() {
            warn!("unexpected confirmation: current instruction was never sent");
            return;
        }
        if !current.try_confirm() {
            debug!("{:?} refused confirmation", current);
            self.nudge();
            return;
        }
        for regex in current.capturing_regexes() {
            self.dispatcher.remove_handlers(regex);
        }
        if current.is_checksummed() {
            if let Some(latency) = current.time_to_confirm() {
                self.planner_fed.process_value(latency);
            }
        }
        {
            let mut state = self.state.lock().unwrap();
            state.current = None;
        }
        let _ = self.instruction_confirmed_tx.send(());
        self.nudge();
    }

    fn on_resend(self: &Arc<Self>, number: u32) {
        let current_number = self.state.lock().unwrap().message_number;
        info!("resend of {} requested, current is {}", number, current_number);
        if current_number < number {
            warn!("resend requested for a message never sent, escalating");
            self.worst_case();
            return;
        }
        let current_unchecksummed = {
            let state = self.state.lock().unwrap();
            state
                .current
                .as_ref()
                .map(|i| !i.is_checksummed())
                .unwrap_or(true)
        };
        if current_unchecksummed {
            warn!("resend requested for a non-numbered message, assuming RX yeet");
            self.rx_yeet(None);
        }
        let count = current_number - number + 1;
        self.replay_from_history(count);
    }

    fn replay_from_history(&self, count: u32) {
        let mut state = self.state.lock().unwrap();
        let count = count as usize;
        if count == 0 || count > state.send_history.len() {
            warn!("impossible resend request, aborting");
            drop(state);
            self.worst_case();
            return;
        }
        state.recovery.clear();
        // Newest first; recovery_list.pop() later yields oldest first.
        let newest_first: Vec<&HistoryEntry> = state.send_history.iter().rev().take(count).collect();
        for entry in newest_first {
            entry.instruction.reset_send();
            state.recovery.push(entry.instruction.clone());
        }
    }

    /// Moves the in-flight instruction into the RX-yeet slot for resend;
    /// after three consecutive stalls, closes the transport.
    fn rx_yeet(self: &Arc<Self>, from_stall: Option<()>) {
        let mut state = self.state.lock().unwrap();
        if let Some(current) = state.current.take() {
            for regex in current.capturing_regexes() {
                self.dispatcher.remove_handlers(regex);
            }
            current.reset_send();
            state.rx_yeet = Some(current);
        }
        let _ = from_stall;
        drop(state);
        self.nudge();
    }

    fn worst_case(self: &Arc<Self>) {
        self.has_failed.store(true, Ordering::SeqCst);
        warn!("serial communication failed irrecoverably");
        let _ = self.failed_tx.send(());
    }

    fn renew_timeout(&self, unstuck: bool) {
        let mut state = self.state.lock().unwrap();
        state.last_event_on = Instant::now();
        if unstuck {
            state.stuck_counter = 0;
        }
    }

    fn current_delay(&self, state: &QueueState) -> Duration {
        if state.is_empty() && state.current.is_none() {
            return Duration::ZERO;
        }
        Instant::now().saturating_duration_since(state.last_event_on)
    }

    /// Watchdog task: every [`SERIAL_QUEUE_MONITOR_INTERVAL`], checks
    /// whether the in-flight instruction has stalled past
    /// [`SERIAL_QUEUE_TIMEOUT`]. Busy/attention lines renew the timeout.
    pub async fn run_stall_watchdog(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SERIAL_QUEUE_MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let (delay, stuck_counter) = {
                let state = self.state.lock().unwrap();
                (self.current_delay(&state), state.stuck_counter)
            };
            if delay > SERIAL_QUEUE_TIMEOUT {
                info!("instruction stalled for {:?}, assuming RX yeet", delay);
                let new_count = stuck_counter + 1;
                {
                    let mut state = self.state.lock().unwrap();
                    state.stuck_counter = new_count;
                }
                if new_count > 2 {
                    warn!("closing serial transport after {} stalls", new_count);
                    self.transport.shutdown();
                }
                self.rx_yeet(Some(()));
                self.renew_timeout(false);
            }
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.send_event.notify_waiters();
    }
}

impl Instruction {
    /// Force-confirms, bypassing mandatory capture/terminator checks.
    /// Used by shutdown and `flush_print_queue`.
    pub fn try_confirm_forced(&self) {
        self.mark_sent_if_unset();
        self.force_confirm();
    }
}

/// Builds the checksummed wire line: `N<num> <gcode> *<xor>\n`, where the
/// checksum is the XOR of the bytes of `N<num> <gcode> ` (including the
/// trailing space).
pub fn build_checksummed_wire(number: u32, message: &str) -> Vec<u8> {
    let prefix = format!("N{} {} ", number, message);
    let checksum = prefix.as_bytes().iter().fold(0u8, |acc, &b| acc ^ b);
    let mut wire = prefix.into_bytes();
    wire.extend_from_slice(format!("*{}\n", checksum).as_bytes());
    wire
}

/// Parses a previously-built checksummed wire line back into
/// `(message, number)`, used by round-trip tests.
pub fn parse_checksummed_wire(line: &str) -> Option<(String, u32)> {
    let line = line.trim_end_matches('\n');
    let rest = line.strip_prefix('N')?;
    let (number_str, rest) = rest.split_once(' ')?;
    let number: u32 = number_str.parse().ok()?;
    let star = rest.rfind(" *")?;
    let message = &rest[..star];
    Some((message.to_string(), number))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;
    use crate::planner_fed::IsPlannerFed;
    use std::sync::Arc;

    #[test]
    fn checksum_matches_xor_of_prefix() {
        let wire = build_checksummed_wire(1, "G1 X10");
        let text = String::from_utf8(wire).unwrap();
        let prefix = "N1 G1 X10 ";
        let expected: u8 = prefix.bytes().fold(0, |a, b| a ^ b);
        assert_eq!(text, format!("N1 G1 X10 *{}\n", expected));
    }

    #[test]
    fn round_trips_message_and_number() {
        let wire = build_checksummed_wire(42, "G28 W");
        let text = String::from_utf8(wire).unwrap();
        let (message, number) = parse_checksummed_wire(&text).unwrap();
        assert_eq!(message, "G28 W");
        assert_eq!(number, 42);
    }

    fn new_queue() -> Arc<SerialQueue> {
        let dispatcher = Arc::new(LineDispatcher::new());
        let transport = SerialTransport::new("/dev/null", 115200, false);
        let planner_fed = Arc::new(IsPlannerFed::new(None));
        SerialQueue::new(transport, dispatcher, planner_fed)
    }

    #[test]
    fn priority_precedes_ordinary() {
        let queue = new_queue();
        let ordinary = Instruction::plain("G1 X1", false);
        let priority = Instruction::plain("M112", false);
        queue.enqueue_one(ordinary.clone(), false);
        queue.enqueue_one(priority.clone(), true);
        let mut state = queue.state.lock().unwrap();
        let next = queue.pop_next(&mut state).unwrap();
        assert_eq!(next.message(), "M112");
    }

    #[test]
    fn ordinary_enqueue_preserves_fifo_order() {
        let queue = new_queue();
        let first = Instruction::plain("G1 X1", false);
        let second = Instruction::plain("G1 X2", false);
        queue.enqueue_one(first.clone(), false);
        queue.enqueue_one(second.clone(), false);
        let mut state = queue.state.lock().unwrap();
        let a = queue.pop_next(&mut state).unwrap();
        let b = queue.pop_next(&mut state).unwrap();
        assert_eq!(a.message(), "G1 X1");
        assert_eq!(b.message(), "G1 X2");
    }

    #[test]
    fn message_numbers_increment_and_history_grows() {
        let queue = new_queue();
        let a = Instruction::plain("G1 X10", true);
        let b = Instruction::plain("G1 X20", true);
        queue.enqueue_one(a, false);
        queue.enqueue_one(b, false);
        {
            let mut state = queue.state.lock().unwrap();
            let i1 = queue.prepare_next(&mut state).unwrap().0;
            state.current = None;
            let i2 = queue.prepare_next(&mut state).unwrap().0;
            assert_eq!(i1.message_number(), Some(1));
            assert_eq!(i2.message_number(), Some(2));
            assert_eq!(state.send_history.len(), 2);
        }
    }

    #[test]
    fn resend_replays_oldest_first() {
        let queue = new_queue();
        let a = Instruction::plain("G1 X10", true);
        let b = Instruction::plain("G1 X20", true);
        queue.enqueue_one(a, false);
        queue.enqueue_one(b, false);
        {
            let mut state = queue.state.lock().unwrap();
            queue.prepare_next(&mut state).unwrap();
            state.current = None;
            queue.prepare_next(&mut state).unwrap();
            state.current = None;
        }
        queue.replay_from_history(2);
        let mut state = queue.state.lock().unwrap();
        let first = queue.pop_next(&mut state).unwrap();
        let second = queue.pop_next(&mut state).unwrap();
        assert_eq!(first.message(), "G1 X10");
        assert_eq!(second.message(), "G1 X20");
    }

    #[test]
    fn flush_print_queue_drops_checksummed_instructions() {
        let queue = new_queue();
        let checksummed = Instruction::plain("G1 X10", true);
        let plain = Instruction::plain("M105", false);
        queue.enqueue_one(checksummed, true);
        queue.enqueue_one(plain.clone(), true);
        queue.flush_print_queue();
        let state = queue.state.lock().unwrap();
        assert_eq!(state.priority.len(), 1);
        assert_eq!(state.priority[0].message(), "M105");
    }
}
