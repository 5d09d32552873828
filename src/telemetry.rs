//! Telemetry gatherer (autoreport parsing, rearm-on-silence) and
//! telemetry passer (delta computation, jitter filter, rate-adaptive
//! flush) — spec.md §4.9, data model §3 "Telemetry snapshot".
//!
//! Grounded on `original_source/prusa/link/printer_adapter/prusa_link.py`'s
//! telemetry wiring and `input_output/serial/serial_parser.py`'s
//! autoreport handlers; the passer's delta/jitter/interval logic follows
//! spec.md §4.9 directly since the filtered `original_source/` set did not
//! retain the passer module itself.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::LineDispatcher;
use crate::instruction::Instruction;
use crate::queue::SerialQueue;
use crate::regexes;
use crate::types::{
    State, JITTER_THRESHOLD, REPORTING_TIMEOUT, TELEMETRY_IDLE_INTERVAL, TELEMETRY_PRINTING_INTERVAL,
    TELEMETRY_SLEEPING_INTERVAL, TELEMETRY_SLEEP_AFTER,
};

/// Nullable telemetry fields (spec.md §3). Field names match Connect's
/// wire vocabulary so `to_send`'s sparse JSON body needs no renaming.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TelemetrySnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_nozzle: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_nozzle: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_bed: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_bed: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis_x: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis_y: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis_z: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis_e: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_print: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_extruder: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_fan_print: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_fan_extruder: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub print_dur: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_est: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Fields that don't make sense while not printing, dropped per spec.md
/// §4.9 step 1 ("all print-progress/time fields while not printing").
const PRINT_ONLY_FIELDS: &[&str] = &["progress", "speed", "flow", "print_dur", "time_est"];
/// Fields whose change counts as "activity" for the sleep/wake logic
/// (spec.md §4.9 step 4).
const ACTIVITY_FIELDS: &[&str] = &[
    "target_nozzle",
    "target_bed",
    "axis_x",
    "axis_y",
    "axis_z",
    "axis_e",
    "speed",
];

struct Inner {
    last_sent: TelemetrySnapshot,
    to_send: serde_json::Map<String, Value>,
    last_activity: Instant,
    queue_depth: usize,
}

/// Rate-adaptive, jitter-filtered delta telemetry (spec.md §4.9, §4.14 in
/// the component list).
pub struct TelemetryPasser {
    inner: Mutex<Inner>,
    wake: Notify,
    cancel: CancellationToken,
    flush_tx: broadcast::Sender<serde_json::Map<String, Value>>,
}

impl TelemetryPasser {
    pub fn new() -> Arc<Self> {
        let (flush_tx, _) = broadcast::channel(16);
        Arc::new(TelemetryPasser {
            inner: Mutex::new(Inner {
                last_sent: TelemetrySnapshot::default(),
                to_send: serde_json::Map::new(),
                last_activity: Instant::now(),
                queue_depth: 0,
            }),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            flush_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<serde_json::Map<String, Value>> {
        self.flush_tx.subscribe()
    }

    /// Records how many telemetry payloads are unsent in the Connect
    /// client's outbound queue; at 4+, telemetry is dropped entirely
    /// (spec.md §4.9 step 5).
    pub fn set_queue_depth(&self, depth: usize) {
        self.inner.lock().unwrap().queue_depth = depth;
    }

    /// Applies one field update, honoring state-appropriate suppression
    /// and the nozzle/bed jitter threshold.
    pub fn update_field(&self, field: &'static str, value: Value, numeric: Option<f32>, state: State) {
        if PRINT_ONLY_FIELDS.contains(&field) && !state.is_printing_state() {
            return;
        }
        if field == "axis_x" || field == "axis_y" {
            if state == State::Printing {
                return;
            }
        }
        let mut inner = self.inner.lock().unwrap();
        if field == "temp_nozzle" || field == "temp_bed" {
            if let Some(n) = numeric {
                let last = match field {
                    "temp_nozzle" => inner.last_sent.temp_nozzle,
                    _ => inner.last_sent.temp_bed,
                };
                if let Some(last) = last {
                    if (n - last).abs() < JITTER_THRESHOLD {
                        return;
                    }
                }
            }
        }
        let previously_sent = field_value(&inner.last_sent, field);
        if previously_sent.as_ref() == Some(&value) {
            return;
        }
        inner.to_send.insert(field.to_string(), value);
        if ACTIVITY_FIELDS.contains(&field) {
            inner.last_activity = Instant::now();
        }
        drop(inner);
        self.wake.notify_one();
    }

    /// Forces a full retransmit by copying `last_sent` back into
    /// `to_send`, used after a Connect reconnect.
    pub fn resend_latest_telemetry(&self) {
        let mut inner = self.inner.lock().unwrap();
        let snapshot = serde_json::to_value(&inner.last_sent).unwrap_or(Value::Null);
        if let Value::Object(map) = snapshot {
            inner.to_send = map;
        }
        drop(inner);
        self.wake.notify_one();
    }

    fn interval_for(&self, state: State) -> Duration {
        let idle_too_long = self.inner.lock().unwrap().last_activity.elapsed() > TELEMETRY_SLEEP_AFTER;
        if idle_too_long {
            TELEMETRY_SLEEPING_INTERVAL
        } else if state.is_printing_state() {
            TELEMETRY_PRINTING_INTERVAL
        } else {
            TELEMETRY_IDLE_INTERVAL
        }
    }

    fn drain(&self) -> Option<serde_json::Map<String, Value>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.to_send.is_empty() {
            return None;
        }
        if inner.queue_depth >= 4 {
            debug!("dropping telemetry, outbound queue has {} unsent items", inner.queue_depth);
            inner.to_send.clear();
            return None;
        }
        let batch = std::mem::take(&mut inner.to_send);
        for (key, value) in &batch {
            apply_field(&mut inner.last_sent, key, value.clone());
        }
        Some(batch)
    }

    pub async fn run(self: Arc<Self>, current_state: impl Fn() -> State + Send + Sync + 'static) {
        loop {
            let interval = self.interval_for(current_state());
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
                _ = self.wake.notified() => {}
            }
            if let Some(batch) = self.drain() {
                let _ = self.flush_tx.send(batch);
            }
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

fn field_value(snapshot: &TelemetrySnapshot, field: &str) -> Option<Value> {
    let value = serde_json::to_value(snapshot).ok()?;
    value.get(field).cloned()
}

fn apply_field(snapshot: &mut TelemetrySnapshot, field: &str, value: Value) {
    macro_rules! set {
        ($name:ident, $ty:ty) => {
            snapshot.$name = serde_json::from_value::<$ty>(value.clone()).ok()
        };
    }
    match field {
        "temp_nozzle" => set!(temp_nozzle, f32),
        "target_nozzle" => set!(target_nozzle, f32),
        "temp_bed" => set!(temp_bed, f32),
        "target_bed" => set!(target_bed, f32),
        "axis_x" => set!(axis_x, f32),
        "axis_y" => set!(axis_y, f32),
        "axis_z" => set!(axis_z, f32),
        "axis_e" => set!(axis_e, f32),
        "fan_print" => set!(fan_print, u32),
        "fan_extruder" => set!(fan_extruder, u32),
        "target_fan_print" => set!(target_fan_print, u32),
        "target_fan_extruder" => set!(target_fan_extruder, u32),
        "progress" => set!(progress, u8),
        "speed" => set!(speed, u32),
        "flow" => set!(flow, u32),
        "print_dur" => set!(print_dur, u32),
        "time_est" => set!(time_est, u32),
        "slot" => set!(slot, u8),
        "state" => set!(state, String),
        _ => warn!("unknown telemetry field '{}'", field),
    }
}

/// Parses autoreport lines and feeds the passer; resends `M155 S2 C7` if
/// any of the three autoreport regexes falls silent past
/// [`REPORTING_TIMEOUT`] (spec.md §4.9).
pub struct TelemetryGatherer {
    passer: Arc<TelemetryPasser>,
    queue: Arc<SerialQueue>,
    last_temp: Mutex<Instant>,
    last_position: Mutex<Instant>,
    last_fan: Mutex<Instant>,
    current_state: Arc<dyn Fn() -> State + Send + Sync>,
}

impl TelemetryGatherer {
    pub fn new(
        passer: Arc<TelemetryPasser>,
        queue: Arc<SerialQueue>,
        current_state: Arc<dyn Fn() -> State + Send + Sync>,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(TelemetryGatherer {
            passer,
            queue,
            last_temp: Mutex::new(now),
            last_position: Mutex::new(now),
            last_fan: Mutex::new(now),
            current_state,
        })
    }

    fn arm_autoreport(&self) {
        self.queue.enqueue_one(Instruction::plain("M155 S2 C7", false), true);
    }

    pub fn install_handlers(self: &Arc<Self>, dispatcher: &LineDispatcher) {
        self.arm_autoreport();

        let g = self.clone();
        dispatcher.add_handler(
            regexes::TEMPERATURE.clone(),
            0.5,
            Box::new(move |_, caps| {
                *g.last_temp.lock().unwrap() = Instant::now();
                let state = (g.current_state)();
                if let Some(m) = caps.name("ntemp") {
                    if let Ok(v) = m.as_str().parse::<f32>() {
                        g.passer.update_field("temp_nozzle", serde_json::json!(v), Some(v), state);
                    }
                }
                if let Some(m) = caps.name("set_ntemp") {
                    if let Ok(v) = m.as_str().parse::<f32>() {
                        g.passer.update_field("target_nozzle", serde_json::json!(v), None, state);
                    }
                }
                if let Some(m) = caps.name("btemp") {
                    if let Ok(v) = m.as_str().parse::<f32>() {
                        g.passer.update_field("temp_bed", serde_json::json!(v), Some(v), state);
                    }
                }
                if let Some(m) = caps.name("set_btemp") {
                    if let Ok(v) = m.as_str().parse::<f32>() {
                        g.passer.update_field("target_bed", serde_json::json!(v), None, state);
                    }
                }
            }),
        );

        let g = self.clone();
        dispatcher.add_handler(
            regexes::POSITION.clone(),
            0.5,
            Box::new(move |_, caps| {
                *g.last_position.lock().unwrap() = Instant::now();
                let state = (g.current_state)();
                for (group, field) in [("x", "axis_x"), ("y", "axis_y"), ("z", "axis_z")] {
                    if let Some(m) = caps.name(group) {
                        if let Ok(v) = m.as_str().parse::<f32>() {
                            g.passer.update_field(field, serde_json::json!(v), None, state);
                        }
                    }
                }
            }),
        );

        let g = self.clone();
        dispatcher.add_handler(
            regexes::FAN.clone(),
            0.5,
            Box::new(move |_, caps| {
                *g.last_fan.lock().unwrap() = Instant::now();
                let state = (g.current_state)();
                if let Some(m) = caps.name("print_rpm") {
                    if let Ok(v) = m.as_str().parse::<u32>() {
                        g.passer.update_field("fan_print", serde_json::json!(v), None, state);
                    }
                }
                if let Some(m) = caps.name("extruder_rpm") {
                    if let Ok(v) = m.as_str().parse::<u32>() {
                        g.passer.update_field("fan_extruder", serde_json::json!(v), None, state);
                    }
                }
            }),
        );
    }

    /// Periodic watchdog: rearm autoreport if any channel has been silent
    /// past [`REPORTING_TIMEOUT`].
    pub async fn run_watchdog(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let silent = {
                let t = *self.last_temp.lock().unwrap();
                let p = *self.last_position.lock().unwrap();
                let f = *self.last_fan.lock().unwrap();
                [t, p, f].iter().any(|i| i.elapsed() > REPORTING_TIMEOUT)
            };
            if silent {
                warn!("autoreport silent past {:?}, rearming M155", REPORTING_TIMEOUT);
                self.arm_autoreport();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_below_threshold_is_dropped() {
        let passer = TelemetryPasser::new();
        passer.update_field("temp_nozzle", serde_json::json!(215.0), Some(215.0), State::Idle);
        passer.drain();
        passer.update_field("temp_nozzle", serde_json::json!(215.3), Some(215.3), State::Idle);
        assert!(passer.inner.lock().unwrap().to_send.is_empty());
    }

    #[test]
    fn jitter_above_threshold_is_sent() {
        let passer = TelemetryPasser::new();
        passer.update_field("temp_nozzle", serde_json::json!(215.0), Some(215.0), State::Idle);
        passer.drain();
        passer.update_field("temp_nozzle", serde_json::json!(215.7), Some(215.7), State::Idle);
        let batch = passer.drain().unwrap();
        assert_eq!(batch.get("temp_nozzle").unwrap(), &serde_json::json!(215.7));
    }

    #[test]
    fn progress_suppressed_while_not_printing() {
        let passer = TelemetryPasser::new();
        passer.update_field("progress", serde_json::json!(50), None, State::Idle);
        assert!(passer.drain().is_none());
    }

    #[test]
    fn progress_sent_while_printing() {
        let passer = TelemetryPasser::new();
        passer.update_field("progress", serde_json::json!(50), None, State::Printing);
        let batch = passer.drain().unwrap();
        assert_eq!(batch.get("progress").unwrap(), &serde_json::json!(50));
    }

    #[test]
    fn queue_depth_four_drops_telemetry() {
        let passer = TelemetryPasser::new();
        passer.set_queue_depth(4);
        passer.update_field("temp_bed", serde_json::json!(60.0), Some(60.0), State::Idle);
        assert!(passer.drain().is_none());
    }

    #[test]
    fn resend_latest_copies_last_sent_back_to_to_send() {
        let passer = TelemetryPasser::new();
        passer.update_field("temp_bed", serde_json::json!(60.0), Some(60.0), State::Idle);
        passer.drain();
        passer.resend_latest_telemetry();
        let batch = passer.drain().unwrap();
        assert_eq!(batch.get("temp_bed").unwrap(), &serde_json::json!(60.0));
    }
}
