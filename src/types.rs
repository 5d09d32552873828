//! Shared constants and small value types used across the core.
//!
//! Values are carried over from the original printer-adapter's `const.py`
//! so behaviour (timeouts, thresholds, buffer sizes) matches firmware
//! expectations bit-for-bit.

use std::time::Duration;

pub const QUIT_INTERVAL: Duration = Duration::from_millis(200);
pub const SERIAL_REOPEN_TIMEOUT: Duration = Duration::from_secs(2);
pub const PRINTER_BOOT_WAIT: Duration = Duration::from_secs(8);

pub const RX_SIZE: usize = 128;
pub const SERIAL_QUEUE_TIMEOUT: Duration = Duration::from_secs(25);
pub const SERIAL_QUEUE_MONITOR_INTERVAL: Duration = Duration::from_secs(1);
pub const HISTORY_LENGTH: usize = 30;
pub const MAX_MESSAGE_NUMBER: u32 = (1u32 << 31) - 1;

pub const PLANNER_FED_WINDOW: usize = 10_000;
pub const PLANNER_FED_PERCENTILE: f64 = 0.95;
pub const PLANNER_FED_IGNORE_ABOVE: Duration = Duration::from_secs(1);
pub const PLANNER_FED_DEFAULT_THRESHOLD: Duration = Duration::from_millis(130);

pub const STATE_HISTORY_SIZE: usize = 10;
pub const ERROR_REASON_TIMEOUT: Duration = Duration::from_secs(2);
pub const STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(15);

pub const JITTER_THRESHOLD: f32 = 0.5;
pub const TELEMETRY_IDLE_INTERVAL: Duration = Duration::from_millis(250);
pub const TELEMETRY_PRINTING_INTERVAL: Duration = Duration::from_secs(1);
pub const TELEMETRY_SLEEPING_INTERVAL: Duration = Duration::from_secs(5);
pub const TELEMETRY_SLEEP_AFTER: Duration = Duration::from_secs(180);

pub const REPORTING_TIMEOUT: Duration = Duration::from_secs(60);
pub const STATS_EVERY: u64 = 100;

pub const LCD_QUEUE_SIZE: usize = 30;

/// The base layer of the externally visible state (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseState {
    Busy,
    Idle,
    Ready,
}

/// The printing layer, `None` when no job is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrintingState {
    Printing,
    Paused,
    Finished,
    Stopped,
}

/// The override layer, takes precedence over everything but ERROR over ATTENTION.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverrideState {
    Attention,
    Error,
}

/// The externally visible state: `override ?? printing ?? base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Busy,
    Idle,
    Ready,
    Printing,
    Paused,
    Finished,
    Stopped,
    Attention,
    Error,
}

impl State {
    pub fn is_printing_state(self) -> bool {
        matches!(
            self,
            State::Printing | State::Paused | State::Finished | State::Stopped
        )
    }

    pub fn is_job_starting(self) -> bool {
        matches!(self, State::Printing)
    }

    pub fn is_job_ending(self) -> bool {
        matches!(
            self,
            State::Idle | State::Busy | State::Finished | State::Stopped | State::Error
        )
    }
}

/// Who caused a state transition, used for Connect attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Connect,
    Http,
    Firmware,
    Wui,
    Marlin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    InProgress,
    Ending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintMode {
    Normal,
    Silent,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterModel {
    Mk25,
    Mk25S,
    Mk3,
    Mk3S,
}

impl PrinterModel {
    /// Mirrors `PRINTER_CONF_TYPES`/`PRINTER_TYPES` in the original `const.py`.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            250 | 20250 => Some(PrinterModel::Mk25),
            252 | 20252 => Some(PrinterModel::Mk25S),
            300 | 20300 => Some(PrinterModel::Mk3),
            302 | 20302 => Some(PrinterModel::Mk3S),
            _ => None,
        }
    }
}
