//! Adaptive percentile over recent confirmation latencies, deciding
//! whether the printer's motion buffer is full (spec.md §4.4).
//!
//! The original component (referenced from
//! `original_source/prusa/link/serial/serial_queue.py` as
//! `self.is_planner_fed = IsPlannerFed(threshold_path)`) was filtered out
//! of the retrieved `original_source/` file set, so the sliding-window
//! percentile and persistence format below follow spec.md §4.4 directly.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};

use crate::types::{PLANNER_FED_DEFAULT_THRESHOLD, PLANNER_FED_IGNORE_ABOVE, PLANNER_FED_WINDOW};

struct Inner {
    window: VecDeque<Duration>,
    threshold: Duration,
    last: Option<Duration>,
    is_fed: bool,
}

/// Tracks the last [`PLANNER_FED_WINDOW`] confirmation latencies and
/// exposes whether the most recent one suggests the printer's motion
/// planner buffer is full.
pub struct IsPlannerFed {
    inner: Mutex<Inner>,
    threshold_path: Option<PathBuf>,
}

impl IsPlannerFed {
    pub fn new(threshold_path: Option<PathBuf>) -> Self {
        let threshold = threshold_path
            .as_ref()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|s| s.trim().parse::<f64>().ok())
            .map(Duration::from_secs_f64)
            .unwrap_or(PLANNER_FED_DEFAULT_THRESHOLD);
        IsPlannerFed {
            inner: Mutex::new(Inner {
                window: VecDeque::with_capacity(PLANNER_FED_WINDOW),
                threshold,
                last: None,
                is_fed: false,
            }),
            threshold_path,
        }
    }

    /// Records a confirmation latency. Latencies above
    /// [`PLANNER_FED_IGNORE_ABOVE`] are ignored entirely (likely a heating
    /// wait or a user pause, not a buffer-full signal).
    pub fn process_value(&self, latency: Duration) {
        if latency > PLANNER_FED_IGNORE_ABOVE {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.window.len() == PLANNER_FED_WINDOW {
            inner.window.pop_front();
        }
        inner.window.push_back(latency);
        inner.threshold = percentile(&inner.window, 0.95);
        inner.last = Some(latency);
        inner.is_fed = latency > inner.threshold;
        drop(inner);
        self.persist();
    }

    /// Whether the most recent confirmation latency suggests the planner
    /// buffer is full.
    pub fn is_fed(&self) -> bool {
        self.inner.lock().unwrap().is_fed
    }

    /// Consumes ("invalidates") the fed flag — used by the serial queue
    /// right after letting one ordinary instruction through, so the
    /// ordinary queue doesn't all go through at once.
    pub fn invalidate(&self) {
        self.inner.lock().unwrap().is_fed = false;
    }

    pub fn threshold(&self) -> Duration {
        self.inner.lock().unwrap().threshold
    }

    fn persist(&self) {
        if let Some(path) = &self.threshold_path {
            let threshold = self.inner.lock().unwrap().threshold;
            if let Err(e) = std::fs::write(path, threshold.as_secs_f64().to_string()) {
                warn!("failed to persist planner-fed threshold to {:?}: {}", path, e);
            } else {
                debug!("persisted planner-fed threshold {:?}", threshold);
            }
        }
    }
}

/// Nearest-rank percentile over an unsorted window (clones and sorts; the
/// window is capped at [`PLANNER_FED_WINDOW`] entries so this stays cheap).
fn percentile(window: &VecDeque<Duration>, ratio: f64) -> Duration {
    if window.is_empty() {
        return PLANNER_FED_DEFAULT_THRESHOLD;
    }
    let mut sorted: Vec<Duration> = window.iter().copied().collect();
    sorted.sort();
    let rank = ((sorted.len() as f64 - 1.0) * ratio).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_persisted_threshold() {
        let fed = IsPlannerFed::new(None);
        assert_eq!(fed.threshold(), PLANNER_FED_DEFAULT_THRESHOLD);
        assert!(!fed.is_fed());
    }

    #[test]
    fn ignores_latencies_above_one_second() {
        let fed = IsPlannerFed::new(None);
        fed.process_value(Duration::from_secs(2));
        assert!(!fed.is_fed());
    }

    #[test]
    fn flags_fed_once_latency_exceeds_percentile() {
        let fed = IsPlannerFed::new(None);
        for _ in 0..20 {
            fed.process_value(Duration::from_millis(10));
        }
        fed.process_value(Duration::from_millis(900));
        assert!(fed.is_fed());
    }

    #[test]
    fn invalidate_clears_fed_flag() {
        let fed = IsPlannerFed::new(None);
        for _ in 0..20 {
            fed.process_value(Duration::from_millis(10));
        }
        fed.process_value(Duration::from_millis(900));
        assert!(fed.is_fed());
        fed.invalidate();
        assert!(!fed.is_fed());
    }

    #[test]
    fn persists_and_reloads_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threshold.data");
        {
            let fed = IsPlannerFed::new(Some(path.clone()));
            for _ in 0..20 {
                fed.process_value(Duration::from_millis(50));
            }
        }
        let reloaded = IsPlannerFed::new(Some(path));
        assert_eq!(reloaded.threshold(), Duration::from_millis(50));
    }
}
