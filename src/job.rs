//! Job-id lifecycle coupled to state transitions, with EEPROM persistence
//! (spec.md §4.6), supplemented with `job_id_from_eeprom` offset-folding,
//! `progress_broken` inbuilt-reporting detection, and `select_file`/
//! `deselect_file` entry points (SPEC_FULL.md §4.6).
//!
//! Grounded on `original_source/prusa/link/printer_adapter/job.py`'s `Job`
//! singleton, `structures/module_data_classes.py`'s `JobData` persisted
//! fields, and `structures/model_classes.py`'s `JobState` enum.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::queue::SerialQueue;
use crate::state::StateManager;
use crate::types::{JobState, State};

/// Persisted across restarts (spec.md §3 "Job data").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobData {
    pub job_id: u32,
    #[serde(skip)]
    pub job_id_offset: u32,
    pub job_state: JobStateRepr,
    pub selected_file_path: Option<String>,
    pub selected_file_on_sd: bool,
    pub selected_file_size: Option<u64>,
    pub selected_file_m_time: Option<i64>,
    pub last_job_path: Option<String>,
    pub path_incomplete: bool,
    pub already_sent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobStateRepr {
    #[default]
    Idle,
    InProgress,
    Ending,
}

impl From<JobStateRepr> for JobState {
    fn from(value: JobStateRepr) -> Self {
        match value {
            JobStateRepr::Idle => JobState::Idle,
            JobStateRepr::InProgress => JobState::InProgress,
            JobStateRepr::Ending => JobState::Ending,
        }
    }
}

/// `get_job_info`'s return shape (spec.md §4.6).
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub job_id: u32,
    pub start_command_id: Option<u32>,
    pub path: Option<String>,
    pub m_time: Option<i64>,
    pub size: Option<u64>,
    pub from_sd: bool,
    pub mbl: Option<Vec<Vec<f32>>>,
}

struct Inner {
    data: JobData,
    start_command_id: Option<u32>,
    eeprom_read: bool,
    inbuilt_reporting: Option<bool>,
    recovering_from_power_panic: bool,
    mbl: Option<Vec<Vec<f32>>>,
}

/// Singleton keyed off state transitions (spec.md §4.6). Exclusively owns
/// job-id mutation (spec.md §3 "Ownership").
pub struct JobTracker {
    inner: Mutex<Inner>,
    persist_path: Option<PathBuf>,
    queue: Arc<SerialQueue>,
}

impl JobTracker {
    pub fn new(queue: Arc<SerialQueue>, persist_path: Option<PathBuf>) -> Arc<Self> {
        let data = persist_path
            .as_ref()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Arc::new(JobTracker {
            inner: Mutex::new(Inner {
                data,
                start_command_id: None,
                eeprom_read: false,
                inbuilt_reporting: None,
                recovering_from_power_panic: false,
                mbl: None,
            }),
            persist_path,
            queue,
        })
    }

    pub fn job_id(&self) -> u32 {
        self.inner.lock().unwrap().data.job_id
    }

    pub fn queue(&self) -> Arc<SerialQueue> {
        self.queue.clone()
    }

    pub fn job_state(&self) -> JobState {
        self.inner.lock().unwrap().data.job_state.into()
    }

    pub fn set_recovering_from_power_panic(&self, recovering: bool) {
        self.inner.lock().unwrap().recovering_from_power_panic = recovering;
    }

    /// Marks a file as selected without starting a print (used by the
    /// out-of-scope HTTP layer; kept here so that collaborator surface is
    /// documented, per SPEC_FULL.md §4.6).
    pub fn select_file(&self, path: impl AsRef<Path>, on_sd: bool, size: Option<u64>, m_time: Option<i64>) {
        let mut inner = self.inner.lock().unwrap();
        inner.data.selected_file_path = Some(path.as_ref().to_string_lossy().into_owned());
        inner.data.selected_file_on_sd = on_sd;
        inner.data.selected_file_size = size;
        inner.data.selected_file_m_time = m_time;
        inner.data.path_incomplete = false;
        drop(inner);
        self.persist();
    }

    pub fn deselect_file(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.data.selected_file_path = None;
        inner.data.selected_file_size = None;
        inner.data.selected_file_m_time = None;
        drop(inner);
        self.persist();
    }

    pub fn set_mbl(&self, mbl: Vec<Vec<f32>>) {
        self.inner.lock().unwrap().mbl = Some(mbl);
    }

    /// Folds an accumulated pre-read offset into the printer's reported
    /// EEPROM job id, exactly once (spec.md/SPEC_FULL.md §4.6
    /// `job_id_from_eeprom`).
    pub fn job_id_from_eeprom(&self, reported: u32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.eeprom_read {
            return;
        }
        inner.eeprom_read = true;
        let folded = reported + inner.data.job_id_offset;
        inner.data.job_id_offset = 0;
        inner.data.job_id = folded;
        drop(inner);
        self.persist();
        info!("job id reconciled from EEPROM: {}", folded);
    }

    /// An SD print's M27 percentage was observed stuck at a stale value;
    /// the first such observation flips `inbuilt_reporting` off, the first
    /// reliable read flips it back on (SPEC_FULL.md §4.6
    /// `progress_broken`).
    pub fn progress_broken(&self, broken: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.inbuilt_reporting = Some(!broken);
    }

    pub fn inbuilt_reporting(&self) -> Option<bool> {
        self.inner.lock().unwrap().inbuilt_reporting
    }

    /// Translates a mixed SFN/LFN path to a Connect-visible path; if no
    /// translation is known the path is recorded incomplete, and is not
    /// overwritten by a later incomplete observation.
    pub fn resolve_path(&self, sfn_lfn: &str, translated: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        match translated {
            Some(path) => {
                inner.data.selected_file_path = Some(path);
                inner.data.path_incomplete = false;
            }
            None => {
                if !inner.data.path_incomplete || inner.data.selected_file_path.is_none() {
                    inner.data.selected_file_path = Some(sfn_lfn.to_string());
                    inner.data.path_incomplete = true;
                }
            }
        }
    }

    pub fn get_job_info(&self, for_connect: bool) -> JobInfo {
        let mut inner = self.inner.lock().unwrap();
        if for_connect {
            inner.data.already_sent = true;
        }
        JobInfo {
            job_id: inner.data.job_id,
            start_command_id: inner.start_command_id,
            path: inner.data.selected_file_path.clone(),
            m_time: inner.data.selected_file_m_time,
            size: inner.data.selected_file_size,
            from_sd: inner.data.selected_file_on_sd,
            mbl: inner.mbl.clone(),
        }
    }

    /// Called whenever the state manager's external state changes; entry
    /// into a printing-starting state increments the job id (unless
    /// recovering from a power panic); entry into a printing-ending state
    /// ticks through ENDING for one observation before IDLE.
    pub fn on_state_changed(&self, to: State, command_id: Option<u32>) {
        if to.is_job_starting() {
            let mut inner = self.inner.lock().unwrap();
            if inner.recovering_from_power_panic {
                inner.recovering_from_power_panic = false;
            } else {
                inner.data.job_id += 1;
                inner.data.job_id_offset += 1;
                inner.data.job_state = JobStateRepr::InProgress;
                inner.start_command_id = command_id;
                let job_id = inner.data.job_id;
                drop(inner);
                self.write_job_id_to_eeprom(job_id);
                self.persist();
            }
        } else if to.is_job_ending() {
            let mut inner = self.inner.lock().unwrap();
            if inner.data.job_state == JobStateRepr::InProgress {
                inner.data.job_state = JobStateRepr::Ending;
                drop(inner);
                self.persist();
            } else if inner.data.job_state == JobStateRepr::Ending {
                inner.data.job_state = JobStateRepr::Idle;
                inner.data.last_job_path = inner.data.selected_file_path.clone();
                drop(inner);
                self.persist();
            }
        }
    }

    /// Writes the new job id back to EEPROM via `D3 Ax0D05 X<hex>`
    /// (spec.md §6 "Persisted state layout").
    fn write_job_id_to_eeprom(&self, job_id: u32) {
        let bytes = job_id.to_le_bytes();
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        let gcode = format!("D3 Ax0D05 X{}", hex);
        use crate::instruction::Instruction;
        self.queue.enqueue_one(Instruction::plain(gcode, false), true);
    }

    fn persist(&self) {
        if let Some(path) = &self.persist_path {
            let data = self.inner.lock().unwrap().data.clone();
            match serde_json::to_string_pretty(&data) {
                Ok(json) => {
                    if let Err(e) = std::fs::write(path, json) {
                        warn!("failed to persist job data to {:?}: {}", path, e);
                    }
                }
                Err(e) => warn!("failed to serialize job data: {}", e),
            }
        }
    }
}

/// Subscribes to the state manager's changes and drives the job tracker,
/// decoupling the two (the tracker has no task of its own; spec.md §5
/// "Job tracker tick (piggybacks on state-change callbacks; no own loop)").
pub async fn run_job_tracker_bridge(tracker: Arc<JobTracker>, state: Arc<StateManager>) {
    let mut rx = state.subscribe();
    while let Ok(event) = rx.recv().await {
        tracker.on_state_changed(event.to, event.command_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::LineDispatcher;
    use crate::planner_fed::IsPlannerFed;
    use crate::transport::SerialTransport;

    fn new_tracker() -> Arc<JobTracker> {
        let dispatcher = Arc::new(LineDispatcher::new());
        let transport = SerialTransport::new("/dev/null", 115200, false);
        let planner_fed = Arc::new(IsPlannerFed::new(None));
        let queue = SerialQueue::new(transport, dispatcher, planner_fed);
        JobTracker::new(queue, None)
    }

    #[test]
    fn job_id_increments_on_printing_start() {
        let tracker = new_tracker();
        assert_eq!(tracker.job_id(), 0);
        tracker.on_state_changed(State::Printing, Some(7));
        assert_eq!(tracker.job_id(), 1);
        assert_eq!(tracker.job_state(), JobState::InProgress);
    }

    #[test]
    fn job_ending_ticks_through_ending_before_idle() {
        let tracker = new_tracker();
        tracker.on_state_changed(State::Printing, None);
        tracker.on_state_changed(State::Finished, None);
        assert_eq!(tracker.job_state(), JobState::Ending);
        tracker.on_state_changed(State::Idle, None);
        assert_eq!(tracker.job_state(), JobState::Idle);
    }

    #[test]
    fn power_panic_recovery_skips_increment() {
        let tracker = new_tracker();
        tracker.set_recovering_from_power_panic(true);
        tracker.on_state_changed(State::Printing, None);
        assert_eq!(tracker.job_id(), 0);
    }

    #[test]
    fn eeprom_offset_folds_once() {
        let tracker = new_tracker();
        tracker.on_state_changed(State::Printing, None);
        tracker.on_state_changed(State::Printing, None);
        tracker.job_id_from_eeprom(100);
        assert_eq!(tracker.job_id(), 102);
        tracker.job_id_from_eeprom(500);
        assert_eq!(tracker.job_id(), 102, "second eeprom read should be a no-op");
    }

    #[test]
    fn incomplete_path_not_overwritten_by_later_incomplete() {
        let tracker = new_tracker();
        tracker.resolve_path("MYFI~1.GCO", None);
        tracker.resolve_path("MYFI~1.GCO", None);
        let info = tracker.get_job_info(false);
        assert_eq!(info.path, Some("MYFI~1.GCO".to_string()));
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job_data.json");
        {
            let tracker = new_tracker();
            let tracker = JobTracker::new(tracker.queue(), Some(path.clone()));
            tracker.on_state_changed(State::Printing, None);
        }
        let dispatcher = Arc::new(LineDispatcher::new());
        let transport = SerialTransport::new("/dev/null", 115200, false);
        let planner_fed = Arc::new(IsPlannerFed::new(None));
        let queue = SerialQueue::new(transport, dispatcher, planner_fed);
        let reloaded = JobTracker::new(queue, Some(path));
        assert_eq!(reloaded.job_id(), 1);
    }
}
