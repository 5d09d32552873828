//! Concrete watched items built on the item updater (spec.md §2 component
//! 8 "Printer polling"; SPEC_FULL.md "Printer polling (component 8) —
//! concrete items").
//!
//! Grounded on `original_source/prusa/link/printer_adapter/
//! printer_polling.py` and `polling_items.py` (`_get_printer_type`,
//! `_get_firmware_version`, `_get_nozzle_diameter`, `_get_serial_number`)
//! for the actual gcode strings each query sends, and on `queue.rs`'s
//! matchable-instruction round-trip pattern already used by
//! `commands.rs` for how each query is issued and awaited. The regex
//! module those two files import from (`structures/regular_expressions.py`)
//! isn't present in this retrieval, so the capture patterns below are
//! reconstructed from the response shape implied by neighboring custom
//! M-code queries (bare value on the matched line) rather than copied
//! verbatim.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use log::{debug, info, warn};
use regex::Regex;

use crate::instruction::Instruction;
use crate::job::JobTracker;
use crate::queue::SerialQueue;
use crate::regexes;
use crate::state::StateManager;
use crate::types::PrinterModel;
use crate::updater::{ItemUpdater, WatchedItem};

const SLOW_INTERVAL: Duration = Duration::from_secs(3600);
const SLOW_TIMEOUT: Duration = Duration::from_secs(6 * 3600);
const MULTIPLIER_INTERVAL: Duration = Duration::from_secs(5);
const MBL_INTERVAL: Duration = Duration::from_secs(30);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

static SN_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^SN: ?(?P<sn>\S+)$").unwrap());
static FIRMWARE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:ok )?(?P<version>\d+(?:\.\d+)+)$").unwrap());
static MODEL_QUERY_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:ok )?(?P<code>\d{3,5})$").unwrap());
static NOZZLE_QUERY_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:ok )?(?P<diameter>\d+\.\d+)$").unwrap());
static FEEDRATE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^echo:FR: ?(?P<percent>\d+)%$").unwrap());
static FLOW_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^echo:E0 Flow: ?(?P<percent>\d+)%$").unwrap());
static MBL_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:ok )?(?:-?\d+\.\d+\s*)+$").unwrap());

fn parse_mbl_matrix(lines: &[String]) -> Vec<Vec<f32>> {
    lines
        .iter()
        .filter_map(|line| {
            let values: Vec<f32> = line
                .split_whitespace()
                .filter_map(|tok| tok.parse::<f32>().ok())
                .collect();
            if values.is_empty() {
                None
            } else {
                Some(values)
            }
        })
        .collect()
}

/// The watched items that corroborate the state manager's `printing`
/// layer and keep SN/FW/type/nozzle/MBL/multipliers/progress fresh
/// (SPEC_FULL.md "Printer polling").
pub struct PrinterPolling {
    pub serial_number: Arc<WatchedItem>,
    pub firmware_version: Arc<WatchedItem>,
    pub printer_type: Arc<WatchedItem>,
    pub nozzle_diameter: Arc<WatchedItem>,
    pub mbl: Arc<WatchedItem>,
    pub speed_multiplier: Arc<WatchedItem>,
    pub flow_multiplier: Arc<WatchedItem>,
    pub print_progress: Arc<WatchedItem>,
    pub print_state: Arc<WatchedItem>,
    queue: Arc<SerialQueue>,
    job: Arc<JobTracker>,
    state: Arc<StateManager>,
    last_progress_byte: AtomicU64,
    stall_count: AtomicU64,
}

impl PrinterPolling {
    pub fn new(queue: Arc<SerialQueue>, job: Arc<JobTracker>, state: Arc<StateManager>, updater: &Arc<ItemUpdater>) -> Arc<Self> {
        let serial_number = Arc::new(WatchedItem::new("serial_number").with_interval(SLOW_INTERVAL).with_timeout(SLOW_TIMEOUT));
        let firmware_version = Arc::new(WatchedItem::new("firmware_version").with_interval(SLOW_INTERVAL));
        let printer_type = Arc::new(WatchedItem::new("printer_type").with_interval(SLOW_INTERVAL));
        let nozzle_diameter = Arc::new(WatchedItem::new("nozzle_diameter").with_interval(SLOW_INTERVAL));
        let mbl = Arc::new(WatchedItem::new("mbl").with_interval(MBL_INTERVAL));
        let speed_multiplier = Arc::new(WatchedItem::new("speed_multiplier").with_interval(MULTIPLIER_INTERVAL));
        let flow_multiplier = Arc::new(WatchedItem::new("flow_multiplier").with_interval(MULTIPLIER_INTERVAL));
        let print_progress = Arc::new(WatchedItem::new("print_progress").with_interval(PROGRESS_INTERVAL));
        let print_state = Arc::new(WatchedItem::new("print_state").with_interval(PROGRESS_INTERVAL));

        for item in [
            &serial_number,
            &firmware_version,
            &printer_type,
            &nozzle_diameter,
            &mbl,
            &speed_multiplier,
            &flow_multiplier,
            &print_progress,
            &print_state,
        ] {
            updater.add_item(item.clone());
        }

        Arc::new(PrinterPolling {
            serial_number,
            firmware_version,
            printer_type,
            nozzle_diameter,
            mbl,
            speed_multiplier,
            flow_multiplier,
            print_progress,
            print_state,
            queue,
            job,
            state,
            last_progress_byte: AtomicU64::new(u64::MAX),
            stall_count: AtomicU64::new(0),
        })
    }

    /// Sends a matchable gcode and returns every captured line, or `None`
    /// if nothing matched before confirmation.
    async fn query(&self, gcode: &str, capture: Regex) -> Option<Vec<String>> {
        let instruction = Instruction::matchable(gcode, false, capture);
        self.queue.enqueue_one(instruction.clone(), false);
        instruction.wait_for_confirmation().await;
        let matches = instruction.matches();
        if matches.is_empty() {
            None
        } else {
            Some(matches)
        }
    }

    /// Spawns every background poller. Read-once items (SN, firmware,
    /// type, nozzle) run a single pass; the rest loop on their own
    /// interval, independent of the item updater's own tick (which only
    /// tracks validity/timeout bookkeeping here — values are pushed in via
    /// [`WatchedItem::set_value`] once a round trip completes, the same
    /// pattern the telemetry gatherer uses for autoreport lines).
    pub fn spawn(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.poll_serial_number().await });
        let this = self.clone();
        tokio::spawn(async move { this.poll_firmware_version().await });
        let this = self.clone();
        tokio::spawn(async move { this.poll_printer_type().await });
        let this = self.clone();
        tokio::spawn(async move { this.poll_nozzle_diameter().await });
        let this = self.clone();
        tokio::spawn(async move { this.poll_mbl_loop().await });
        let this = self.clone();
        tokio::spawn(async move { this.poll_multipliers_loop().await });
        let this = self.clone();
        tokio::spawn(async move { this.poll_progress_loop().await });
    }

    async fn poll_serial_number(self: Arc<Self>) {
        if let Some(lines) = self.query("PRUSA SN", SN_LINE.clone()).await {
            if let Some(caps) = SN_LINE.captures(&lines[0]) {
                self.serial_number.set_value(serde_json::json!(caps["sn"].to_string()));
                info!("printer serial number: {}", &caps["sn"]);
            }
        } else {
            warn!("no response to serial number query");
        }
    }

    async fn poll_firmware_version(self: Arc<Self>) {
        if let Some(lines) = self.query("PRUSA Fir", FIRMWARE_LINE.clone()).await {
            if let Some(caps) = FIRMWARE_LINE.captures(&lines[0]) {
                self.firmware_version.set_value(serde_json::json!(caps["version"].to_string()));
            }
        }
    }

    async fn poll_printer_type(self: Arc<Self>) {
        if let Some(lines) = self.query("M862.2 Q", MODEL_QUERY_LINE.clone()).await {
            if let Some(caps) = MODEL_QUERY_LINE.captures(&lines[0]) {
                if let Ok(code) = caps["code"].parse::<u32>() {
                    match PrinterModel::from_code(code) {
                        Some(model) => self.printer_type.set_value(serde_json::json!(format!("{:?}", model))),
                        None => warn!("unrecognized printer type code {}", code),
                    }
                }
            }
        }
    }

    async fn poll_nozzle_diameter(self: Arc<Self>) {
        if let Some(lines) = self.query("M862.1 Q", NOZZLE_QUERY_LINE.clone()).await {
            if let Some(caps) = NOZZLE_QUERY_LINE.captures(&lines[0]) {
                if let Ok(diameter) = caps["diameter"].parse::<f32>() {
                    self.nozzle_diameter.set_value(serde_json::json!(diameter));
                }
            }
        }
    }

    /// MBL is only meaningful (and only queried) while not printing —
    /// spec.md §2 "Printer polling ... MBL — polled only while not
    /// printing".
    async fn poll_mbl_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(MBL_INTERVAL).await;
            if self.state.current().is_printing_state() {
                continue;
            }
            let begin = Regex::new(r".*").unwrap();
            let end = regexes::CONFIRMATION.clone();
            let instruction = Instruction::collecting("G81", false, begin, end);
            self.queue.enqueue_one(instruction.clone(), false);
            instruction.wait_for_confirmation().await;
            let lines = instruction.collected_lines();
            let matrix = parse_mbl_matrix(&lines.iter().filter(|l| MBL_ROW.is_match(l)).cloned().collect::<Vec<_>>());
            if !matrix.is_empty() {
                self.job.set_mbl(matrix.clone());
                self.mbl.set_value(serde_json::to_value(&matrix).unwrap_or(serde_json::Value::Null));
            }
        }
    }

    async fn poll_multipliers_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(MULTIPLIER_INTERVAL).await;
            if let Some(lines) = self.query("M220", FEEDRATE_LINE.clone()).await {
                if let Some(caps) = FEEDRATE_LINE.captures(&lines[0]) {
                    if let Ok(percent) = caps["percent"].parse::<u32>() {
                        self.speed_multiplier.set_value(serde_json::json!(percent));
                    }
                }
            }
            if let Some(lines) = self.query("M221", FLOW_LINE.clone()).await {
                if let Some(caps) = FLOW_LINE.captures(&lines[0]) {
                    if let Ok(percent) = caps["percent"].parse::<u32>() {
                        self.flow_multiplier.set_value(serde_json::json!(percent));
                    }
                }
            }
        }
    }

    /// Derives print progress/state from M27 (spec.md §6's authoritative
    /// M27 regex contract), feeding `print_state`/`print_progress` as
    /// corroborating evidence for the state manager (not the sole source
    /// of truth, per spec.md's "Printer polling" bullet) and flipping the
    /// job tracker's `progress_broken` flag when SD percentage reads stuck
    /// (SPEC_FULL.md §4.6).
    async fn poll_progress_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(PROGRESS_INTERVAL).await;
            if !self.state.current().is_printing_state() {
                continue;
            }
            let Some(lines) = self.query("M27", regexes::M27_STATE.clone()).await else {
                continue;
            };
            let Some(caps) = regexes::M27_STATE.captures(&lines[0]) else {
                continue;
            };
            if caps.name("sdn_lfn").is_some() {
                let byte: u64 = caps.name("byte").and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
                let total: u64 = caps.name("total").and_then(|m| m.as_str().parse().ok()).unwrap_or(1);
                self.record_progress(byte, total);
                if let Some(sfn) = caps.name("sdn_lfn") {
                    self.job.resolve_path(sfn.as_str(), None);
                }
                self.print_state.set_value(serde_json::json!("SD_PRINTING"));
            } else if let Some(byte2) = caps.name("byte2") {
                let byte: u64 = byte2.as_str().parse().unwrap_or(0);
                let total: u64 = caps.name("total2").and_then(|m| m.as_str().parse().ok()).unwrap_or(1);
                self.record_progress(byte, total);
                self.print_state.set_value(serde_json::json!("SD_PRINTING"));
            } else {
                self.print_state.set_value(serde_json::json!("NOT_SD_PRINTING"));
            }
        }
    }

    fn record_progress(&self, byte: u64, total: u64) {
        let last = self.last_progress_byte.swap(byte, Ordering::SeqCst);
        if last == byte {
            let stuck = self.stall_count.fetch_add(1, Ordering::SeqCst) + 1;
            if stuck == 3 {
                self.job.progress_broken(true);
                debug!("M27 percentage looks stuck at {}/{}, deferring to STATS_EVERY", byte, total);
            }
        } else {
            self.stall_count.store(0, Ordering::SeqCst);
            self.job.progress_broken(false);
            let percent = ((byte as f64 / total.max(1) as f64) * 100.0).round() as u8;
            self.print_progress.set_value(serde_json::json!(percent));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mbl_matrix_rows() {
        let lines = vec!["0.10 0.12 0.09".to_string(), "0.11 0.13 0.08".to_string()];
        let matrix = parse_mbl_matrix(&lines);
        assert_eq!(matrix.len(), 2);
        assert_eq!(matrix[0], vec![0.10, 0.12, 0.09]);
    }

    #[test]
    fn firmware_line_captures_version() {
        let caps = FIRMWARE_LINE.captures("3.13.3").unwrap();
        assert_eq!(&caps["version"], "3.13.3");
    }

    #[test]
    fn model_query_captures_code() {
        let caps = MODEL_QUERY_LINE.captures("302").unwrap();
        assert_eq!(&caps["code"], "302");
        assert_eq!(PrinterModel::from_code(caps["code"].parse().unwrap()), Some(PrinterModel::Mk3S));
    }

    #[test]
    fn feedrate_line_captures_percent() {
        let caps = FEEDRATE_LINE.captures("echo:FR:120%").unwrap();
        assert_eq!(&caps["percent"], "120");
    }
}
