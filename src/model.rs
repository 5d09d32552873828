//! Shared mutable view referenced by the state manager, job tracker and
//! command runner, which otherwise reference each other circularly
//! (spec.md §9 "Cyclic graphs"). Built once by `main.rs` and handed to
//! every component as an `Arc` clone instead of wiring each pair of
//! components directly to one another.

use std::sync::Arc;

use crate::connect::ConnectClient;
use crate::dispatcher::LineDispatcher;
use crate::file_printer::FilePrinter;
use crate::job::JobTracker;
use crate::lcd::LcdPrinter;
use crate::planner_fed::IsPlannerFed;
use crate::polling::PrinterPolling;
use crate::queue::SerialQueue;
use crate::state::StateManager;
use crate::telemetry::TelemetryPasser;
use crate::transport::SerialTransport;
use crate::updater::ItemUpdater;

/// The daemon's cross-cutting handles. Every long-running task and every
/// `Command` (spec.md §4.7) is constructed from a clone of this.
#[derive(Clone)]
pub struct Model {
    pub transport: Arc<SerialTransport>,
    pub dispatcher: Arc<LineDispatcher>,
    pub planner_fed: Arc<IsPlannerFed>,
    pub queue: Arc<SerialQueue>,
    pub state: Arc<StateManager>,
    pub job: Arc<JobTracker>,
    pub file_printer: Arc<FilePrinter>,
    pub telemetry: Arc<TelemetryPasser>,
    pub lcd: Arc<LcdPrinter>,
    pub connect: Arc<ConnectClient>,
    pub updater: Arc<ItemUpdater>,
    pub polling: Arc<PrinterPolling>,
}
