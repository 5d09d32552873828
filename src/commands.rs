//! Turns external commands (from Connect or HTTP) into sequences of
//! serial instructions while reserving ownership of state transitions
//! (spec.md §4.7).
//!
//! Grounded on `original_source/prusa/link/printer_adapter/command_queue.py`
//! and `command.py`'s `Command` base class (`try_until_state`, rejection
//! detection) and the concrete command modules under
//! `printer_adapter/command_handlers/`. Trait objects return a
//! `futures::future::BoxFuture` rather than pulling in `async-trait`,
//! matching the teacher's existing `futures` dependency.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{info, warn};
use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::instruction::Instruction;
use crate::model::Model;
use crate::state::StateChange;
use crate::types::{Source, State, STATE_CHANGE_TIMEOUT};

const QUIT_INTERVAL: Duration = Duration::from_millis(200);

static NEXT_COMMAND_ID: AtomicU32 = AtomicU32::new(1);

pub fn next_command_id() -> u32 {
    NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed)
}

/// Why a command failed, surfaced to Connect as a `REJECTED`/`FAILED`
/// event reason (spec.md §7 "Command failure").
#[derive(Debug, Clone)]
pub struct CommandError(pub String);

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for CommandError {}

impl From<&str> for CommandError {
    fn from(value: &str) -> Self {
        CommandError(value.to_string())
    }
}

/// A phrase the printer emits to reject a G-code, scanned for in a
/// matchable instruction's captures (spec.md §4.7 step 3).
const REJECTION_PHRASES: &[&str] = &["unknown command", "cold extrusion prevented", "Invalid extruder"];

fn check_rejection(lines: &[String]) -> Option<String> {
    for line in lines {
        for phrase in REJECTION_PHRASES {
            if line.to_lowercase().contains(&phrase.to_lowercase()) {
                return Some(line.clone());
            }
        }
    }
    None
}

/// One queued external command (spec.md §4.7).
pub trait Command: Send + Sync {
    fn name(&self) -> &'static str;
    /// The Connect-assigned command id, if this command originated there.
    fn connect_command_id(&self) -> Option<u32> {
        None
    }
    fn run<'a>(&'a self, model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>>;
}

/// Sends one G-code and waits up to [`STATE_CHANGE_TIMEOUT`] for the
/// printer to reach one of `desired`, polling at `QUIT_INTERVAL` (spec.md
/// §4.7 "common TryUntilState helper").
async fn try_until_state(model: &Model, gcode: &str, desired: &[State]) -> Result<(), CommandError> {
    let instruction = Instruction::plain(gcode, false);
    model.queue.enqueue_one(instruction, true);
    let deadline = tokio::time::Instant::now() + STATE_CHANGE_TIMEOUT;
    loop {
        if desired.contains(&model.state.current()) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(CommandError(format!(
                "timed out waiting for printer to reach {:?} after '{}'",
                desired, gcode
            )));
        }
        sleep(QUIT_INTERVAL).await;
    }
}

/// Sends a matchable instruction and waits for its confirmation, failing
/// if the captured lines contain a rejection phrase (spec.md §4.7 step 3).
async fn send_and_check_rejection(model: &Model, gcode: &str, capture: Regex) -> Result<Vec<String>, CommandError> {
    let instruction = Instruction::matchable(gcode, false, capture);
    model.queue.enqueue_one(instruction.clone(), true);
    instruction.wait_for_confirmation().await;
    let matches = instruction.matches();
    if let Some(reason) = check_rejection(&matches) {
        return Err(CommandError(reason));
    }
    Ok(matches)
}

fn echo_regex() -> Regex {
    Regex::new(r"^echo:.*$").unwrap()
}

async fn wait_for_state(model: &Model, desired: &[State]) -> Result<(), CommandError> {
    let result = timeout(STATE_CHANGE_TIMEOUT, async {
        loop {
            if desired.contains(&model.state.current()) {
                return;
            }
            sleep(QUIT_INTERVAL).await;
        }
    })
    .await;
    result.map_err(|_| CommandError(format!("timed out waiting for {:?}", desired)))
}

pub struct StartPrint {
    pub connect_id: Option<u32>,
    pub path: String,
}

impl Command for StartPrint {
    fn name(&self) -> &'static str {
        "start_print"
    }
    fn connect_command_id(&self) -> Option<u32> {
        self.connect_id
    }
    fn run<'a>(&'a self, model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            model.state.expect_change(
                StateChange::new()
                    .to(State::Printing, Source::Connect)
                    .default_source(Source::Connect)
                    .reason(format!("print: {}", self.path)),
            );
            model.file_printer.start(&self.path).await.map_err(CommandError)?;
            wait_for_state(model, &[State::Printing]).await
        }
        .boxed()
    }
}

pub struct StopPrint {
    pub connect_id: Option<u32>,
}

impl Command for StopPrint {
    fn name(&self) -> &'static str {
        "stop_print"
    }
    fn connect_command_id(&self) -> Option<u32> {
        self.connect_id
    }
    fn run<'a>(&'a self, model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            model.state.expect_change(StateChange::new().to(State::Stopped, Source::Connect));
            model.file_printer.stop().await;
            model.queue.flush_print_queue();
            try_until_state(model, "M603", &[State::Stopped, State::Idle]).await
        }
        .boxed()
    }
}

pub struct PausePrint {
    pub connect_id: Option<u32>,
}

impl Command for PausePrint {
    fn name(&self) -> &'static str {
        "pause_print"
    }
    fn connect_command_id(&self) -> Option<u32> {
        self.connect_id
    }
    fn run<'a>(&'a self, model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            model.state.expect_change(StateChange::new().to(State::Paused, Source::Connect));
            model.file_printer.pause();
            try_until_state(model, "M601", &[State::Paused]).await
        }
        .boxed()
    }
}

pub struct ResumePrint {
    pub connect_id: Option<u32>,
}

impl Command for ResumePrint {
    fn name(&self) -> &'static str {
        "resume_print"
    }
    fn connect_command_id(&self) -> Option<u32> {
        self.connect_id
    }
    fn run<'a>(&'a self, model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            model.state.expect_change(StateChange::new().to(State::Printing, Source::Connect));
            model.file_printer.resume();
            try_until_state(model, "M602", &[State::Printing]).await
        }
        .boxed()
    }
}

pub struct ExecuteGcode {
    pub connect_id: Option<u32>,
    pub gcode: String,
}

impl Command for ExecuteGcode {
    fn name(&self) -> &'static str {
        "execute_gcode"
    }
    fn connect_command_id(&self) -> Option<u32> {
        self.connect_id
    }
    fn run<'a>(&'a self, model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            send_and_check_rejection(model, &self.gcode, echo_regex()).await?;
            Ok(())
        }
        .boxed()
    }
}

pub struct ResetPrinter {
    pub connect_id: Option<u32>,
}

impl Command for ResetPrinter {
    fn name(&self) -> &'static str {
        "reset_printer"
    }
    fn connect_command_id(&self) -> Option<u32> {
        self.connect_id
    }
    fn run<'a>(&'a self, model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            model.transport.blip_dtr().await.map_err(|e| CommandError(e.to_string()))
        }
        .boxed()
    }
}

pub struct SetReady {
    pub connect_id: Option<u32>,
}

impl Command for SetReady {
    fn name(&self) -> &'static str {
        "set_ready"
    }
    fn connect_command_id(&self) -> Option<u32> {
        self.connect_id
    }
    fn run<'a>(&'a self, model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            model.state.expect_change(StateChange::new().to(State::Ready, Source::Connect));
            try_until_state(model, "M602", &[State::Ready]).await
        }
        .boxed()
    }
}

pub struct CancelReady {
    pub connect_id: Option<u32>,
}

impl Command for CancelReady {
    fn name(&self) -> &'static str {
        "cancel_ready"
    }
    fn connect_command_id(&self) -> Option<u32> {
        self.connect_id
    }
    fn run<'a>(&'a self, model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            model.state.expect_change(StateChange::new().to(State::Idle, Source::Connect));
            try_until_state(model, "M603", &[State::Idle]).await
        }
        .boxed()
    }
}

pub struct LoadFilament {
    pub connect_id: Option<u32>,
}

impl Command for LoadFilament {
    fn name(&self) -> &'static str {
        "load_filament"
    }
    fn connect_command_id(&self) -> Option<u32> {
        self.connect_id
    }
    fn run<'a>(&'a self, model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            send_and_check_rejection(model, "M701", echo_regex()).await?;
            Ok(())
        }
        .boxed()
    }
}

pub struct UnloadFilament {
    pub connect_id: Option<u32>,
}

impl Command for UnloadFilament {
    fn name(&self) -> &'static str {
        "unload_filament"
    }
    fn connect_command_id(&self) -> Option<u32> {
        self.connect_id
    }
    fn run<'a>(&'a self, model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            send_and_check_rejection(model, "M702", echo_regex()).await?;
            Ok(())
        }
        .boxed()
    }
}

pub struct JobInfoCommand {
    pub connect_id: Option<u32>,
}

impl Command for JobInfoCommand {
    fn name(&self) -> &'static str {
        "job_info"
    }
    fn connect_command_id(&self) -> Option<u32> {
        self.connect_id
    }
    fn run<'a>(&'a self, model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            let _ = model.job.get_job_info(true);
            Ok(())
        }
        .boxed()
    }
}

pub struct DisableResets {
    pub connect_id: Option<u32>,
}

impl Command for DisableResets {
    fn name(&self) -> &'static str {
        "disable_resets"
    }
    fn connect_command_id(&self) -> Option<u32> {
        self.connect_id
    }
    fn run<'a>(&'a self, model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            model.transport.set_dtr_resets(false);
            Ok(())
        }
        .boxed()
    }
}

pub struct EnableResets {
    pub connect_id: Option<u32>,
}

impl Command for EnableResets {
    fn name(&self) -> &'static str {
        "enable_resets"
    }
    fn connect_command_id(&self) -> Option<u32> {
        self.connect_id
    }
    fn run<'a>(&'a self, model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            model.transport.set_dtr_resets(true);
            Ok(())
        }
        .boxed()
    }
}

pub struct PprRecovery {
    pub connect_id: Option<u32>,
}

impl Command for PprRecovery {
    fn name(&self) -> &'static str {
        "pp_recovery"
    }
    fn connect_command_id(&self) -> Option<u32> {
        self.connect_id
    }
    fn run<'a>(&'a self, model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            model.job.set_recovering_from_power_panic(true);
            model.state.expect_change(StateChange::new().to(State::Printing, Source::Connect));
            model.file_printer.recover_from_power_panic().await.map_err(CommandError)?;
            wait_for_state(model, &[State::Printing]).await
        }
        .boxed()
    }
}

pub struct RePrint {
    pub connect_id: Option<u32>,
}

impl Command for RePrint {
    fn name(&self) -> &'static str {
        "re_print"
    }
    fn connect_command_id(&self) -> Option<u32> {
        self.connect_id
    }
    fn run<'a>(&'a self, model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            let info = model.job.get_job_info(false);
            let path = info.path.ok_or_else(|| CommandError("no previous job path to re-print".to_string()))?;
            model.state.expect_change(StateChange::new().to(State::Printing, Source::Connect));
            model.file_printer.start(&path).await.map_err(CommandError)?;
            wait_for_state(model, &[State::Printing]).await
        }
        .boxed()
    }
}

pub struct UpgradeLink {
    pub connect_id: Option<u32>,
}

impl Command for UpgradeLink {
    fn name(&self) -> &'static str {
        "upgrade_link"
    }
    fn connect_command_id(&self) -> Option<u32> {
        self.connect_id
    }
    fn run<'a>(&'a self, _model: &'a Model) -> BoxFuture<'a, Result<(), CommandError>> {
        async move { Err(CommandError("upgrade is handled by the out-of-scope installer, not the core".to_string())) }.boxed()
    }
}

/// Single-threaded consumer of the command queue (spec.md §4.7, §5
/// "Commands from Connect are processed strictly sequentially").
pub struct CommandRunner {
    model: Model,
    tx: mpsc::UnboundedSender<Box<dyn Command>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Box<dyn Command>>>,
}

impl CommandRunner {
    pub fn new(model: Model) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(CommandRunner {
            model,
            tx,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Accepted only when no previous command is still running — enforced
    /// by this being the sole producer-side handle consumers use.
    pub fn submit(&self, command: Box<dyn Command>) {
        let _ = self.tx.send(command);
    }

    pub async fn run(self: Arc<Self>) {
        let mut rx = self.rx.lock().await;
        while let Some(command) = rx.recv().await {
            let name = command.name();
            let connect_id = command.connect_command_id();
            info!("running command '{}' (connect_id={:?})", name, connect_id);
            let result = command.run(&self.model).await;
            self.model.state.stop_expecting_change();
            match &result {
                Ok(()) => info!("command '{}' completed", name),
                Err(e) => warn!("command '{}' failed: {}", name, e),
            }
            if let Some(id) = connect_id {
                self.model.connect.notify_command_result(id, result).await;
            }
        }
    }
}
