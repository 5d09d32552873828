//! Periodic telemetry POST, event POST, command parsing from telemetry
//! responses, and reconnect with backoff (spec.md §4.11, §6 "Connect HTTP
//! protocol").
//!
//! Grounded on `original_source/prusa_link/input_output/connect_api.py`'s
//! `ConnectAPI.send_dict` request/response handling and the teacher's
//! `reqwest`-based HTTP client usage in `printer.rs`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::commands::{self, Command, CommandError, ExecuteGcode, PausePrint, ResumePrint, StartPrint, StopPrint};
use crate::lcd::{LcdPrinter, LcdStatus};
use crate::telemetry::TelemetryPasser;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum ConnectEvent {
    #[serde(rename = "INFO")]
    Info { data: Value },
    #[serde(rename = "STATE_CHANGED")]
    StateChanged {
        source: Option<String>,
        state: String,
        command_id: Option<u32>,
        reason: Option<String>,
    },
    #[serde(rename = "JOB_INFO")]
    JobInfo { data: Value },
    #[serde(rename = "MEDIUM_INSERTED")]
    MediumInserted { data: Value },
    #[serde(rename = "MEDIUM_EJECTED")]
    MediumEjected { data: Value },
    #[serde(rename = "TRANSFER_INFO")]
    TransferInfo { transfer_id: u32, data: Value },
    #[serde(rename = "TRANSFER_ABORTED")]
    TransferAborted { transfer_id: u32 },
    #[serde(rename = "TRANSFER_STOPPED")]
    TransferStopped { transfer_id: u32 },
    #[serde(rename = "TRANSFER_FINISHED")]
    TransferFinished { transfer_id: u32 },
    #[serde(rename = "ACCEPTED")]
    Accepted { command_id: u32 },
    #[serde(rename = "REJECTED")]
    Rejected { command_id: u32, reason: String },
    #[serde(rename = "FINISHED")]
    Finished { command_id: u32 },
    #[serde(rename = "FAILED")]
    Failed { command_id: u32, reason: String },
}

/// `POST /p/telemetry`/`POST /p/events` response's command payload
/// (spec.md §6).
#[derive(Debug, Clone)]
struct IncomingCommand {
    command_id: u32,
    command: String,
    args: Option<Value>,
    gcode: Option<String>,
    force: bool,
}

fn build_base_url(hostname: &str, tls: bool, port: u16) -> String {
    let scheme = if tls { "https" } else { "http" };
    let effective_port = if port == 0 {
        if tls {
            443
        } else {
            80
        }
    } else {
        port
    };
    let default_port = if tls { 443 } else { 80 };
    if effective_port == default_port {
        format!("{}://{}", scheme, hostname)
    } else {
        format!("{}://{}:{}", scheme, hostname, effective_port)
    }
}

fn now_unix_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// A command completion the runner reports back through
/// [`ConnectClient::notify_command_result`].
pub struct ConnectClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    telemetry: Arc<TelemetryPasser>,
    lcd: Arc<LcdPrinter>,
    command_sink: AsyncMutex<Option<Arc<dyn Fn(Box<dyn Command>) + Send + Sync>>>,
    pending_events: Mutex<Vec<ConnectEvent>>,
    backoff: AtomicU64,
    cancel: CancellationToken,
    /// Subscribed once at construction, so every flush the passer sends is
    /// observed exactly once instead of only the ones that happen to land
    /// inside a freshly-`subscribe`d, single-`try_recv` window.
    telemetry_rx: Mutex<broadcast::Receiver<serde_json::Map<String, Value>>>,
}

impl ConnectClient {
    pub fn new(hostname: &str, tls: bool, port: u16, token: impl Into<String>, telemetry: Arc<TelemetryPasser>, lcd: Arc<LcdPrinter>) -> Arc<Self> {
        let telemetry_rx = Mutex::new(telemetry.subscribe());
        Arc::new(ConnectClient {
            http: reqwest::Client::new(),
            base_url: build_base_url(hostname, tls, port),
            token: token.into(),
            telemetry,
            lcd,
            command_sink: AsyncMutex::new(None),
            pending_events: Mutex::new(Vec::new()),
            backoff: AtomicU64::new(MIN_BACKOFF.as_millis() as u64),
            cancel: CancellationToken::new(),
            telemetry_rx,
        })
    }

    pub async fn set_command_sink(&self, sink: Arc<dyn Fn(Box<dyn Command>) + Send + Sync>) {
        *self.command_sink.lock().await = Some(sink);
    }

    pub fn queue_event(&self, event: ConnectEvent) {
        self.pending_events.lock().unwrap().push(event);
    }

    fn auth_headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("Printer-Token", self.token.parse().unwrap());
        headers.insert("Timestamp", now_unix_seconds().to_string().parse().unwrap());
        headers
    }

    fn record_success(&self) {
        self.backoff.store(MIN_BACKOFF.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self) {
        let current = self.backoff.load(Ordering::SeqCst);
        let next = (current * 2).min(MAX_BACKOFF.as_millis() as u64);
        self.backoff.store(next, Ordering::SeqCst);
    }

    async fn handle_status(&self, status: reqwest::StatusCode) {
        match status.as_u16() {
            400 => self.lcd.set_status(LcdStatus::ConnectError("bad request".to_string())),
            401 => self.lcd.set_status(LcdStatus::ConnectError("unauthorized".to_string())),
            403 => self.lcd.set_status(LcdStatus::ConnectError("forbidden".to_string())),
            503 => self.lcd.set_status(LcdStatus::ConnectError("service unavailable".to_string())),
            _ => {}
        }
    }

    fn parse_incoming_command(&self, command_id: u32, content_type: &str, body: &[u8]) -> Option<IncomingCommand> {
        if content_type.contains("application/json") {
            let parsed: Value = serde_json::from_slice(body).ok()?;
            let command = parsed.get("command")?.as_str()?.to_string();
            let args = parsed.get("args").cloned();
            Some(IncomingCommand {
                command_id,
                command,
                args,
                gcode: None,
                force: false,
            })
        } else if content_type.contains("text/x.gcode") {
            let gcode = String::from_utf8_lossy(body).into_owned();
            Some(IncomingCommand {
                command_id,
                command: "send_gcode".to_string(),
                args: None,
                gcode: Some(gcode),
                force: false,
            })
        } else {
            None
        }
    }

    fn to_command(&self, incoming: IncomingCommand) -> Option<Box<dyn Command>> {
        let id = Some(incoming.command_id);
        match incoming.command.as_str() {
            "start_print" => {
                let path = incoming
                    .args
                    .as_ref()
                    .and_then(|a| a.get("path"))
                    .and_then(|p| p.as_str())
                    .unwrap_or_default()
                    .to_string();
                Some(Box::new(StartPrint { connect_id: id, path }))
            }
            "stop_print" | "cancel" => Some(Box::new(StopPrint { connect_id: id })),
            "pause_print" => Some(Box::new(PausePrint { connect_id: id })),
            "resume_print" => Some(Box::new(ResumePrint { connect_id: id })),
            "send_gcode" => Some(Box::new(ExecuteGcode {
                connect_id: id,
                gcode: incoming.gcode.unwrap_or_default(),
            })),
            other => {
                warn!("unrecognized Connect command '{}'", other);
                None
            }
        }
    }

    /// Handles one `200` response carrying `Command-Id`: dispatches the
    /// parsed command to the runner's sink, enforcing one-at-a-time via
    /// the runner's own sequential consumption (spec.md §4.11).
    async fn accept_response_command(&self, command_id: u32, content_type: &str, body: &[u8], force: bool) {
        let Some(mut incoming) = self.parse_incoming_command(command_id, content_type, body) else {
            warn!("could not parse incoming command body for id {}", command_id);
            return;
        };
        incoming.force = force;
        if let Some(command) = self.to_command(incoming) {
            self.queue_event(ConnectEvent::Accepted { command_id });
            let sink = self.command_sink.lock().await.clone();
            if let Some(sink) = sink {
                sink(command);
            }
        } else {
            self.queue_event(ConnectEvent::Rejected {
                command_id,
                reason: "unrecognized command".to_string(),
            });
        }
    }

    pub async fn notify_command_result(&self, command_id: u32, result: Result<(), CommandError>) {
        match result {
            Ok(()) => self.queue_event(ConnectEvent::Finished { command_id }),
            Err(e) => self.queue_event(ConnectEvent::Failed {
                command_id,
                reason: e.0,
            }),
        }
    }

    /// Drains everything currently buffered on the persistent receiver and
    /// keeps only the most recent batch — only the latest snapshot matters
    /// for a periodic POST, and draining avoids ever observing `Lagged`
    /// from a full channel.
    async fn post_telemetry_once(&self) {
        let batch = {
            let mut rx = self.telemetry_rx.lock().unwrap();
            let mut latest = None;
            loop {
                match rx.try_recv() {
                    Ok(batch) => latest = Some(batch),
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            latest
        };
        let Some(batch) = batch else {
            return;
        };
        if batch.is_empty() {
            return;
        }
        let url = format!("{}/p/telemetry", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.auth_headers())
            .json(&Value::Object(batch))
            .send()
            .await;
        match response {
            Ok(resp) => {
                self.record_success();
                let status = resp.status();
                if status.as_u16() == 200 {
                    let command_id: Option<u32> = resp
                        .headers()
                        .get("Command-Id")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse().ok());
                    let force = resp.headers().contains_key("Force");
                    let content_type = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    if let (Some(id), Ok(body)) = (command_id, resp.bytes().await) {
                        self.accept_response_command(id, &content_type, &body, force).await;
                    }
                } else {
                    self.handle_status(status).await;
                }
            }
            Err(e) => {
                debug!("telemetry POST failed: {}", e);
                self.record_failure();
            }
        }
    }

    async fn post_events_once(&self) {
        let events: Vec<ConnectEvent> = std::mem::take(&mut *self.pending_events.lock().unwrap());
        if events.is_empty() {
            return;
        }
        let url = format!("{}/p/events", self.base_url);
        for event in events {
            let response = self.http.post(&url).headers(self.auth_headers()).json(&event).send().await;
            match response {
                Ok(resp) => {
                    self.record_success();
                    self.handle_status(resp.status()).await;
                }
                Err(e) => {
                    warn!("event POST failed, dropping: {}", e);
                    self.record_failure();
                }
            }
        }
    }

    /// Telemetry tick + event POST loop with exponential backoff on
    /// transient failures (spec.md §4.11).
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            self.telemetry.set_queue_depth(self.pending_events.lock().unwrap().len());
            self.post_telemetry_once().await;
            self.post_events_once().await;
            let backoff = Duration::from_millis(self.backoff.load(Ordering::SeqCst));
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn command_runner_sink(self: &Arc<Self>, runner: Arc<commands::CommandRunner>) -> Arc<dyn Fn(Box<dyn Command>) + Send + Sync> {
        Arc::new(move |command| runner.submit(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_omits_default_port() {
        assert_eq!(build_base_url("connect.prusa3d.com", true, 0), "https://connect.prusa3d.com");
        assert_eq!(build_base_url("10.0.0.5", false, 0), "http://10.0.0.5");
    }

    #[test]
    fn base_url_includes_nonstandard_port() {
        assert_eq!(build_base_url("localhost", false, 8888), "http://localhost:8888");
    }
}
