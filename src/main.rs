use std::process::ExitCode as ProcessExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use prusalinkd::cli::{Cli, ExitCode};
use prusalinkd::commands::CommandRunner;
use prusalinkd::config::{self, Config, ConfigLoader};
use prusalinkd::connect::ConnectClient;
use prusalinkd::dispatcher::LineDispatcher;
use prusalinkd::file_printer::FilePrinter;
use prusalinkd::job::{run_job_tracker_bridge, JobTracker};
use prusalinkd::lcd::LcdPrinter;
use prusalinkd::model::Model;
use prusalinkd::planner_fed::IsPlannerFed;
use prusalinkd::polling::PrinterPolling;
use prusalinkd::queue::SerialQueue;
use prusalinkd::state::StateManager;
use prusalinkd::telemetry::{TelemetryGatherer, TelemetryPasser};
use prusalinkd::transport::SerialTransport;
use prusalinkd::updater::ItemUpdater;

const ITEM_UPDATER_PERIOD: Duration = Duration::from_secs(1);

/// Mirrors the teacher's `#[launch] fn rocket()` logging setup (registry +
/// `EnvFilter` + `fmt::layer`), extended with `tracing-log` so the
/// `log::info!`/etc. calls used throughout this crate (the teacher's own
/// style) land in the same subscriber instead of going nowhere now that
/// there's no web framework bridging them implicitly.
fn init_logging(cli: &Cli, config: &Config) {
    let _ = tracing_log::LogTracer::init();
    let root = cli.root_level().unwrap_or("info");
    let mut directives = vec![format!("{}={}", env!("CARGO_CRATE_NAME"), root)];
    for (module, level) in &config.log {
        directives.push(format!("{}::{}={}", env!("CARGO_CRATE_NAME"), module, level.to_lowercase()));
    }
    for over in &cli.log_levels {
        directives.push(format!("{}::{}={}", env!("CARGO_CRATE_NAME"), over.module, over.level.to_lowercase()));
    }
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| directives.join(",").into());
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    if let Some(address) = &cli.address {
        config.http.address = address.clone();
    }
    if let Some(port) = cli.tcp_port {
        config.http.port = port;
    }
    if let Some(serial_port) = &cli.serial_port {
        config.printer.port = serial_port.clone();
    }
    if let Some(pidfile) = &cli.pidfile {
        config.daemon.pid_file = pidfile.to_string_lossy().into_owned();
    }
    Ok(config)
}

fn write_pid_file(config: &Config) -> Result<()> {
    std::fs::create_dir_all(config.data_dir_path())?;
    std::fs::write(config.pid_file_path(), std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", config.pid_file_path().display()))
}

/// Assembles every long-running component from [`Config`] and wires the
/// dispatcher/state/job/telemetry/connect/polling handlers, then runs
/// until a fatal transport or queue failure (spec.md §5 "Concurrency &
/// resource model"; SPEC_FULL.md's task inventory).
async fn run(cli: Cli, config: Config) -> Result<()> {
    write_pid_file(&config)?;

    let transport = SerialTransport::new(config.printer.port.clone(), config.printer.baudrate, false);
    let dispatcher = Arc::new(LineDispatcher::new());
    let planner_fed = Arc::new(IsPlannerFed::new(Some(config.threshold_file_path())));
    let queue = SerialQueue::new(transport.clone(), dispatcher.clone(), planner_fed.clone());
    let state = StateManager::new();
    let job = JobTracker::new(queue.clone(), Some(config.job_file_path()));
    let telemetry_passer = TelemetryPasser::new();
    let telemetry_gatherer = {
        let state_for_closure = state.clone();
        TelemetryGatherer::new(telemetry_passer.clone(), queue.clone(), Arc::new(move || state_for_closure.current()))
    };
    let lcd = Arc::new(LcdPrinter::new());
    let updater = ItemUpdater::new();
    let polling = PrinterPolling::new(queue.clone(), job.clone(), state.clone(), &updater);

    std::fs::create_dir_all(config.data_dir_path())?;
    let file_printer = FilePrinter::new(
        queue.clone(),
        telemetry_passer.clone(),
        config.data_dir_path(),
        config.power_panic_file_path(),
    );

    let connect_settings = config
        .printer
        .settings
        .as_ref()
        .map(|path| config::load_connect_settings(std::path::Path::new(path)))
        .transpose()
        .context("failed to read Connect pairing settings")?;

    let connect = match connect_settings {
        Some(settings) => Some(ConnectClient::new(
            &settings.hostname,
            settings.tls,
            settings.port,
            settings.token,
            telemetry_passer.clone(),
            lcd.clone(),
        )),
        None => {
            info!("no [printer] settings configured, Connect client disabled");
            None
        }
    };

    state.install_handlers(&dispatcher);
    telemetry_gatherer.install_handlers(&dispatcher);

    let model = Model {
        transport: transport.clone(),
        dispatcher: dispatcher.clone(),
        planner_fed,
        queue: queue.clone(),
        state: state.clone(),
        job: job.clone(),
        file_printer,
        telemetry: telemetry_passer.clone(),
        lcd: lcd.clone(),
        connect: connect.clone().unwrap_or_else(|| {
            ConnectClient::new("127.0.0.1", false, 0, "unconfigured", telemetry_passer.clone(), lcd.clone())
        }),
        updater: updater.clone(),
        polling: polling.clone(),
    };

    let runner = CommandRunner::new(model.clone());
    if let Some(connect) = &connect {
        connect.set_command_sink(connect.command_runner_sink(runner.clone())).await;
    }

    polling.spawn();

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(transport.clone().run(dispatcher.clone()));
    tasks.spawn(queue.clone().run_sender());
    tasks.spawn(queue.clone().run_stall_watchdog());
    tasks.spawn(updater.clone().run(ITEM_UPDATER_PERIOD));
    tasks.spawn(telemetry_passer.clone().run({
        let state_for_closure = state.clone();
        move || state_for_closure.current()
    }));
    tasks.spawn(telemetry_gatherer.clone().run_watchdog(tokio_util::sync::CancellationToken::new()));
    tasks.spawn(run_job_tracker_bridge(job.clone(), state.clone()));
    tasks.spawn(runner.clone().run());
    if let Some(connect) = connect {
        tasks.spawn(connect.run());
    }

    info!(
        "prusa-link ready: serial={} http={}:{}",
        config.printer.port, config.http.address, config.http.port
    );

    match tasks.join_next().await {
        Some(Ok(())) => Ok(()),
        Some(Err(join_err)) => Err(anyhow::anyhow!("a core task panicked: {join_err}")),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> ProcessExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ProcessExitCode::from(ExitCode::StartupError as u8);
        }
    };

    init_logging(&cli, &config);
    info!("prusa-link starting (foreground={})", cli.foreground);

    if let Err(e) = run(cli, config).await {
        error!("fatal startup error: {e:#}");
        return ProcessExitCode::from(ExitCode::StartupError as u8);
    }
    ProcessExitCode::from(ExitCode::Success as u8)
}
