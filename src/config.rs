//! Host configuration loader (spec.md §6 "Configuration").
//!
//! Grounded on `kimberlite-config`'s `ConfigLoader` builder pattern
//! (`config::Config::builder()` + `try_deserialize`), adapted to a single
//! INI source rather than a layered TOML/env stack — PrusaLink has one
//! config file, with CLI flags layered on top by the caller after load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_data_dir() -> String {
    "/var/lib/prusa-link".to_string()
}
fn default_pid_file() -> String {
    "prusa-link.pid".to_string()
}
fn default_current_file() -> String {
    "currently_printing.gcode".to_string()
}
fn default_power_panic_file() -> String {
    "power_panic".to_string()
}
fn default_job_file() -> String {
    "job_data.json".to_string()
}
fn default_threshold_file() -> String {
    "threshold.data".to_string()
}
fn default_http_address() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_printer_port() -> String {
    "/dev/ttyAMA0".to_string()
}
fn default_baudrate() -> u32 {
    115200
}
fn default_syslog() -> String {
    "/dev/log".to_string()
}

/// `[daemon]` (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
    #[serde(default = "default_current_file")]
    pub current_file: String,
    #[serde(default = "default_power_panic_file")]
    pub power_panic_file: String,
    #[serde(default = "default_job_file")]
    pub job_file: String,
    #[serde(default = "default_threshold_file")]
    pub threshold_file: String,
    pub user: Option<String>,
    pub group: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            data_dir: default_data_dir(),
            pid_file: default_pid_file(),
            current_file: default_current_file(),
            power_panic_file: default_power_panic_file(),
            job_file: default_job_file(),
            threshold_file: default_threshold_file(),
            user: None,
            group: None,
        }
    }
}

/// `[http]` (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_address")]
    pub address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default)]
    pub link_info: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            address: default_http_address(),
            port: default_http_port(),
            link_info: false,
        }
    }
}

/// `[printer]` (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterConfig {
    #[serde(default = "default_printer_port")]
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    pub serial_file: Option<String>,
    pub settings: Option<String>,
    #[serde(default)]
    pub mountpoints: String,
    #[serde(default)]
    pub directories: String,
}

impl PrinterConfig {
    pub fn mountpoint_list(&self) -> Vec<&str> {
        self.mountpoints.split(':').filter(|s| !s.is_empty()).collect()
    }

    pub fn directory_list(&self) -> Vec<&str> {
        self.directories.split(':').filter(|s| !s.is_empty()).collect()
    }
}

impl Default for PrinterConfig {
    fn default() -> Self {
        PrinterConfig {
            port: default_printer_port(),
            baudrate: default_baudrate(),
            serial_file: None,
            settings: None,
            mountpoints: String::new(),
            directories: String::new(),
        }
    }
}

/// `[logging]` (spec.md §6). Per-module levels live under a separate
/// `[log]` section, merged in by `ConfigLoader::load` since the `config`
/// crate flattens section names into the struct's field name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_syslog")]
    pub syslog: String,
    pub format: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            syslog: default_syslog(),
            format: None,
        }
    }
}

/// Top-level config deserialized from the INI file (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub log: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            daemon: DaemonConfig::default(),
            http: HttpConfig::default(),
            printer: PrinterConfig::default(),
            logging: LoggingConfig::default(),
            log: HashMap::new(),
        }
    }
}

impl Config {
    pub fn data_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.daemon.data_dir)
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.data_dir_path().join(&self.daemon.pid_file)
    }

    pub fn current_file_path(&self) -> PathBuf {
        self.data_dir_path().join(&self.daemon.current_file)
    }

    pub fn power_panic_file_path(&self) -> PathBuf {
        self.data_dir_path().join(&self.daemon.power_panic_file)
    }

    pub fn job_file_path(&self) -> PathBuf {
        self.data_dir_path().join(&self.daemon.job_file)
    }

    pub fn threshold_file_path(&self) -> PathBuf {
        self.data_dir_path().join(&self.daemon.threshold_file)
    }
}

/// Connect pairing details (hostname/tls/port/token), read from the file
/// named by `[printer] settings` — a separate INI written by the pairing
/// flow, out of this crate's scope (spec.md §1 Non-goals).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectSettings {
    pub hostname: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub port: u16,
    pub token: String,
}

pub fn load_connect_settings(path: &Path) -> Result<ConnectSettings> {
    #[derive(Deserialize)]
    struct Wrapper {
        #[serde(rename = "service::connect")]
        connect: ConnectSettings,
    }
    let built = config::Config::builder()
        .add_source(config::File::from(path.to_path_buf()).format(config::FileFormat::Ini))
        .build()
        .with_context(|| format!("failed to read printer settings at {}", path.display()))?;
    let wrapper: Wrapper = built
        .try_deserialize()
        .context("printer settings file is missing a [service::connect] section")?;
    Ok(wrapper.connect)
}

/// Loads [`Config`] from a single INI file (spec.md §6 "Configuration").
///
/// Grounded on `kimberlite-config`'s `ConfigLoader` builder, stripped down
/// to the one-source case: PrusaLink has no project/local/env layering,
/// only the file named on the command line (with a fixed fallback path
/// when the caller passes none).
pub struct ConfigLoader {
    path: PathBuf,
}

const DEFAULT_CONFIG_PATH: &str = "/etc/prusa-link/prusa-link.ini";

impl ConfigLoader {
    pub fn new() -> Self {
        ConfigLoader {
            path: PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }

    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = path.as_ref().to_path_buf();
        self
    }

    pub fn load(self) -> Result<Config> {
        let mut builder = config::Config::builder();
        builder = builder.add_source(config::Config::try_from(&Config::default())?);
        if self.path.exists() {
            builder = builder.add_source(
                config::File::from(self.path.clone())
                    .required(false)
                    .format(config::FileFormat::Ini),
            );
        } else {
            anyhow::bail!("config file {} does not exist", self.path.display());
        }
        let built = builder.build().context("failed to build configuration")?;
        built.try_deserialize().context("failed to deserialize configuration")
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn loads_defaults_when_sections_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prusa-link.ini");
        fs::write(&path, "[daemon]\ndata_dir = /tmp/prusa\n").unwrap();
        let config = ConfigLoader::new().with_path(&path).load().unwrap();
        assert_eq!(config.daemon.data_dir, "/tmp/prusa");
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.printer.baudrate, 115200);
    }

    #[test]
    fn parses_colon_separated_lists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prusa-link.ini");
        fs::write(
            &path,
            "[printer]\nmountpoints = /media/usb:/media/sd\ndirectories = /media/usb:/media/sd\n",
        )
        .unwrap();
        let config = ConfigLoader::new().with_path(&path).load().unwrap();
        assert_eq!(config.printer.mountpoint_list(), vec!["/media/usb", "/media/sd"]);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let result = ConfigLoader::new().with_path("/nonexistent/path.ini").load();
        assert!(result.is_err());
    }

    #[test]
    fn per_module_log_levels_collect_into_map() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prusa-link.ini");
        fs::write(&path, "[log]\nconnect = DEBUG\nserial = INFO\n").unwrap();
        let config = ConfigLoader::new().with_path(&path).load().unwrap();
        assert_eq!(config.log.get("connect").map(String::as_str), Some("DEBUG"));
    }

    #[test]
    fn loads_connect_settings_from_service_section() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prusa_printer_settings.ini");
        fs::write(
            &path,
            "[service::connect]\nhostname = connect.prusa3d.com\ntls = true\nport = 443\ntoken = abc123\n",
        )
        .unwrap();
        let settings = load_connect_settings(&path).unwrap();
        assert_eq!(settings.hostname, "connect.prusa3d.com");
        assert!(settings.tls);
        assert_eq!(settings.token, "abc123");
    }
}
