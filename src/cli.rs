//! Command-line flags (spec.md §6 "CLI").
//!
//! Grounded on `kimberlite-cli`'s `clap::Parser` derive usage, flattened to
//! a single daemon invocation (no subcommands) since PrusaLink only ever
//! starts one process.

use std::path::PathBuf;

use clap::Parser;

/// One `-L module=LEVEL` override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLevel {
    pub module: String,
    pub level: String,
}

fn parse_module_level(raw: &str) -> Result<ModuleLevel, String> {
    let (module, level) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected MODULE=LEVEL, got '{}'", raw))?;
    if module.is_empty() || level.is_empty() {
        return Err(format!("expected MODULE=LEVEL, got '{}'", raw));
    }
    Ok(ModuleLevel {
        module: module.to_string(),
        level: level.to_uppercase(),
    })
}

/// Supervisor daemon bridging a Prusa FDM printer's serial link to Prusa
/// Connect (spec.md §1).
#[derive(Parser, Debug)]
#[command(name = "prusa-link", author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the INI configuration file.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Stay attached to the controlling terminal instead of daemonizing.
    #[arg(long)]
    pub foreground: bool,

    /// Set the root log level to DEBUG.
    #[arg(long, conflicts_with = "info")]
    pub debug: bool,

    /// Set the root log level to INFO.
    #[arg(long, conflicts_with = "debug")]
    pub info: bool,

    /// Override the pid file path from the config file.
    #[arg(long, value_name = "PATH")]
    pub pidfile: Option<PathBuf>,

    /// Override the HTTP bind address from the config file.
    #[arg(long, value_name = "IP")]
    pub address: Option<String>,

    /// Override the serial port's TCP passthrough port, if any.
    #[arg(long = "tcp-port", value_name = "PORT")]
    pub tcp_port: Option<u16>,

    /// Override the serial device path from the config file.
    #[arg(long = "serial-port", value_name = "DEV")]
    pub serial_port: Option<String>,

    /// Per-module log level override, repeatable (e.g. `-L connect=DEBUG`).
    #[arg(short = 'L', value_name = "MODULE=LEVEL", value_parser = parse_module_level)]
    pub log_levels: Vec<ModuleLevel>,
}

impl Cli {
    /// The root log level implied by `--debug`/`--info`, if either was
    /// given.
    pub fn root_level(&self) -> Option<&'static str> {
        if self.debug {
            Some("debug")
        } else if self.info {
            Some("info")
        } else {
            None
        }
    }
}

/// Process exit codes (spec.md §6: `0` success, `1` fatal configuration or
/// startup error, `2` argument error).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    StartupError = 1,
    ArgumentError = 2,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_module_level_override() {
        let cli = Cli::parse_from(["prusa-link", "-L", "connect=debug", "-L", "serial=info"]);
        assert_eq!(
            cli.log_levels,
            vec![
                ModuleLevel { module: "connect".to_string(), level: "DEBUG".to_string() },
                ModuleLevel { module: "serial".to_string(), level: "INFO".to_string() },
            ]
        );
    }

    #[test]
    fn rejects_module_level_without_equals() {
        assert!(parse_module_level("connect").is_err());
    }

    #[test]
    fn debug_and_info_conflict() {
        let result = Cli::try_parse_from(["prusa-link", "--debug", "--info"]);
        assert!(result.is_err());
    }

    #[test]
    fn root_level_reflects_debug_flag() {
        let cli = Cli::parse_from(["prusa-link", "--debug"]);
        assert_eq!(cli.root_level(), Some("debug"));
    }
}
