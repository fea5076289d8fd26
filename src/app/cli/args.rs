//! Daemon command-line arguments
//!
//! Flags here override the matching values of the configuration file. Only
//! logging and output settings are exposed; everything else lives in TOML.

use crate::core::config::{DaemonConfig, LogSettings};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "streamgate")]
#[command(about = "Durable event-stream consumer daemon")]
#[command(version)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config-file", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Log level
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL", value_parser = ["trace", "debug", "info", "warn", "error", "off"])]
    pub log_level: Option<String>,

    /// Log file path (use 'none' to log to stderr)
    #[arg(short = 'f', long = "log-file", value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(short = 'o', long = "log-format", value_name = "FORMAT", value_parser = ["text", "ext", "json"])]
    pub log_format: Option<String>,

    /// Force colored output
    #[arg(long = "color", conflicts_with = "no_color")]
    pub color: bool,

    /// Disable colored output
    #[arg(long = "no-color", conflicts_with = "color")]
    pub no_color: bool,

    /// Validate the configuration and exit
    #[arg(long = "check")]
    pub check: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long = "print-config", conflicts_with = "check")]
    pub print_config: bool,
}

impl Args {
    /// Logging settings from the command line alone
    pub fn log_settings(&self) -> LogSettings {
        self.overlay_logging(&LogSettings::default())
    }

    /// Command-line logging flags layered over the configured ones
    pub fn overlay_logging(&self, configured: &LogSettings) -> LogSettings {
        let file = match self.log_file.as_deref() {
            Some(path) if path.as_os_str() == "none" => None,
            Some(path) => Some(path.display().to_string()),
            None => configured.file.clone(),
        };
        LogSettings {
            level: self.log_level.clone().or_else(|| configured.level.clone()),
            format: self.log_format.clone().or_else(|| configured.format.clone()),
            file,
        }
    }

    /// Apply command-line overrides to a loaded configuration
    pub fn apply_to(&self, config: &mut DaemonConfig) {
        config.logging = self.overlay_logging(&config.logging);
    }

    /// Whether log output should be colored
    ///
    /// Explicit flags win, then `NO_COLOR`, then whether stderr is a terminal.
    /// File output is never colored.
    pub fn use_color(&self, settings: &LogSettings) -> bool {
        if settings.file.is_some() || self.no_color {
            return false;
        }
        if self.color {
            return true;
        }
        std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal()
    }
}
