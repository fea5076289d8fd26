//! Logging backend for the engine and daemon
//!
//! Everything in the crate logs through the `log` facade. The daemon installs a
//! `flexi_logger` backend here with one of three line formats:
//!
//! - `text`: `2025-07-27 10:11:12.345 INF message`
//! - `ext`:  `2025-07-27 10:11:12.345 INF message (streams/connection.rs:88)`
//! - `json`: one compact JSON object per line

use crate::core::config::LogSettings;
use std::sync::{Mutex, OnceLock};

// The handle must outlive the program or buffered file output is lost
static LOGGER_HANDLE: OnceLock<Mutex<flexi_logger::LoggerHandle>> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log specification '{spec}': {cause}")]
    InvalidSpec { spec: String, cause: String },

    #[error("Log file '{path}' is not usable: {cause}")]
    InvalidFile { path: String, cause: String },

    #[error("Logger could not be started: {0}")]
    StartFailed(String),
}

/// Install the global logger
///
/// May only succeed once per process; later calls return `StartFailed`.
pub fn init_logging(settings: &LogSettings, color_enabled: bool) -> Result<(), LoggingError> {
    use flexi_logger::{FileSpec, Logger};

    let level = settings.level.as_deref().unwrap_or("info");
    let mut logger = Logger::try_with_str(level).map_err(|e| LoggingError::InvalidSpec {
        spec: level.to_string(),
        cause: e.to_string(),
    })?;

    logger = match (settings.format.as_deref().unwrap_or("text"), color_enabled) {
        ("json", _) => logger.format(json_format),
        ("ext", true) => logger.format(extended_color_format),
        ("ext", false) => logger.format(extended_format),
        (_, true) => logger.format(simple_color_format),
        (_, false) => logger.format(simple_format),
    };

    if let Some(file_path) = settings.file.as_deref() {
        let file_spec =
            FileSpec::try_from(std::path::Path::new(file_path)).map_err(|e| {
                LoggingError::InvalidFile {
                    path: file_path.to_string(),
                    cause: e.to_string(),
                }
            })?;
        logger = logger.log_to_file(file_spec);
    }

    let handle = logger
        .start()
        .map_err(|e| LoggingError::StartFailed(e.to_string()))?;
    let _ = LOGGER_HANDLE.set(Mutex::new(handle));

    Ok(())
}

fn level_abbr(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "ERR",
        log::Level::Warn => "WRN",
        log::Level::Info => "INF",
        log::Level::Debug => "DBG",
        log::Level::Trace => "TRC",
    }
}

fn level_colored(level: log::Level) -> colored::ColoredString {
    use colored::*;

    match level {
        log::Level::Error => "ERR".red().bold(),
        log::Level::Warn => "WRN".yellow(),
        log::Level::Info => "INF".green(),
        log::Level::Debug => "DBG".blue(),
        log::Level::Trace => "TRC".magenta(),
    }
}

fn simple_format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> Result<(), std::io::Error> {
    write!(
        w,
        "{} {} {}",
        now.format("%Y-%m-%d %H:%M:%S%.3f"),
        level_abbr(record.level()),
        record.args()
    )
}

fn simple_color_format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> Result<(), std::io::Error> {
    use colored::*;

    write!(
        w,
        "{} {} {}",
        now.format("%Y-%m-%d %H:%M:%S%.3f").to_string().dimmed(),
        level_colored(record.level()),
        record.args()
    )
}

fn extended_format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> Result<(), std::io::Error> {
    write!(
        w,
        "{} {} {} ({})",
        now.format("%Y-%m-%d %H:%M:%S%.3f"),
        level_abbr(record.level()),
        record.args(),
        format_target_as_path(record.target(), record.line())
    )
}

fn extended_color_format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> Result<(), std::io::Error> {
    use colored::*;

    write!(
        w,
        "{} {} {} ({})",
        now.format("%Y-%m-%d %H:%M:%S%.3f").to_string().dimmed(),
        level_colored(record.level()),
        record.args(),
        format_target_as_path(record.target(), record.line()).dimmed()
    )
}

fn json_format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> Result<(), std::io::Error> {
    use serde_json::{json, to_string};

    let json_obj = json!({
        "timestamp": now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": level_abbr(record.level()),
        "message": record.args().to_string(),
        "target": format_target_as_path(record.target(), record.line())
    });

    match to_string(&json_obj) {
        Ok(json_string) => w.write_all(json_string.as_bytes()),
        Err(_) => w.write_all(b"{\"error\":\"Failed to serialize log message\"}"),
    }
}

// streamgate::streams::retry -> streams/retry.rs:42
fn format_target_as_path(target: &str, line: Option<u32>) -> String {
    let path_like = match target.strip_prefix("streamgate::") {
        Some(without_prefix) => without_prefix.replace("::", "/") + ".rs",
        None => target.replace("::", "/"),
    };

    match line {
        Some(line_num) => format!("{}:{}", path_like, line_num),
        None => path_like,
    }
}
