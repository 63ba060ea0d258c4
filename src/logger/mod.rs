// Import local time formatting tools from chrono
use chrono::Local;

// Set the global log level (e.g., Debug, Info, Warn, Error)
use log::LevelFilter;

// Set up the dispatch builder for combining logger outputs
use fern::Dispatch;
use fern::colors::{Color, ColoredLevelConfig};

// JSON handling for structured file output
use serde_json::Value as JsonValue;

// Standard I/O and filesystem operations (stdout, file creation)
use std::{fs, io};

// Used to initialize a static value only once in a thread-safe way
use std::sync::OnceLock;

use crate::config::LoggerConfig;

/// A simple Logger struct that wraps logging functions.
/// Clonable to allow use across multiple threads/tasks.
#[derive(Clone, Debug, Default)]
pub struct Logger;

impl Logger {
    /// Logs a message at DEBUG level
    pub fn debug(&self, msg: &str) {
        log::debug!("{}", msg);
    }

    /// Logs a message at INFO level
    pub fn info(&self, msg: &str) {
        log::info!("{}", msg);
    }

    /// Logs a message at WARN level
    pub fn warn(&self, msg: &str) {
        log::warn!("{}", msg);
    }

    /// Logs a message at ERROR level
    pub fn error(&self, msg: &str) {
        log::error!("{}", msg);
    }
}

/// Static global LOGGER instance, initialized once
static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Path of the log file for `name` inside `dir` (dots in the name become underscores).
pub fn log_file_path(dir: &str, name: &str) -> String {
    let file = format!("{}.log", name.replace('.', "_"));
    if dir.is_empty() {
        file
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), file)
    }
}

/// Build the JSON envelope written to the file branch when `enable_json_log` is set.
/// A message that is itself JSON is embedded as an object, anything else as a string.
pub fn json_envelope(timestamp: String, name: &str, level: log::Level, raw: &str) -> JsonValue {
    let message: JsonValue =
        serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_string()));
    serde_json::json!({
        "timestamp": timestamp,
        "name":      name,
        "level":     level.to_string(),
        "message":   message,
    })
}

/// Initialize the global logger exactly once, according to the provided settings.
/// After this call, all `log::` macros (and `Logger` methods) go through the
/// configured fern dispatcher. Later calls return the existing handle.
pub fn init_logger(name: &str, cfg: &LoggerConfig) -> Logger {
    LOGGER
        .get_or_init(|| {
            // 1) Parse the configured level, defaulting to Info
            let level = cfg.log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);

            // 2) Base dispatch with the global minimum level
            let mut base = Dispatch::new().level(level);

            // 3) Console branch: timestamp, name, colored level, message
            if cfg.enable_console_log {
                let nm = name.to_string();
                let datefmt = cfg.date_format.clone();
                let colors = ColoredLevelConfig::new()
                    .info(Color::Green)
                    .warn(Color::Yellow)
                    .error(Color::Red)
                    .debug(Color::Blue)
                    .trace(Color::Magenta);

                base = base.chain(
                    Dispatch::new()
                        .format(move |out, message, record| {
                            out.finish(format_args!(
                                "\x1b[92m{}\x1b[0m - \x1b[94m{}\x1b[0m - {} - {}",
                                Local::now().format(&datefmt),
                                nm,
                                colors.color(record.level()),
                                message
                            ))
                        })
                        .chain(io::stdout()),
                );
            }

            // 4) File branch: plain text or JSON envelope per line
            if cfg.enable_file_log {
                if !cfg.log_file_path.is_empty() {
                    let _ = fs::create_dir_all(&cfg.log_file_path);
                }

                let nm = name.to_string();
                let datefmt = cfg.date_format.clone();
                let enable_json = cfg.enable_json_log;
                let filepath = log_file_path(&cfg.log_file_path, name);

                // Don't panic if the file can't be opened: fall back to a sink
                let file_output: Box<dyn io::Write + Send> = match fern::log_file(&filepath) {
                    Ok(fh) => Box::new(fh),
                    Err(err) => {
                        eprintln!("Warning: could not open log file {}: {}", filepath, err);
                        Box::new(io::sink())
                    }
                };

                base = base.chain(
                    Dispatch::new()
                        .format(move |out, message, record| {
                            let timestamp = Local::now().format(&datefmt).to_string();
                            if enable_json {
                                let envelope =
                                    json_envelope(timestamp, &nm, record.level(), &message.to_string());
                                out.finish(format_args!("{}", envelope))
                            } else {
                                out.finish(format_args!(
                                    "{} - {} - {} - {}",
                                    timestamp,
                                    nm,
                                    record.level(),
                                    message
                                ))
                            }
                        })
                        .chain(file_output),
                );
            }

            // 5) Apply as the global logger. Another logger may already be
            //    installed (e.g. by a test harness); keep going without ours.
            if let Err(e) = base.apply() {
                eprintln!("Warning: logger already initialized: {}", e);
            }

            Logger
        })
        .clone()
}
