// Serde lets us read every setting straight out of a TOML document
use serde::Deserialize;

use std::path::{Path, PathBuf};

// We need Duration to turn seconds / milliseconds into Rust time values
use std::time::Duration;

use crate::error::ConfigError;
use crate::server::frame::MIN_FRAME_BYTES;

/////////////////////////
// Framing             //
/////////////////////////

/// How raw socket bytes are cut into messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// One message per `\n`-terminated line (trailing `\r` stripped)
    #[default]
    Lines,
    /// One message per socket read, whatever the read returns
    Raw,
}

/////////////////////////
// OverflowPolicy      //
/////////////////////////

/// What to do when a recipient's outbound queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Evict the slow recipient; its session unregisters it
    #[default]
    Disconnect,
    /// Skip this message for the slow recipient only
    Drop,
}

/////////////////////////
// SinkConfig          //
/////////////////////////

/// Where relayed messages are durably appended
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkConfig {
    /// Keep entries in memory, newest first, optionally trimmed to `max_entries`
    Memory {
        #[serde(default)]
        max_entries: Option<usize>,
    },
    /// Append JSON lines to `path`
    File { path: PathBuf },
    /// Discard entries
    #[serde(rename = "none")]
    Discard,
}

/// File the relay appends to when no `[sink]` table is given
pub const DEFAULT_SINK_PATH: &str = "chat_messages.jsonl";

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::File {
            path: PathBuf::from(DEFAULT_SINK_PATH),
        }
    }
}

/////////////////////////
// LoggerConfig        //
/////////////////////////

/// Settings for the fern dispatcher built in `logger::init_logger`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Minimum level, parsed as a `log::LevelFilter` ("debug", "info", ...)
    pub log_level: String,
    /// Colored output on stdout
    pub enable_console_log: bool,
    /// Also write `<log_file_path>/<name>.log`
    pub enable_file_log: bool,
    /// Directory for the log file; empty means the working directory
    pub log_file_path: String,
    /// Emit file records as JSON envelopes instead of plain text
    pub enable_json_log: bool,
    /// chrono format string for timestamps
    pub date_format: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_console_log: true,
            enable_file_log: false,
            log_file_path: String::new(),
            enable_json_log: false,
            date_format: "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        }
    }
}

//////////////////////
// RelayConfig      //
//////////////////////

/// All the settings the relay needs. Every field has a default, so an empty
/// TOML document is a valid config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// IP or hostname to listen on
    pub host: String,

    /// Port number; 0 asks the OS for a free one
    pub port: u16,

    /// Upper bound on a single socket read and on a single frame
    pub max_frame_bytes: usize,

    /// How bytes are cut into messages
    pub framing: Framing,

    /// Seconds of silence before a client is dropped (0 disables)
    pub client_timeout_secs: u64,

    /// Milliseconds a single outbound write may take before the recipient is evicted
    pub write_timeout_ms: u64,

    /// Messages buffered per recipient before `overflow_policy` applies
    pub outbound_queue_capacity: usize,

    /// What happens when a recipient's queue is full
    pub overflow_policy: OverflowPolicy,

    /// Max messages each client can send per minute (`None` disables)
    pub rate_limit_msgs_per_minute: Option<u32>,

    /// Milliseconds to sleep after a failed accept
    pub accept_error_backoff_ms: u64,

    /// Entries buffered in front of the log sink
    pub sink_queue_capacity: usize,

    /// How many Tokio worker threads to spin up (defaults to cpu-1)
    pub worker_threads: usize,

    /// Log sink selection
    pub sink: SinkConfig,

    /// Logging settings
    pub logger: LoggerConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 12345,
            max_frame_bytes: 1024,
            framing: Framing::default(),
            client_timeout_secs: 300,
            write_timeout_ms: 5_000,
            outbound_queue_capacity: 64,
            overflow_policy: OverflowPolicy::default(),
            rate_limit_msgs_per_minute: None,
            accept_error_backoff_ms: 100,
            sink_queue_capacity: 1024,
            // Default worker threads = #cores minus one, but at least one
            worker_threads: num_cpus::get().saturating_sub(1).max(1),
            sink: SinkConfig::default(),
            logger: LoggerConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Reject settings that would make the relay unusable (zero-sized buffers
    /// cannot back a bounded channel).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_bytes < MIN_FRAME_BYTES {
            return Err(ConfigError::Invalid(format!(
                "max_frame_bytes must be at least {} (one UTF-8 character)",
                MIN_FRAME_BYTES
            )));
        }
        let checks = [
            (self.outbound_queue_capacity, "outbound_queue_capacity"),
            (self.sink_queue_capacity, "sink_queue_capacity"),
            (self.worker_threads, "worker_threads"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
            }
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid("write_timeout_ms must be greater than zero".into()));
        }
        if self.rate_limit_msgs_per_minute == Some(0) {
            return Err(ConfigError::Invalid(
                "rate_limit_msgs_per_minute must be greater than zero (omit it to disable)".into(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        Ok(())
    }

    /// "host:port" string handed to the listener
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn client_timeout(&self) -> Option<Duration> {
        (self.client_timeout_secs > 0).then(|| Duration::from_secs(self.client_timeout_secs))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn accept_error_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_error_backoff_ms)
    }
}
