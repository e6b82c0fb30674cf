//! Configuration module for the ventilator console
//!
//! The console reads a single TOML file:
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyACM0"
//! baud_rate = 115200
//!
//! [poll]
//! interval_ms = 60
//! max_consecutive_failures = 50
//!
//! [alarm]
//! actuator = "gpio"
//! gpio_pin = 22
//!
//! [defaults]
//! mode = "ContinuousMandatory"
//! frequency = 20
//! tidal_volume = 450
//! inspiratory_pause = 0.5
//! ie_ratio_denominator = 2
//! pip_target = 20
//! ```
//!
//! Every section and key is optional. Without an explicit path the file is
//! looked up in the platform config directory under [`APP_ID`]:
//!
//! - **Linux**: `~/.config/ventilator-console/config.toml`
//! - **macOS**: `~/Library/Application Support/ventilator-console/config.toml`
//! - **Windows**: `%APPDATA%\ventilator-console\config.toml`

use crate::error::{Result, SessionError};
use crate::monitoring::alarm::{
    AlarmActuator, AlarmThresholds, GpioActuator, NullActuator, DEFAULT_BUZZER_PIN,
    DEFAULT_IE_TOLERANCE, DEFAULT_VOLUME_TOLERANCE_ML,
};
use crate::monitoring::buffer::DEFAULT_WINDOW_SECONDS;
use crate::types::Settings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "ventilator-console";

/// Config filename
pub const CONFIG_FILE: &str = "config.toml";

/// Serial port of the controller board on the bedside console
pub const DEFAULT_SERIAL_PORT: &str =
    "/dev/serial/by-id/usb-Arduino__www.arduino.cc__0042_75736303236351606110-if00";

/// Controller baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Bounded read timeout for one telemetry line
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

/// Delay between opening the port and the first write; the board resets on open
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 1000;

/// Pacing between polls required by the controller
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 60;

/// Replies discarded after start while the link synchronizes
pub const DEFAULT_WARMUP_REPLIES: u32 = 2;

/// Link failures in a row before the device is considered lost
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 50;

/// Get the config directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Get the path to the default config file
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Console Config ====================

/// Complete console configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ConsoleConfig {
    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub alarm: AlarmConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Settings used when the operator does not override them
    #[serde(default)]
    pub defaults: Settings,
}

impl ConsoleConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load config from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        toml::from_str(&content).map_err(|e| {
            SessionError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })
    }

    /// Load from the given path, or the default location, falling back to defaults
    ///
    /// An explicit path that fails to load is an error; a missing default file
    /// is not.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path).or_else(|e| {
                tracing::warn!("Failed to load config, using defaults: {}", e);
                Ok(Self::default())
            }),
            _ => Ok(Self::default()),
        }
    }

    /// Save config as TOML, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SessionError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| SessionError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            SessionError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }
}

// ==================== Serial Config ====================

/// Serial link to the controller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path
    pub port: String,

    /// Baud rate
    pub baud_rate: u32,

    /// Read timeout in milliseconds
    pub read_timeout_ms: u64,

    /// Wait after opening before the first write, in milliseconds
    pub settle_delay_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERIAL_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

// ==================== Poll Config ====================

/// Background poll loop pacing and limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollConfig {
    /// Sleep before each poll, in milliseconds
    pub interval_ms: u64,

    /// Replies discarded after start
    pub warmup_replies: u32,

    /// Link failures in a row before giving up (0 = never)
    pub max_consecutive_failures: u32,

    /// How often statistics are published, in milliseconds
    pub stats_interval_ms: u64,

    /// Capacity of the notification channel
    pub channel_capacity: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            warmup_replies: DEFAULT_WARMUP_REPLIES,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            stats_interval_ms: 500,
            channel_capacity: 1024,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

// ==================== Buffer Config ====================

/// Waveform buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    /// Display window in seconds
    pub window_seconds: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            window_seconds: DEFAULT_WINDOW_SECONDS,
        }
    }
}

// ==================== Alarm Config ====================

/// Which alarm output to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorKind {
    /// Buzzer on a GPIO line
    #[default]
    Gpio,
    /// No physical output
    None,
}

impl std::fmt::Display for ActuatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActuatorKind::Gpio => write!(f, "GPIO"),
            ActuatorKind::None => write!(f, "None"),
        }
    }
}

/// Alarm thresholds and output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlarmConfig {
    /// Allowed tidal volume deviation in mL
    pub volume_tolerance_ml: f64,

    /// Allowed I:E deviation
    pub ie_tolerance: f64,

    /// Output kind
    pub actuator: ActuatorKind,

    /// BCM GPIO pin of the buzzer
    pub gpio_pin: u32,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            volume_tolerance_ml: DEFAULT_VOLUME_TOLERANCE_ML,
            ie_tolerance: DEFAULT_IE_TOLERANCE,
            actuator: ActuatorKind::default(),
            gpio_pin: DEFAULT_BUZZER_PIN,
        }
    }
}

impl AlarmConfig {
    pub fn thresholds(&self) -> AlarmThresholds {
        AlarmThresholds {
            volume_tolerance_ml: self.volume_tolerance_ml,
            ie_tolerance: self.ie_tolerance,
        }
    }

    /// Open the configured alarm output
    pub fn open_actuator(&self) -> Result<Box<dyn AlarmActuator>> {
        match self.actuator {
            ActuatorKind::Gpio => Ok(Box::new(GpioActuator::open(self.gpio_pin)?)),
            ActuatorKind::None => Ok(Box::new(NullActuator::new())),
        }
    }
}

// ==================== Logging Config ====================

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG`
    pub filter: String,

    /// Directory for daily rolling log files (none = stderr only)
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,ventilator_console=debug".to_string(),
            log_dir: None,
        }
    }
}

// ==================== Tests ====================
