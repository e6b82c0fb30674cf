//! # Ventilator Console
//!
//! Communication and monitoring core for a mechanical ventilator console. The
//! console drives a microcontroller-based ventilator over a serial link,
//! polls it for telemetry, derives clinical metrics, raises a latching alarm
//! and keeps a rolling waveform window for display.
//!
//! ## Architecture
//!
//! - **Protocol**: line-oriented ASCII commands and 9-field telemetry records
//! - **Device**: session state machine plus a background poll thread
//! - **Monitoring**: derived metrics, alarm evaluation and the waveform buffer
//! - **Communication**: crossbeam channels between the poll thread and the UI
//!
//! ## Configuration
//!
//! Settings are read from `config.toml` in the platform config directory
//! under `ventilator-console`, see [`config`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ventilator_console::{ConsoleConfig, ConsoleMessage, SimulatedConnector, VentilatorConsole};
//! use ventilator_console::monitoring::NullActuator;
//! use ventilator_console::types::Settings;
//!
//! let (mut console, monitor) = VentilatorConsole::new(
//!     ConsoleConfig::default(),
//!     Arc::new(SimulatedConnector::new()),
//!     Box::new(NullActuator::new()),
//! );
//! console.start(Settings::default())?;
//!
//! while let Some(msg) = monitor.recv_timeout(Duration::from_secs(1)) {
//!     if let ConsoleMessage::Telemetry(event) = msg {
//!         if event.alarm_latched {
//!             console.reset_alarm()?;
//!         }
//!     }
//! }
//! # Ok::<(), ventilator_console::SessionError>(())
//! ```

pub mod clinical;
pub mod config;
pub mod device;
pub mod error;
pub mod monitoring;
pub mod protocol;
pub mod types;

// Re-export commonly used types
pub use config::ConsoleConfig;
pub use device::{
    ConsoleMessage, MonitorReceiver, SerialPortConnector, SimulatedConnector, VentilatorConsole,
};
pub use error::{DecodeError, Result, SessionError};
pub use types::{
    AlarmVerdict, DerivedSample, FaultCode, Settings, TelemetryEvent, TelemetryRecord,
    VentilationMode,
};
