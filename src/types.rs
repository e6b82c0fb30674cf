//! Core data types for the ventilator console
//!
//! # Main Types
//!
//! - [`VentilationMode`] - Which breathing program the controller runs
//! - [`Settings`] - Operator-chosen parameters for the active mode
//! - [`TelemetryRecord`] - One decoded sample streamed back by the controller
//! - [`FaultCode`] - The controller's 3-character sensor fault flags
//! - [`DerivedSample`] - Clinical metrics computed from a record
//! - [`AlarmVerdict`] - Which alarm conditions a record violates
//! - [`TelemetryEvent`] - The notification delivered to the UI collaborator
//!
//! Settings are immutable once sent: changing a parameter means building a
//! new [`Settings`] value and passing it to `update`.

use crate::error::SessionError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Ventilation mode selected by the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VentilationMode {
    /// Continuous mandatory ventilation: the machine delivers every breath
    #[default]
    ContinuousMandatory,
    /// Assisted control, breaths triggered by a pressure drop
    AssistedPressure,
    /// Assisted control, breaths triggered by inspiratory flow
    AssistedFlow,
}

impl VentilationMode {
    /// Whether the trigger threshold is meaningful in this mode
    pub fn uses_trigger(&self) -> bool {
        !matches!(self, VentilationMode::ContinuousMandatory)
    }

    /// Get all modes
    pub fn all() -> &'static [VentilationMode] {
        &[
            VentilationMode::ContinuousMandatory,
            VentilationMode::AssistedPressure,
            VentilationMode::AssistedFlow,
        ]
    }
}

impl FromStr for VentilationMode {
    type Err = SessionError;

    /// Accepts the wire tags (`C`, `P`, `F`) and short names
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "c" | "cmv" | "continuous" => Ok(VentilationMode::ContinuousMandatory),
            "p" | "pressure" => Ok(VentilationMode::AssistedPressure),
            "f" | "flow" => Ok(VentilationMode::AssistedFlow),
            other => Err(SessionError::InvalidParameter(format!(
                "unknown mode {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for VentilationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VentilationMode::ContinuousMandatory => write!(f, "Continuous mandatory"),
            VentilationMode::AssistedPressure => write!(f, "Assisted (pressure trigger)"),
            VentilationMode::AssistedFlow => write!(f, "Assisted (flow trigger)"),
        }
    }
}

/// Ventilation parameters for one session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Active mode
    pub mode: VentilationMode,
    /// Breaths per minute
    pub frequency: u32,
    /// Tidal volume in mL
    pub tidal_volume: u32,
    /// Inspiratory pause as a fraction of the cycle (one decimal)
    pub inspiratory_pause: f64,
    /// Denominator of the 1:N I:E ratio
    pub ie_ratio_denominator: u32,
    /// Peak inspiratory pressure target in cm H2O
    pub pip_target: u32,
    /// Pressure (cm H2O) or flow (L/min) trigger, depending on mode
    pub trigger_threshold: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: VentilationMode::ContinuousMandatory,
            frequency: 20,
            tidal_volume: 450,
            inspiratory_pause: 0.5,
            ie_ratio_denominator: 2,
            pip_target: 20,
            trigger_threshold: -2.0,
        }
    }
}

impl Settings {
    /// Create settings for the given mode with default parameters
    pub fn new(mode: VentilationMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Set the mode
    pub fn with_mode(mut self, mode: VentilationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the breath frequency
    pub fn with_frequency(mut self, bpm: u32) -> Self {
        self.frequency = bpm;
        self
    }

    /// Set the tidal volume
    pub fn with_tidal_volume(mut self, ml: u32) -> Self {
        self.tidal_volume = ml;
        self
    }

    /// Set the inspiratory pause, rounded to one decimal
    pub fn with_inspiratory_pause(mut self, pause: f64) -> Self {
        self.inspiratory_pause = (pause * 10.0).round() / 10.0;
        self
    }

    /// Set the I:E ratio denominator
    pub fn with_ie_ratio_denominator(mut self, denominator: u32) -> Self {
        self.ie_ratio_denominator = denominator;
        self
    }

    /// Set the PIP target
    pub fn with_pip_target(mut self, cm_h2o: u32) -> Self {
        self.pip_target = cm_h2o;
        self
    }

    /// Set the trigger threshold
    pub fn with_trigger_threshold(mut self, threshold: f64) -> Self {
        self.trigger_threshold = threshold;
        self
    }

    /// Apply one `key=value` assignment, e.g. `frequency=18`
    ///
    /// Keys: `mode`, `frequency`, `tidal_volume`, `pause`, `ie`, `pip`,
    /// `trigger`.
    pub fn with_assignment(self, assignment: &str) -> Result<Self, SessionError> {
        let (key, value) = assignment
            .split_once('=')
            .map(|(k, v)| (k.trim(), v.trim()))
            .ok_or_else(|| {
                SessionError::InvalidParameter(format!("expected key=value, got {:?}", assignment))
            })?;

        fn number<T: FromStr>(key: &str, value: &str) -> Result<T, SessionError> {
            value.parse().map_err(|_| {
                SessionError::InvalidParameter(format!("{} must be a number, got {:?}", key, value))
            })
        }

        Ok(match key {
            "mode" => self.with_mode(value.parse()?),
            "frequency" => self.with_frequency(number(key, value)?),
            "tidal_volume" => self.with_tidal_volume(number(key, value)?),
            "pause" => self.with_inspiratory_pause(number(key, value)?),
            "ie" => self.with_ie_ratio_denominator(number(key, value)?),
            "pip" => self.with_pip_target(number(key, value)?),
            "trigger" => self.with_trigger_threshold(number(key, value)?),
            other => {
                return Err(SessionError::InvalidParameter(format!(
                    "unknown setting {:?}",
                    other
                )))
            }
        })
    }
}

/// Sensor fault flags reported by the controller
///
/// Each position flags one sensor: `P` pressure, `V` volume, `F` flow, `0`
/// for healthy. The text is device-defined and kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultCode(String);

/// Code sent when every sensor is healthy
pub const FAULT_CODE_CLEAR: &str = "000";

impl FaultCode {
    /// Wrap a raw code
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// The raw code as received
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the device reports no fault
    pub fn is_clear(&self) -> bool {
        self.0 == FAULT_CODE_CLEAR
    }

    fn flag_at(&self, index: usize, flag: char) -> bool {
        self.0.chars().nth(index) == Some(flag)
    }

    /// Pressure sensor fault
    pub fn pressure_fault(&self) -> bool {
        self.flag_at(0, 'P')
    }

    /// Volume measurement fault
    pub fn volume_fault(&self) -> bool {
        self.flag_at(1, 'V')
    }

    /// Flow sensor fault
    pub fn flow_fault(&self) -> bool {
        self.flag_at(2, 'F')
    }

    /// Names of the sensors flagged as faulty
    pub fn faulty_sensors(&self) -> Vec<&'static str> {
        [
            (self.pressure_fault(), "pressure"),
            (self.volume_fault(), "volume"),
            (self.flow_fault(), "flow"),
        ]
        .into_iter()
        .filter_map(|(faulty, name)| faulty.then_some(name))
        .collect()
    }
}

impl Default for FaultCode {
    fn default() -> Self {
        Self(FAULT_CODE_CLEAR.to_string())
    }
}

impl std::fmt::Display for FaultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One telemetry sample decoded from the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TelemetryRecord {
    /// Airway pressure in cm H2O
    pub pressure_cm_h2o: f64,
    /// Flow in L/min
    pub flow_lpm: f64,
    /// Delivered volume in mL
    pub volume_ml: f64,
    /// Measured breath frequency
    pub frequency_bpm: f64,
    /// Measured I:E ratio
    pub ie_ratio: f64,
    /// Peak inspiratory pressure
    pub peak_inspiratory_pressure: f64,
    /// Plateau pressure
    pub plateau_pressure: f64,
    /// Positive end-expiratory pressure
    pub peep: f64,
    /// Sensor fault flags
    pub fault_code: FaultCode,
}

/// Secondary metrics derived from one record
///
/// `None` marks a metric that is undefined for this sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct DerivedSample {
    /// Mean airway pressure in cm H2O
    pub mean_airway_pressure: Option<f64>,
    /// Static compliance in mL/cm H2O
    pub compliance_ml_per_cm_h2o: Option<f64>,
    /// Minute ventilation in L/min
    pub minute_ventilation_l_per_min: f64,
}

/// Alarm conditions violated by one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AlarmVerdict {
    pub pip_exceeded: bool,
    pub volume_low: bool,
    pub volume_deviation: bool,
    pub ie_deviation: bool,
    pub device_reported_fault: bool,
}

impl AlarmVerdict {
    /// True if any condition is violated
    pub fn any(&self) -> bool {
        self.pip_exceeded
            || self.volume_low
            || self.volume_deviation
            || self.ie_deviation
            || self.device_reported_fault
    }

    /// Names of the violated conditions, in evaluation order
    pub fn active_conditions(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.pip_exceeded {
            names.push("pip_exceeded");
        }
        if self.volume_low {
            names.push("volume_low");
        }
        if self.volume_deviation {
            names.push("volume_deviation");
        }
        if self.ie_deviation {
            names.push("ie_deviation");
        }
        if self.device_reported_fault {
            names.push("device_reported_fault");
        }
        names
    }
}

/// Notification emitted by the poll loop for every delivered sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Seconds since the session started
    pub elapsed_seconds: f64,
    /// The decoded record
    pub record: TelemetryRecord,
    /// Metrics derived from it
    pub derived: DerivedSample,
    /// Alarm conditions it violates
    pub alarm: AlarmVerdict,
    /// Whether the alarm actuator is latched on
    pub alarm_latched: bool,
}

/// Lifecycle state of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No link open
    #[default]
    Disconnected,
    /// Link open, start command not yet accepted
    Connected,
    /// Start command sent, telemetry flowing
    Active,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "Disconnected"),
            SessionState::Connected => write!(f, "Connected"),
            SessionState::Active => write!(f, "Active"),
        }
    }
}

/// Counters kept by the poll loop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Samples delivered as notifications
    pub samples_delivered: u64,
    /// Warm-up replies discarded
    pub warmup_discarded: u64,
    /// Lines with the wrong field count
    pub malformed_records: u64,
    /// Lines with an unparseable numeric field
    pub numeric_errors: u64,
    /// Read or write failures on the link
    pub io_errors: u64,
    /// Current run of link failures without a successful read
    pub consecutive_io_failures: u32,
    /// Notifications dropped because the receiver was full
    pub dropped_notifications: u64,
    /// Times the alarm latch went from idle to active
    pub alarm_activations: u64,
    /// Average line read time in microseconds
    pub avg_read_time_us: f64,
    /// Read-to-read jitter over the recent window, in microseconds
    pub read_jitter_us: u64,
    /// Share of reads that returned a line, in percent
    pub link_success_rate: f64,
}

impl SessionStats {
    /// Lines received but rejected by the decoder
    pub fn rejected_lines(&self) -> u64 {
        self.malformed_records + self.numeric_errors
    }
}
