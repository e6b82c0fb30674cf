//! Alarm evaluation and the alarm actuator
//!
//! [`evaluate`] is a pure check of one record against the active settings.
//! The buzzer is reached through the [`AlarmActuator`] trait so the poll loop
//! never touches GPIO state directly; [`AlarmLatch`] holds the actuator
//! active from the first violating sample until the operator resets it.
//! A good sample never clears the alarm on its own.

use crate::error::{Result, SessionError};
use crate::types::{AlarmVerdict, Settings, TelemetryRecord};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Default allowed deviation from the set tidal volume, in mL
pub const DEFAULT_VOLUME_TOLERANCE_ML: f64 = 20.0;

/// Default allowed deviation from the set I:E denominator
pub const DEFAULT_IE_TOLERANCE: f64 = 0.2;

/// BCM pin the buzzer is wired to on the console board
pub const DEFAULT_BUZZER_PIN: u32 = 22;

/// Tolerances used by [`evaluate`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlarmThresholds {
    pub volume_tolerance_ml: f64,
    pub ie_tolerance: f64,
}

impl Default for AlarmThresholds {
    fn default() -> Self {
        Self {
            volume_tolerance_ml: DEFAULT_VOLUME_TOLERANCE_ML,
            ie_tolerance: DEFAULT_IE_TOLERANCE,
        }
    }
}

/// Check a record against the active settings
///
/// Every condition is checked independently; there is no severity ranking.
pub fn evaluate(
    record: &TelemetryRecord,
    settings: &Settings,
    thresholds: &AlarmThresholds,
) -> AlarmVerdict {
    let target_volume = f64::from(settings.tidal_volume);
    AlarmVerdict {
        pip_exceeded: record.peak_inspiratory_pressure > f64::from(settings.pip_target),
        volume_low: record.volume_ml < target_volume,
        volume_deviation: (record.volume_ml - target_volume).abs() > thresholds.volume_tolerance_ml,
        ie_deviation: (record.ie_ratio - f64::from(settings.ie_ratio_denominator)).abs()
            > thresholds.ie_tolerance,
        device_reported_fault: !record.fault_code.is_clear(),
    }
}

/// Output that sounds the alarm
#[cfg_attr(test, mockall::automock)]
pub trait AlarmActuator: Send {
    /// Drive the output to its active state
    fn activate(&mut self) -> Result<()>;

    /// Drive the output to its idle state
    fn deactivate(&mut self) -> Result<()>;

    /// Whether the output is currently driven active
    fn is_active(&self) -> bool;
}

/// In-memory actuator for tests and consoles without a buzzer
#[derive(Debug, Default)]
pub struct NullActuator {
    active: bool,
}

impl NullActuator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AlarmActuator for NullActuator {
    fn activate(&mut self) -> Result<()> {
        self.active = true;
        Ok(())
    }

    fn deactivate(&mut self) -> Result<()> {
        self.active = false;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

/// Buzzer on a Linux GPIO line, driven through the sysfs interface
#[derive(Debug)]
pub struct GpioActuator {
    pin: u32,
    value_path: PathBuf,
    active: bool,
}

impl GpioActuator {
    /// Default sysfs GPIO root
    pub const SYSFS_ROOT: &'static str = "/sys/class/gpio";

    /// Export the pin and configure it as an output, initially low
    pub fn open(pin: u32) -> Result<Self> {
        Self::open_at(Path::new(Self::SYSFS_ROOT), pin)
    }

    /// Same as [`GpioActuator::open`] with a custom sysfs root
    pub fn open_at(root: &Path, pin: u32) -> Result<Self> {
        let pin_dir = root.join(format!("gpio{}", pin));
        if !pin_dir.exists() {
            fs::write(root.join("export"), pin.to_string()).map_err(|e| {
                SessionError::Actuator(format!("Failed to export GPIO {}: {}", pin, e))
            })?;
        }
        fs::write(pin_dir.join("direction"), "out").map_err(|e| {
            SessionError::Actuator(format!("Failed to set GPIO {} as output: {}", pin, e))
        })?;

        let mut actuator = Self {
            pin,
            value_path: pin_dir.join("value"),
            active: false,
        };
        actuator.write_level(false)?;
        tracing::info!("Alarm buzzer on GPIO {}", pin);
        Ok(actuator)
    }

    fn write_level(&mut self, high: bool) -> Result<()> {
        fs::write(&self.value_path, if high { "1" } else { "0" }).map_err(|e| {
            SessionError::Actuator(format!("Failed to drive GPIO {}: {}", self.pin, e))
        })?;
        self.active = high;
        Ok(())
    }
}

impl AlarmActuator for GpioActuator {
    fn activate(&mut self) -> Result<()> {
        self.write_level(true)
    }

    fn deactivate(&mut self) -> Result<()> {
        self.write_level(false)
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

struct LatchState {
    actuator: Box<dyn AlarmActuator>,
    latched: bool,
    output_driven: bool,
    activations: u64,
    last_conditions: AlarmVerdict,
}

/// What one call to [`AlarmLatch::raise`] did
#[derive(Debug, Default)]
pub struct RaiseOutcome {
    /// The latch moved from idle to active
    pub newly_latched: bool,
    /// Driving the output failed; the latch is set regardless
    pub output_error: Option<SessionError>,
}

/// Latching alarm shared by the poll thread and the operator
///
/// Cloning yields another handle to the same latch.
#[derive(Clone)]
pub struct AlarmLatch {
    state: Arc<Mutex<LatchState>>,
}

impl AlarmLatch {
    /// Wrap an actuator
    pub fn new(actuator: Box<dyn AlarmActuator>) -> Self {
        Self {
            state: Arc::new(Mutex::new(LatchState {
                actuator,
                latched: false,
                output_driven: false,
                activations: 0,
                last_conditions: AlarmVerdict::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latch the alarm if the verdict has any condition set
    ///
    /// The latch is set before the output is driven. While latched with the
    /// output still off, every violating sample retries the actuator.
    pub fn raise(&self, verdict: &AlarmVerdict) -> RaiseOutcome {
        let mut outcome = RaiseOutcome::default();
        if !verdict.any() {
            return outcome;
        }

        let mut state = self.lock();
        state.last_conditions = *verdict;
        if !state.latched {
            state.latched = true;
            state.activations += 1;
            outcome.newly_latched = true;
            tracing::warn!("Alarm raised: {}", verdict.active_conditions().join(", "));
        }

        if !state.output_driven {
            match state.actuator.activate() {
                Ok(()) => state.output_driven = true,
                Err(e) => outcome.output_error = Some(e),
            }
        }
        outcome
    }

    /// Silence the alarm (operator action)
    pub fn reset(&self) -> Result<()> {
        let mut state = self.lock();
        state.actuator.deactivate()?;
        state.output_driven = false;
        if state.latched {
            tracing::info!("Alarm reset by operator");
        }
        state.latched = false;
        state.last_conditions = AlarmVerdict::default();
        Ok(())
    }

    /// Whether the alarm is latched on
    pub fn is_latched(&self) -> bool {
        self.lock().latched
    }

    /// Number of idle-to-active transitions so far
    pub fn activations(&self) -> u64 {
        self.lock().activations
    }

    /// Conditions of the most recent violating sample since the last reset
    pub fn last_conditions(&self) -> AlarmVerdict {
        self.lock().last_conditions
    }

    /// Whether the underlying output is driven active
    pub fn actuator_active(&self) -> bool {
        self.lock().actuator.is_active()
    }
}

impl std::fmt::Debug for AlarmLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("AlarmLatch")
            .field("latched", &state.latched)
            .field("activations", &state.activations)
            .finish()
    }
}
