//! Per-sample monitoring: derived metrics, alarms, and the waveform buffer
//!
//! Everything here runs on the poll thread for each decoded record:
//!
//! - [`metrics`] - Mean airway pressure, compliance, minute ventilation
//! - [`alarm`] - Alarm evaluation and the latching [`AlarmLatch`] around an actuator
//! - [`buffer`] - The 10 second [`RollingBuffer`] feeding waveform display

pub mod alarm;
pub mod buffer;
pub mod metrics;

pub use alarm::{
    evaluate, AlarmActuator, AlarmLatch, AlarmThresholds, GpioActuator, NullActuator,
    RaiseOutcome,
};
pub use buffer::{
    BufferSnapshot, RollingBuffer, SharedBuffer, WaveformSample, DEFAULT_WINDOW_SECONDS,
};
pub use metrics::{compliance, mean_airway_pressure, minute_ventilation};
