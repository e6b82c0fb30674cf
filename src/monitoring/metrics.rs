//! Clinical metrics derived from a telemetry record
//!
//! All results are rounded to two decimals. A metric that would divide by
//! zero returns `None` so no NaN or infinity ever reaches a display.

use crate::types::{DerivedSample, TelemetryRecord};

#[inline]
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Mean airway pressure from PIP, PEEP and the measured I:E ratio
///
/// `0.5 * (pip - peep) * (1 / ie_ratio) + peep`, undefined for a zero ratio.
pub fn mean_airway_pressure(pip: f64, peep: f64, ie_ratio: f64) -> Option<f64> {
    if ie_ratio == 0.0 {
        return None;
    }
    let value = 0.5 * (pip - peep) * (1.0 / ie_ratio) + peep;
    value.is_finite().then(|| round2(value))
}

/// Static compliance in mL/cm H2O, undefined when plateau equals PEEP
pub fn compliance(volume: f64, plateau: f64, peep: f64) -> Option<f64> {
    let driving_pressure = plateau - peep;
    if driving_pressure == 0.0 {
        return None;
    }
    let value = volume / driving_pressure;
    value.is_finite().then(|| round2(value))
}

/// Minute ventilation in L/min from tidal volume (mL) and frequency (bpm)
pub fn minute_ventilation(volume: f64, frequency: f64) -> f64 {
    round2(volume * frequency / 1000.0)
}

impl DerivedSample {
    /// Compute all derived metrics for a record
    pub fn from_record(record: &TelemetryRecord) -> Self {
        Self {
            mean_airway_pressure: mean_airway_pressure(
                record.peak_inspiratory_pressure,
                record.peep,
                record.ie_ratio,
            ),
            compliance_ml_per_cm_h2o: compliance(
                record.volume_ml,
                record.plateau_pressure,
                record.peep,
            ),
            minute_ventilation_l_per_min: minute_ventilation(
                record.volume_ml,
                record.frequency_bpm,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_airway_pressure() {
        assert_eq!(mean_airway_pressure(20.0, 5.0, 2.0), Some(8.75));
        assert_eq!(mean_airway_pressure(20.0, 5.0, 0.0), None);
        // 0.5 * 15 / 3 + 5 = 7.5
        assert_eq!(mean_airway_pressure(20.0, 5.0, 3.0), Some(7.5));
    }

    #[test]
    fn test_compliance() {
        assert_eq!(compliance(100.0, 10.0, 10.0), None);
        assert_eq!(compliance(100.0, 15.0, 5.0), Some(10.0));
        // 450 / 7 = 64.2857...
        assert_eq!(compliance(450.0, 12.0, 5.0), Some(64.29));
    }

    #[test]
    fn test_minute_ventilation() {
        assert_eq!(minute_ventilation(450.0, 20.0), 9.0);
        assert_eq!(minute_ventilation(0.0, 20.0), 0.0);
        assert_eq!(minute_ventilation(333.0, 17.0), 5.66);
    }

    #[test]
    fn test_derived_sample_from_record() {
        let record = TelemetryRecord {
            volume_ml: 450.0,
            frequency_bpm: 20.0,
            ie_ratio: 2.0,
            peak_inspiratory_pressure: 20.0,
            plateau_pressure: 5.0,
            peep: 5.0,
            ..Default::default()
        };
        let derived = DerivedSample::from_record(&record);
        assert_eq!(derived.mean_airway_pressure, Some(8.75));
        assert_eq!(derived.compliance_ml_per_cm_h2o, None);
        assert_eq!(derived.minute_ventilation_l_per_min, 9.0);
    }
}
