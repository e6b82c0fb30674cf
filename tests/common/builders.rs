//! Test data builders for telemetry lines

use ventilator_console::protocol::encode_telemetry;
use ventilator_console::{FaultCode, TelemetryRecord};

/// Builder for telemetry records that match the default settings
///
/// The defaults describe a healthy breath: volume on target, PIP under the
/// 20 cm H2O default, I:E 1:2 and a clear fault code.
pub struct RecordBuilder {
    record: TelemetryRecord,
}

impl Default for RecordBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self {
            record: TelemetryRecord {
                pressure_cm_h2o: 12.5,
                flow_lpm: 30.1,
                volume_ml: 450.0,
                frequency_bpm: 20.0,
                ie_ratio: 2.0,
                peak_inspiratory_pressure: 19.0,
                plateau_pressure: 18.0,
                peep: 5.0,
                fault_code: FaultCode::default(),
            },
        }
    }

    pub fn pressure(mut self, value: f64) -> Self {
        self.record.pressure_cm_h2o = value;
        self
    }

    pub fn volume(mut self, value: f64) -> Self {
        self.record.volume_ml = value;
        self
    }

    pub fn ie_ratio(mut self, value: f64) -> Self {
        self.record.ie_ratio = value;
        self
    }

    pub fn pip(mut self, value: f64) -> Self {
        self.record.peak_inspiratory_pressure = value;
        self
    }

    pub fn plateau(mut self, value: f64) -> Self {
        self.record.plateau_pressure = value;
        self
    }

    pub fn peep(mut self, value: f64) -> Self {
        self.record.peep = value;
        self
    }

    pub fn fault(mut self, code: &str) -> Self {
        self.record.fault_code = FaultCode::new(code);
        self
    }

    pub fn build(self) -> TelemetryRecord {
        self.record
    }

    /// The record as the controller would send it
    pub fn line(self) -> String {
        encode_telemetry(&self.record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ventilator_console::protocol::decode_telemetry;

    #[test]
    fn test_record_builder_line_decodes() {
        let line = RecordBuilder::new().pip(25.0).fault("P00").line();
        let record = decode_telemetry(&line).unwrap();
        assert_eq!(record.peak_inspiratory_pressure, 25.0);
        assert!(record.fault_code.pressure_fault());
    }
}
