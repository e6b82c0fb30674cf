//! Wire codec for the controller's line protocol
//!
//! The controller speaks newline-delimited ASCII at 115200 baud:
//!
//! | Direction | Line |
//! |-----------|------|
//! | start, continuous mandatory | `C,<freq>,<tidal>,<pause>,<ie_denom>,<pip>\n` |
//! | start, assisted pressure | `P,<freq>,<tidal>,<pause>,<trigger>,<pip>\n` |
//! | start, assisted flow | `F,<freq>,<tidal>,<pause>,<trigger>,<pip>\n` |
//! | update in place | the start line with `22` before the tag |
//! | poll request | `1` (no newline) |
//! | stop | `22\n` |
//! | telemetry reply | `pressure,flow,volume,freq,ie,pip,plateau,peep,fault\n` |
//!
//! The `22` prefix and the bare `22\n` stop line are fixed by the controller
//! firmware. Everything here is pure: no I/O, no state.

use crate::error::DecodeError;
use crate::types::{FaultCode, Settings, TelemetryRecord, VentilationMode};

/// Number of fields in a telemetry reply
pub const TELEMETRY_FIELD_COUNT: usize = 9;

/// Number of fields in a start/update command, tag included
pub const COMMAND_FIELD_COUNT: usize = 6;

/// Prefix marking an update-in-place command, also the whole stop line
pub const UPDATE_PREFIX: &str = "22";

/// Byte asking the controller for one telemetry line
pub const POLL_REQUEST: u8 = b'1';

/// A command as the controller sees it
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    /// Start ventilating with these settings
    Start(Settings),
    /// Replace the running settings
    Update(Settings),
    /// Send one telemetry line
    PollRequest,
    /// Halt actuation
    Stop,
}

fn mode_tag(mode: VentilationMode) -> char {
    match mode {
        VentilationMode::ContinuousMandatory => 'C',
        VentilationMode::AssistedPressure => 'P',
        VentilationMode::AssistedFlow => 'F',
    }
}

fn mode_from_tag(tag: &str) -> Option<VentilationMode> {
    match tag {
        "C" => Some(VentilationMode::ContinuousMandatory),
        "P" => Some(VentilationMode::AssistedPressure),
        "F" => Some(VentilationMode::AssistedFlow),
        _ => None,
    }
}

/// Encode a start or update command for the given settings
///
/// The fourth numeric field is the I:E denominator in continuous mandatory
/// mode and the trigger threshold in the assisted modes.
pub fn encode_start_or_update(settings: &Settings, is_update: bool) -> Vec<u8> {
    let prefix = if is_update { UPDATE_PREFIX } else { "" };
    let mode_field = if settings.mode.uses_trigger() {
        format!("{}", settings.trigger_threshold)
    } else {
        settings.ie_ratio_denominator.to_string()
    };

    format!(
        "{}{},{},{},{:.1},{},{}\n",
        prefix,
        mode_tag(settings.mode),
        settings.frequency,
        settings.tidal_volume,
        settings.inspiratory_pause,
        mode_field,
        settings.pip_target,
    )
    .into_bytes()
}

/// Encode the poll request
pub fn encode_poll_request() -> Vec<u8> {
    vec![POLL_REQUEST]
}

/// Encode the stop line
pub fn encode_stop() -> Vec<u8> {
    format!("{}\n", UPDATE_PREFIX).into_bytes()
}

fn strip_terminator(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

fn parse_real(index: usize, text: &str) -> Result<f64, DecodeError> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DecodeError::NumericParse {
            index,
            text: text.to_string(),
        })
}

/// Decode one telemetry reply
///
/// A record is all-or-nothing: a line with the wrong field count or a bad
/// numeric field is rejected whole.
pub fn decode_telemetry(line: &str) -> Result<TelemetryRecord, DecodeError> {
    let fields: Vec<&str> = strip_terminator(line).split(',').collect();
    if fields.len() != TELEMETRY_FIELD_COUNT {
        return Err(DecodeError::MalformedRecord {
            expected: TELEMETRY_FIELD_COUNT,
            found: fields.len(),
        });
    }

    let mut values = [0.0_f64; TELEMETRY_FIELD_COUNT - 1];
    for (index, (slot, text)) in values.iter_mut().zip(&fields).enumerate() {
        *slot = parse_real(index, text)?;
    }

    Ok(TelemetryRecord {
        pressure_cm_h2o: values[0],
        flow_lpm: values[1],
        volume_ml: values[2],
        frequency_bpm: values[3],
        ie_ratio: values[4],
        peak_inspiratory_pressure: values[5],
        plateau_pressure: values[6],
        peep: values[7],
        fault_code: FaultCode::new(fields[8]),
    })
}

/// Encode a telemetry reply the way the controller formats it
///
/// Only the simulated device and tests need this direction.
pub fn encode_telemetry(record: &TelemetryRecord) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{}\n",
        record.pressure_cm_h2o,
        record.flow_lpm,
        record.volume_ml,
        record.frequency_bpm,
        record.ie_ratio,
        record.peak_inspiratory_pressure,
        record.plateau_pressure,
        record.peep,
        record.fault_code,
    )
}

fn parse_integer(index: usize, text: &str) -> Result<u32, DecodeError> {
    text.trim()
        .parse::<u32>()
        .map_err(|_| DecodeError::NumericParse {
            index,
            text: text.to_string(),
        })
}

/// Parse a line the console sends back into a [`DeviceCommand`]
pub fn parse_command(line: &[u8]) -> Result<DeviceCommand, DecodeError> {
    if line == [POLL_REQUEST] {
        return Ok(DeviceCommand::PollRequest);
    }

    let text = String::from_utf8_lossy(line);
    let text = strip_terminator(&text);
    if text == UPDATE_PREFIX {
        return Ok(DeviceCommand::Stop);
    }

    let fields: Vec<&str> = text.split(',').collect();
    if fields.len() != COMMAND_FIELD_COUNT {
        return Err(DecodeError::MalformedRecord {
            expected: COMMAND_FIELD_COUNT,
            found: fields.len(),
        });
    }

    let (is_update, tag) = match fields[0].strip_prefix(UPDATE_PREFIX) {
        Some(tag) => (true, tag),
        None => (false, fields[0]),
    };
    let mode =
        mode_from_tag(tag).ok_or_else(|| DecodeError::UnknownCommand(text.to_string()))?;

    let mut settings = Settings::new(mode)
        .with_frequency(parse_integer(1, fields[1])?)
        .with_tidal_volume(parse_integer(2, fields[2])?)
        .with_inspiratory_pause(parse_real(3, fields[3])?)
        .with_pip_target(parse_integer(5, fields[5])?);
    if mode.uses_trigger() {
        settings.trigger_threshold = parse_real(4, fields[4])?;
    } else {
        settings.ie_ratio_denominator = parse_integer(4, fields[4])?;
    }

    Ok(if is_update {
        DeviceCommand::Update(settings)
    } else {
        DeviceCommand::Start(settings)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_encode_continuous_mandatory_start() {
        let settings = Settings::new(VentilationMode::ContinuousMandatory);
        assert_eq!(
            line(encode_start_or_update(&settings, false)),
            "C,20,450,0.5,2,20\n"
        );
    }

    #[test]
    fn test_encode_assisted_uses_trigger() {
        let settings = Settings::new(VentilationMode::AssistedPressure)
            .with_trigger_threshold(-2.0)
            .with_ie_ratio_denominator(3);
        assert_eq!(
            line(encode_start_or_update(&settings, false)),
            "P,20,450,0.5,-2,20\n"
        );

        let flow = settings
            .with_mode(VentilationMode::AssistedFlow)
            .with_trigger_threshold(1.5);
        assert_eq!(
            line(encode_start_or_update(&flow, false)),
            "F,20,450,0.5,1.5,20\n"
        );
    }

    #[test]
    fn test_encode_update_prefix() {
        let settings = Settings::new(VentilationMode::ContinuousMandatory).with_pip_target(25);
        assert_eq!(
            line(encode_start_or_update(&settings, true)),
            "22C,20,450,0.5,2,25\n"
        );
        let assisted = settings.with_mode(VentilationMode::AssistedFlow);
        assert!(line(encode_start_or_update(&assisted, true)).starts_with("22F,"));
    }

    #[test]
    fn test_poll_and_stop_are_distinct() {
        assert_eq!(encode_poll_request(), b"1".to_vec());
        assert_eq!(encode_stop(), b"22\n".to_vec());
        assert_ne!(encode_stop(), encode_poll_request());
    }

    #[test]
    fn test_decode_valid_line() {
        let record = decode_telemetry("12.5,30.1,420,20,2.1,18,15,5,000\n").unwrap();
        assert_eq!(record.pressure_cm_h2o, 12.5);
        assert_eq!(record.flow_lpm, 30.1);
        assert_eq!(record.volume_ml, 420.0);
        assert_eq!(record.frequency_bpm, 20.0);
        assert_eq!(record.ie_ratio, 2.1);
        assert_eq!(record.peak_inspiratory_pressure, 18.0);
        assert_eq!(record.plateau_pressure, 15.0);
        assert_eq!(record.peep, 5.0);
        assert!(record.fault_code.is_clear());
    }

    #[test]
    fn test_decode_tolerates_crlf() {
        let record = decode_telemetry("1,2,3,4,5,6,7,8,P00\r\n").unwrap();
        assert_eq!(record.fault_code.as_str(), "P00");
    }

    #[test]
    fn test_decode_wrong_field_count() {
        assert_eq!(
            decode_telemetry("1,2,3\n"),
            Err(DecodeError::MalformedRecord {
                expected: 9,
                found: 3
            })
        );
        // An empty line (read timeout on the device side) is one empty field
        assert!(matches!(
            decode_telemetry(""),
            Err(DecodeError::MalformedRecord { found: 1, .. })
        ));
        assert!(matches!(
            decode_telemetry("1,2,3,4,5,6,7,8,000,9\n"),
            Err(DecodeError::MalformedRecord { found: 10, .. })
        ));
    }

    #[test]
    fn test_decode_bad_number() {
        assert_eq!(
            decode_telemetry("1,2,abc,4,5,6,7,8,000\n"),
            Err(DecodeError::NumericParse {
                index: 2,
                text: "abc".to_string()
            })
        );
        assert!(matches!(
            decode_telemetry("1,2,3,4,inf,6,7,8,000"),
            Err(DecodeError::NumericParse { index: 4, .. })
        ));
    }

    #[test]
    fn test_fault_field_not_validated() {
        let record = decode_telemetry("1,2,3,4,5,6,7,8,").unwrap();
        assert_eq!(record.fault_code.as_str(), "");
        assert!(!record.fault_code.is_clear());
    }

    #[test]
    fn test_command_round_trip() {
        for &mode in VentilationMode::all() {
            let settings = Settings::new(mode)
                .with_frequency(18)
                .with_tidal_volume(500)
                .with_inspiratory_pause(0.2)
                .with_ie_ratio_denominator(3)
                .with_pip_target(28)
                .with_trigger_threshold(-1.5);

            let start = parse_command(&encode_start_or_update(&settings, false)).unwrap();
            let update = parse_command(&encode_start_or_update(&settings, true)).unwrap();

            let expected = if mode.uses_trigger() {
                Settings {
                    ie_ratio_denominator: Settings::default().ie_ratio_denominator,
                    ..settings
                }
            } else {
                Settings {
                    trigger_threshold: Settings::default().trigger_threshold,
                    ..settings
                }
            };
            assert_eq!(start, DeviceCommand::Start(expected));
            assert_eq!(update, DeviceCommand::Update(expected));
        }
    }

    #[test]
    fn test_parse_poll_and_stop() {
        assert_eq!(
            parse_command(&encode_poll_request()).unwrap(),
            DeviceCommand::PollRequest
        );
        assert_eq!(parse_command(&encode_stop()).unwrap(), DeviceCommand::Stop);
        assert!(matches!(
            parse_command(b"X,1,2,3,4,5\n"),
            Err(DecodeError::UnknownCommand(_))
        ));
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_valid_lines_round_trip(
            values in prop::array::uniform8(-1.0e6f64..1.0e6),
            fault in "[0P][0V][0F]",
        ) {
            let text: Vec<String> = values.iter().map(|v| v.to_string()).collect();
            let line = format!("{},{}\n", text.join(","), fault);
            let record = decode_telemetry(&line).unwrap();
            let decoded = [
                record.pressure_cm_h2o,
                record.flow_lpm,
                record.volume_ml,
                record.frequency_bpm,
                record.ie_ratio,
                record.peak_inspiratory_pressure,
                record.plateau_pressure,
                record.peep,
            ];
            for (a, b) in decoded.iter().zip(values.iter()) {
                prop_assert!((a - b).abs() <= 1e-9 * b.abs().max(1.0));
            }
            prop_assert_eq!(record.fault_code.as_str(), fault.as_str());
        }

        #[test]
        fn test_wrong_field_count_is_malformed(count in 1usize..20) {
            prop_assume!(count != TELEMETRY_FIELD_COUNT);
            let line = vec!["1"; count].join(",");
            let is_malformed = matches!(
                decode_telemetry(&line),
                Err(DecodeError::MalformedRecord { .. })
            );
            prop_assert!(is_malformed);
        }
    }
}
