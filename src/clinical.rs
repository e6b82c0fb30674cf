//! Bedside calculators
//!
//! Predicted body weight (Devine formula) for sizing the tidal volume, and
//! the air/oxygen flow split for a target FiO2.

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Oxygen fraction of room air, in percent
pub const ROOM_AIR_FIO2: f64 = 21.0;

/// Sex used by the predicted body weight formula
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
}

impl std::fmt::Display for Sex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sex::Male => write!(f, "male"),
            Sex::Female => write!(f, "female"),
        }
    }
}

impl FromStr for Sex {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "male" | "m" => Ok(Sex::Male),
            "female" | "f" => Ok(Sex::Female),
            other => Err(SessionError::InvalidParameter(format!(
                "unknown sex {:?}, expected male or female",
                other
            ))),
        }
    }
}

/// Predicted body weight in kg from height in cm
pub fn predicted_body_weight(height_cm: f64, sex: Sex) -> f64 {
    let base = match sex {
        Sex::Male => 50.0,
        Sex::Female => 45.5,
    };
    base + 0.91 * (height_cm - 152.4)
}

/// Tidal volume in mL for a mL/kg prescription, truncated to whole mL
pub fn tidal_volume_for(height_cm: f64, sex: Sex, ml_per_kg: f64) -> Result<u32> {
    if !(height_cm.is_finite() && ml_per_kg.is_finite()) || ml_per_kg <= 0.0 {
        return Err(SessionError::InvalidParameter(format!(
            "height {} cm and {} mL/kg must be positive numbers",
            height_cm, ml_per_kg
        )));
    }
    let weight = predicted_body_weight(height_cm, sex);
    if weight <= 0.0 {
        return Err(SessionError::InvalidParameter(format!(
            "height {} cm gives a non-positive predicted body weight",
            height_cm
        )));
    }
    Ok((weight * ml_per_kg).trunc() as u32)
}

/// Flow split for a blender
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BlenderFlows {
    /// Air flow in L/min, one decimal
    pub air_lpm: f64,
    /// Oxygen flow in L/min
    pub oxygen_lpm: f64,
}

/// Split a total flow for a target FiO2 (percent, 21 to 100)
pub fn blender_flows(total_flow_lpm: f64, fio2_percent: f64) -> Result<BlenderFlows> {
    if !(ROOM_AIR_FIO2..=100.0).contains(&fio2_percent) {
        return Err(SessionError::InvalidParameter(format!(
            "FiO2 {}% outside 21..=100",
            fio2_percent
        )));
    }
    if !total_flow_lpm.is_finite() || total_flow_lpm < 0.0 {
        return Err(SessionError::InvalidParameter(format!(
            "flow {} L/min must be non-negative",
            total_flow_lpm
        )));
    }

    let air = total_flow_lpm * (fio2_percent - ROOM_AIR_FIO2) / (100.0 - ROOM_AIR_FIO2);
    Ok(BlenderFlows {
        air_lpm: (air * 10.0).round() / 10.0,
        oxygen_lpm: total_flow_lpm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicted_body_weight() {
        assert!((predicted_body_weight(170.0, Sex::Male) - 66.016).abs() < 1e-9);
        assert!((predicted_body_weight(160.0, Sex::Female) - 52.416).abs() < 1e-9);
    }

    #[test]
    fn test_tidal_volume_truncates() {
        // 66.016 kg * 6 mL/kg = 396.096
        assert_eq!(tidal_volume_for(170.0, Sex::Male, 6.0).unwrap(), 396);
        // 52.416 kg * 8 mL/kg = 419.328
        assert_eq!(tidal_volume_for(160.0, Sex::Female, 8.0).unwrap(), 419);
    }

    #[test]
    fn test_tidal_volume_rejects_nonsense() {
        assert!(tidal_volume_for(50.0, Sex::Female, 6.0).is_err());
        assert!(tidal_volume_for(170.0, Sex::Male, 0.0).is_err());
        assert!(tidal_volume_for(f64::NAN, Sex::Male, 6.0).is_err());
    }

    #[test]
    fn test_blender_flows() {
        let flows = blender_flows(10.0, 60.0).unwrap();
        assert_eq!(flows.air_lpm, 4.9);
        assert_eq!(flows.oxygen_lpm, 10.0);

        assert_eq!(blender_flows(10.0, 21.0).unwrap().air_lpm, 0.0);
        assert_eq!(blender_flows(10.0, 100.0).unwrap().air_lpm, 10.0);
    }

    #[test]
    fn test_blender_rejects_fio2_out_of_range() {
        assert!(matches!(
            blender_flows(10.0, 20.0),
            Err(SessionError::InvalidParameter(_))
        ));
        assert!(blender_flows(10.0, 101.0).is_err());
        assert!(blender_flows(-1.0, 50.0).is_err());
    }

    #[test]
    fn test_sex_from_str() {
        assert_eq!("Male".parse::<Sex>().unwrap(), Sex::Male);
        assert_eq!("f".parse::<Sex>().unwrap(), Sex::Female);
        assert!("other".parse::<Sex>().is_err());
    }
}
