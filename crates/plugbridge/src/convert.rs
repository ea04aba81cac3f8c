//! Conversions between accessory-domain values and device-domain values.
//!
//! Accessories speak percentages (0-100). Dimmers report and accept raw
//! brightness (0-255) and fans accept one of three speed labels.

use serde::Deserialize;
use serde::Serialize;

use crate::error::BridgeError;

/// Largest raw brightness value a dimmer reports.
pub const RAW_BRIGHTNESS_MAX: u8 = 255;

/// Largest accessory-domain percentage.
pub const PERCENT_MAX: u8 = 100;

/// Power payload used on device topics.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

impl From<bool> for PowerState {
    fn from(on: bool) -> Self {
        if on { Self::On } else { Self::Off }
    }
}

/// Discrete fan speed accepted by fan firmware.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum SpeedBucket {
    Low,
    Medium,
    High,
}

/// Validate an accessory-domain percentage.
pub fn check_percent(value: i64) -> Result<u8, BridgeError> {
    u8::try_from(value)
        .ok()
        .filter(|pct| *pct <= PERCENT_MAX)
        .ok_or(BridgeError::ValueOutOfRange { value })
}

/// Percentage (0-100) to raw brightness (0-255), rounded to nearest.
pub fn to_raw_brightness(pct: i64) -> Result<u8, BridgeError> {
    let pct = check_percent(pct)?;
    let raw = (f64::from(pct) / f64::from(PERCENT_MAX) * f64::from(RAW_BRIGHTNESS_MAX)).round();
    // Bounded by 0..=255 since pct is bounded by 0..=100.
    Ok(raw as u8)
}

/// Raw brightness (0-255) to percentage (0-100), rounded to nearest.
pub fn to_percent_brightness(raw: u8) -> u8 {
    let pct = (f64::from(raw) / f64::from(RAW_BRIGHTNESS_MAX) * f64::from(PERCENT_MAX)).round();
    pct as u8
}

/// Map a speed percentage onto a bucket. Boundaries belong to the lower bucket.
pub fn speed_percent_to_bucket(pct: i64) -> Result<SpeedBucket, BridgeError> {
    let bucket = match check_percent(pct)? {
        0..=34 => SpeedBucket::Low,
        35..=68 => SpeedBucket::Medium,
        _ => SpeedBucket::High,
    };
    Ok(bucket)
}

pub fn bucket_to_speed_percent(bucket: SpeedBucket) -> u8 {
    match bucket {
        SpeedBucket::Low => 34,
        SpeedBucket::Medium => 68,
        SpeedBucket::High => 100,
    }
}

/// Speed percentage for a label reported by a fan; unknown labels read as 0.
pub fn speed_label_to_percent(label: &str) -> u8 {
    label
        .trim()
        .parse::<SpeedBucket>()
        .map(bucket_to_speed_percent)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brightness_round_trip_from_percent() {
        for pct in 0..=100i64 {
            let raw = to_raw_brightness(pct).unwrap();
            let back = i64::from(to_percent_brightness(raw));
            assert!((back - pct).abs() <= 1, "pct {} -> raw {} -> {}", pct, raw, back);
        }
    }

    #[test]
    fn test_brightness_round_trip_from_raw() {
        for raw in 0..=255u8 {
            let pct = to_percent_brightness(raw);
            let back = i64::from(to_raw_brightness(i64::from(pct)).unwrap());
            assert!(
                (back - i64::from(raw)).abs() <= 1,
                "raw {} -> pct {} -> {}",
                raw,
                pct,
                back
            );
        }
    }

    #[test]
    fn test_brightness_known_values() {
        assert_eq!(to_raw_brightness(0).unwrap(), 0);
        assert_eq!(to_raw_brightness(50).unwrap(), 128);
        assert_eq!(to_raw_brightness(100).unwrap(), 255);
        assert_eq!(to_percent_brightness(128), 50);
        assert_eq!(to_percent_brightness(255), 100);
    }

    #[test]
    fn test_out_of_range_percent() {
        assert!(matches!(
            to_raw_brightness(101),
            Err(BridgeError::ValueOutOfRange { value: 101 })
        ));
        assert!(matches!(
            to_raw_brightness(-1),
            Err(BridgeError::ValueOutOfRange { value: -1 })
        ));
        assert!(speed_percent_to_bucket(150).is_err());
        assert!(check_percent(300).is_err());
    }

    #[test]
    fn test_speed_bucket_boundaries() {
        assert_eq!(speed_percent_to_bucket(0).unwrap(), SpeedBucket::Low);
        assert_eq!(speed_percent_to_bucket(34).unwrap(), SpeedBucket::Low);
        assert_eq!(speed_percent_to_bucket(35).unwrap(), SpeedBucket::Medium);
        assert_eq!(speed_percent_to_bucket(68).unwrap(), SpeedBucket::Medium);
        assert_eq!(speed_percent_to_bucket(69).unwrap(), SpeedBucket::High);
        assert_eq!(speed_percent_to_bucket(100).unwrap(), SpeedBucket::High);
    }

    #[test]
    fn test_speed_labels() {
        assert_eq!(speed_label_to_percent("low"), 34);
        assert_eq!(speed_label_to_percent("medium"), 68);
        assert_eq!(speed_label_to_percent("high\n"), 100);
        assert_eq!(speed_label_to_percent("turbo"), 0);
        assert_eq!(SpeedBucket::High.to_string(), "high");
    }

    #[test]
    fn test_power_state_wire_form() {
        assert_eq!(serde_json::to_string(&PowerState::On).unwrap(), r#""ON""#);
        assert_eq!("OFF".parse::<PowerState>().unwrap(), PowerState::Off);
        assert!("on".parse::<PowerState>().is_err());
        assert_eq!(PowerState::from(true), PowerState::On);
    }
}
