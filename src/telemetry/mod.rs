use std::{collections::HashMap, str::FromStr};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::error::ParseError;

mod task;

pub use task::*;

/// One parsed state datagram. Replaced wholesale each time a new datagram is
/// parsed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// Battery charge in percent
    pub battery: u8,

    /// Time-of-flight (downward) distance in centimeters
    pub tof: i32,

    /// Attitude in degrees
    pub pitch: i32,
    pub roll: i32,
    pub yaw: i32,

    /// Height above takeoff in centimeters
    pub height: i32,

    /// Lowest and highest board temperature in °C
    pub temp_low: i32,
    pub temp_high: i32,

    /// Velocity in cm/s (x, y, z), if reported
    pub velocity: Option<[i32; 3]>,

    /// Barometric altitude in meters, if reported
    pub baro: Option<f32>,

    /// Seconds the motors have been running, if reported
    pub motor_time: Option<u32>,

    /// Acceleration in 0.001g (x, y, z), if reported
    pub acceleration: Option<[f32; 3]>,

    #[serde(serialize_with = "serialize_time")]
    pub received_at: DateTime<Local>,
}

fn serialize_time<S>(this: &DateTime<Local>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::ser::Serializer,
{
    serializer.collect_str(&this.format("%Y-%m-%dT%H:%M:%S%.6f%:z"))
}

impl TelemetrySnapshot {
    /// Parses a `key:value;key:value;` record. Unknown keys are ignored so
    /// newer firmware fields do not break parsing.
    pub fn parse(datagram: &[u8], received_at: DateTime<Local>) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(datagram).map_err(|_| ParseError::Utf8)?;

        let mut fields = HashMap::new();
        for item in text.trim().split(';') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }

            let (key, value) = item
                .split_once(':')
                .ok_or_else(|| ParseError::Field(item.to_owned()))?;
            fields.insert(key, value);
        }

        Ok(TelemetrySnapshot {
            battery: required(&fields, "bat")?,
            tof: required(&fields, "tof")?,
            pitch: required(&fields, "pitch")?,
            roll: required(&fields, "roll")?,
            yaw: required(&fields, "yaw")?,
            height: required(&fields, "h")?,
            temp_low: required(&fields, "templ")?,
            temp_high: required(&fields, "temph")?,
            velocity: triple(&fields, ["vgx", "vgy", "vgz"])?,
            baro: optional(&fields, "baro")?,
            motor_time: optional(&fields, "time")?,
            acceleration: triple(&fields, ["agx", "agy", "agz"])?,
            received_at,
        })
    }
}

fn optional<T: FromStr>(fields: &HashMap<&str, &str>, key: &str) -> Result<Option<T>, ParseError> {
    fields
        .get(key)
        .map(|value| {
            value.trim().parse().map_err(|_| ParseError::Value {
                key: key.to_owned(),
                value: value.to_string(),
            })
        })
        .transpose()
}

fn required<T: FromStr>(fields: &HashMap<&str, &str>, key: &'static str) -> Result<T, ParseError> {
    optional(fields, key)?.ok_or(ParseError::Missing(key))
}

fn triple<T: FromStr + Copy>(
    fields: &HashMap<&str, &str>,
    keys: [&str; 3],
) -> Result<Option<[T; 3]>, ParseError> {
    let x = optional(fields, keys[0])?;
    let y = optional(fields, keys[1])?;
    let z = optional(fields, keys[2])?;

    Ok(match (x, y, z) {
        (Some(x), Some(y), Some(z)) => Some([x, y, z]),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATE: &[u8] = b"mid:-1;x:0;y:0;z:0;mpry:0,0,0;pitch:2;roll:-1;yaw:45;vgx:0;vgy:3;vgz:-1;templ:62;temph:65;tof:10;h:0;bat:87;baro:-65.34;time:12;agx:-5.00;agy:1.00;agz:-999.00;\r\n";

    #[test]
    fn parses_full_record() {
        let snapshot = TelemetrySnapshot::parse(STATE, Local::now()).unwrap();

        assert_eq!(snapshot.battery, 87);
        assert_eq!(snapshot.tof, 10);
        assert_eq!((snapshot.pitch, snapshot.roll, snapshot.yaw), (2, -1, 45));
        assert_eq!(snapshot.height, 0);
        assert_eq!((snapshot.temp_low, snapshot.temp_high), (62, 65));
        assert_eq!(snapshot.velocity, Some([0, 3, -1]));
        assert_eq!(snapshot.baro, Some(-65.34));
        assert_eq!(snapshot.motor_time, Some(12));
        assert_eq!(snapshot.acceleration, Some([-5.0, 1.0, -999.0]));
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let record = b"pitch:0;roll:0;yaw:0;templ:40;temph:42;tof:6553;h:0;bat:100;";
        let snapshot = TelemetrySnapshot::parse(record, Local::now()).unwrap();

        assert_eq!(snapshot.battery, 100);
        assert_eq!(snapshot.velocity, None);
        assert_eq!(snapshot.acceleration, None);
    }

    #[test]
    fn rejects_malformed_records() {
        let now = Local::now();

        assert_eq!(
            TelemetrySnapshot::parse(b"pitch:0;garbage;", now),
            Err(ParseError::Field("garbage".into()))
        );
        assert_eq!(
            TelemetrySnapshot::parse(b"pitch:0;roll:0;yaw:0;templ:1;temph:2;tof:3;h:4;", now),
            Err(ParseError::Missing("bat"))
        );
        assert!(matches!(
            TelemetrySnapshot::parse(b"pitch:up;roll:0;yaw:0;templ:1;temph:2;tof:3;h:4;bat:5;", now),
            Err(ParseError::Value { .. })
        ));
        assert_eq!(
            TelemetrySnapshot::parse(&[0xff, 0xfe, b';'], now),
            Err(ParseError::Utf8)
        );
    }
}
