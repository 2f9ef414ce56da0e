//! Decoding of the datagrams that arrive on the glasses' data stream.
//!
//! Every packet is a single JSON object. We only care about two shapes:
//!
//! - gaze samples, `{"ts": 4016787, "s": 0, "gp": [0.4487, 0.5044], ...}`
//! - pts sync markers, `{"ts": 4016788, "s": 0, "pts": 360000, ...}`
//!
//! Everything else (pupil diameters, gyroscope, `marker2d`, ...) is kept as a
//! raw [`serde_json::Value`] so the reader can log it.

use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

/// A point of regard on the scene camera image, in normalized `[0, 1]`
/// coordinates, stamped with the telemetry clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GazeSample {
    pub x: f64,
    pub y: f64,
    pub ts: i64,
}

/// Correlation beacon: at video time `pts` (90kHz ticks) the telemetry
/// clock read `ts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMarker {
    pub pts: i64,
    pub ts: i64,
}

/// One decoded telemetry datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Gaze(GazeSample),
    Sync(SyncMarker),
    Other(Value),
}

/// Returned when a datagram is not something we can make sense of.
#[derive(Debug)]
pub enum TelemetryError {
    /// The payload was not valid JSON.
    Json(serde_json::Error),

    /// The payload was JSON, but not an object.
    NotAnObject,

    /// A recognised packet was missing a field or had one of the wrong type.
    BadField(&'static str),
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TelemetryError::Json(error) => write!(f, "invalid json: {}", error),
            TelemetryError::NotAnObject => write!(f, "packet is not a json object"),
            TelemetryError::BadField(name) => write!(f, "missing or malformed field '{}'", name),
        }
    }
}

impl std::error::Error for TelemetryError {}

impl From<serde_json::Error> for TelemetryError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

fn int_field(obj: &Map<String, Value>, name: &'static str) -> Result<i64, TelemetryError> {
    obj.get(name)
        .and_then(Value::as_i64)
        .ok_or(TelemetryError::BadField(name))
}

fn parse_gaze(obj: &Map<String, Value>) -> Result<GazeSample, TelemetryError> {
    let gp = obj
        .get("gp")
        .and_then(Value::as_array)
        .filter(|gp| gp.len() == 2)
        .ok_or(TelemetryError::BadField("gp"))?;
    let x = gp[0].as_f64().ok_or(TelemetryError::BadField("gp"))?;
    let y = gp[1].as_f64().ok_or(TelemetryError::BadField("gp"))?;

    Ok(GazeSample {
        x,
        y,
        ts: int_field(obj, "ts")?,
    })
}

fn parse_sync(obj: &Map<String, Value>) -> Result<SyncMarker, TelemetryError> {
    Ok(SyncMarker {
        pts: int_field(obj, "pts")?,
        ts: int_field(obj, "ts")?,
    })
}

impl TelemetryEvent {
    /// Decode a raw datagram. Invalid UTF-8 is treated like invalid JSON.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TelemetryError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self, TelemetryError> {
        let obj = value.as_object().ok_or(TelemetryError::NotAnObject)?;
        if obj.contains_key("gp") {
            parse_gaze(obj).map(TelemetryEvent::Gaze)
        } else if obj.contains_key("pts") {
            parse_sync(obj).map(TelemetryEvent::Sync)
        } else {
            Ok(TelemetryEvent::Other(value))
        }
    }
}

impl FromStr for TelemetryEvent {
    type Err = TelemetryError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_value(serde_json::from_str(s)?)
    }
}
