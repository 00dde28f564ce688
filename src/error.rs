use std::time::Duration;

use thiserror::Error;

/// A command was rejected locally, before it was queued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("distance {0} cm is outside 20..=500")]
    Distance(u32),
    #[error("rotation {0} degrees is outside 1..=360")]
    Degrees(u32),
    #[error("coordinate {0} cm is outside -500..=500")]
    Coordinate(i32),
    #[error("speed {speed} cm/s is outside {min}..={max}")]
    Speed { speed: u32, min: u32, max: u32 },
    #[error("target is too close; at least one coordinate must be 20 cm or more from zero")]
    TooClose,
    #[error("curve points must not be identical")]
    DegenerateCurve,
}

/// The outcome of a command that was accepted into the queue but did not
/// succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no acknowledgment after {attempts} attempts")]
    AckTimeout { attempts: u32 },
    #[error("drone rejected command: {0}")]
    Rejected(String),
    #[error("superseded by an emergency stop")]
    Superseded,
    #[error("session closed while command was pending")]
    Cancelled,
    #[error("connection to the drone was lost")]
    ConnectionLost,
    #[error("session is not connected")]
    NotConnected,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("handshake failed after {attempts} attempts ({timeout:?} each)")]
    Handshake { attempts: u32, timeout: Duration },
    #[error("failed to bind {channel} socket")]
    Bind {
        channel: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error on control channel")]
    Io(#[from] std::io::Error),
    #[error("session is {0:?}, expected Disconnected")]
    InvalidState(crate::session::ConnectionState),
}

/// A telemetry datagram that could not be turned into a snapshot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("datagram is not valid utf-8")]
    Utf8,
    #[error("field '{0}' is not a key:value pair")]
    Field(String),
    #[error("missing field '{0}'")]
    Missing(&'static str),
    #[error("invalid value '{value}' for field '{key}'")]
    Value { key: String, value: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to decode access unit: {0}")]
pub struct DecodeError(pub String);
