//! Client for Tello-class quadcopters: a serialized command channel with
//! acknowledgments and retries, a telemetry listener and an H.264 video
//! receiver, all owned by one [`Drone`] session.

#[macro_use]
extern crate tracing;

pub mod command;
pub mod config;
pub mod error;
pub mod faces;
pub mod health;
pub mod journal;
pub mod session;
pub mod task;
pub mod telemetry;
pub mod transport;
pub mod video;

pub use command::{
    Ack, Axis, Command, CommandHandle, FlipDirection, Point3, RcVector, RotateDirection,
};
pub use config::{DroneConfig, TelloSystemConfig};
pub use error::{CommandError, SessionError, ValidationError};
pub use health::{LinkHealth, StreamHealth};
pub use session::{ConnectionState, Drone};
pub use telemetry::TelemetrySnapshot;
pub use video::{FrameDecoder, VideoFrame};
