use bytes::Bytes;
use chrono::{DateTime, Local};

use crate::error::DecodeError;

pub mod h264;
mod task;

pub use h264::AccessUnit;
pub use task::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuv420p,
    /// Still-encoded H.264 access unit, for consumers that decode or forward
    /// the stream themselves.
    H264,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,
}

/// A decoded picture as published to readers.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub image: Image,
    /// Sequence number of the access unit this frame was decoded from. A
    /// jump of more than one means units were lost or failed to decode.
    pub seq: u64,
    pub keyframe: bool,
    pub received_at: DateTime<Local>,
}

/// Turns access units into pictures. Implementations wrap an actual codec;
/// the session only moves bytes.
pub trait FrameDecoder: Send + 'static {
    /// Returns `Ok(None)` when the decoder accepted the unit but has no
    /// picture to show yet (e.g. before the first keyframe).
    fn decode(&mut self, unit: &AccessUnit) -> Result<Option<Image>, DecodeError>;
}

impl<F> FrameDecoder for F
where
    F: FnMut(&AccessUnit) -> Result<Option<Image>, DecodeError> + Send + 'static,
{
    fn decode(&mut self, unit: &AccessUnit) -> Result<Option<Image>, DecodeError> {
        self(unit)
    }
}

/// Publishes access units without decoding them. Holds frames back until
/// the first keyframe so consumers always start on a decodable unit.
#[derive(Debug, Clone)]
pub struct PassthroughDecoder {
    width: u32,
    height: u32,
    seen_keyframe: bool,
}

impl PassthroughDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        PassthroughDecoder {
            width,
            height,
            seen_keyframe: false,
        }
    }
}

impl Default for PassthroughDecoder {
    /// The drone's native stream resolution.
    fn default() -> Self {
        Self::new(960, 720)
    }
}

impl FrameDecoder for PassthroughDecoder {
    fn decode(&mut self, unit: &AccessUnit) -> Result<Option<Image>, DecodeError> {
        self.seen_keyframe |= unit.keyframe;

        if !self.seen_keyframe {
            return Ok(None);
        }

        Ok(Some(Image {
            width: self.width,
            height: self.height,
            format: PixelFormat::H264,
            data: unit.data.clone(),
        }))
    }
}
