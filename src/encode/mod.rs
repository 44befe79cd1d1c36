//! Encoders consume frames in order and produce the final animation.

use std::path::PathBuf;

use crate::{
    core::Frame,
    error::{EncodeError, StickerError, StickerResult},
};

pub mod bridge;
pub mod ffmpeg;

pub use bridge::{
    LogCallback, LogLevel, LogLine, ProcessBridge, Statistics, StatisticsCallback,
    is_ffmpeg_available, is_ffmpeg_on_path,
};
pub use ffmpeg::{FfmpegGifEncoder, scaled_dimensions};

/// One output request. Consumed by a single encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodeJob {
    pub dst: PathBuf,
    pub fps: u32,
    pub max_dimension: Option<u32>,
    pub transparent: bool,
}

impl EncodeJob {
    pub fn new(dst: impl Into<PathBuf>, fps: u32) -> Self {
        Self {
            dst: dst.into(),
            fps,
            max_dimension: None,
            transparent: true,
        }
    }

    pub fn with_max_dimension(mut self, max: u32) -> Self {
        self.max_dimension = Some(max);
        self
    }

    pub fn with_transparent(mut self, transparent: bool) -> Self {
        self.transparent = transparent;
        self
    }

    pub fn validate(&self) -> StickerResult<()> {
        if self.fps == 0 {
            return Err(StickerError::validation("encode fps must be non-zero"));
        }
        if self.max_dimension == Some(0) {
            return Err(StickerError::validation(
                "encode max dimension must be non-zero",
            ));
        }
        if self.dst.as_os_str().is_empty() {
            return Err(StickerError::validation("encode destination is empty"));
        }
        Ok(())
    }
}

/// Keeps frames in memory. Used when the caller wants rasters rather than a file.
#[derive(Debug, Default)]
pub struct MemoryEncoder {
    frames: Vec<Frame>,
    finished: bool,
}

impl MemoryEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

pub enum Encoder {
    Ffmpeg(FfmpegGifEncoder),
    Memory(MemoryEncoder),
}

impl Encoder {
    pub fn ffmpeg(job: &EncodeJob, bridge: ProcessBridge) -> StickerResult<Self> {
        Ok(Self::Ffmpeg(FfmpegGifEncoder::new(job, bridge)?))
    }

    pub fn memory() -> Self {
        Self::Memory(MemoryEncoder::new())
    }

    pub fn start(&mut self) -> StickerResult<()> {
        match self {
            Self::Ffmpeg(e) => e.start(),
            Self::Memory(e) => {
                e.frames.clear();
                e.finished = false;
                Ok(())
            }
        }
    }

    pub fn add_frame(&mut self, frame: Frame) -> StickerResult<()> {
        match self {
            Self::Ffmpeg(e) => e.add_frame(frame.buffer),
            Self::Memory(e) if e.finished => Err(EncodeError::Finalized.into()),
            Self::Memory(e) => {
                e.frames.push(frame);
                Ok(())
            }
        }
    }

    /// Finish encoding. Returns the written file, if this encoder writes one.
    pub fn process(&mut self) -> StickerResult<Option<PathBuf>> {
        match self {
            Self::Ffmpeg(e) => e.process().map(Some),
            Self::Memory(e) => {
                e.finished = true;
                Ok(None)
            }
        }
    }

    pub fn end(&mut self) {
        match self {
            Self::Ffmpeg(e) => e.end(),
            Self::Memory(e) => e.finished = true,
        }
    }
}
