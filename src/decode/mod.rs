//! Frame sources: turn sticker bytes into an ordered, single-pass sequence of rasters.

use std::sync::Arc;

use crate::{
    core::{AnimationMetadata, CancelToken, Frame},
    error::StickerResult,
    media::MediaBackend,
};

pub mod lottie;
pub mod video;

pub use lottie::LottieSource;
pub use video::{VideoOptions, VideoSource};

/// Receives frames in strictly increasing index order.
pub trait FrameSink {
    fn accept(&mut self, frame: Frame) -> StickerResult<()>;
}

impl<F> FrameSink for F
where
    F: FnMut(Frame) -> StickerResult<()>,
{
    fn accept(&mut self, frame: Frame) -> StickerResult<()> {
        self(frame)
    }
}

/// A sticker decoder, either a vector composition or a video clip.
///
/// Lifecycle: [`initialize`](Self::initialize), then [`produce_frames`](Self::produce_frames)
/// at most once, then [`release`](Self::release). Release is also run on drop.
pub enum FrameSource {
    Lottie(LottieSource),
    Video(VideoSource),
}

impl FrameSource {
    pub fn lottie(bytes: impl Into<Vec<u8>>, id: impl Into<String>) -> Self {
        Self::Lottie(LottieSource::new(bytes, id))
    }

    pub fn video(
        bytes: impl Into<Arc<[u8]>>,
        options: VideoOptions,
        backend: Arc<dyn MediaBackend>,
    ) -> Self {
        Self::Video(VideoSource::new(bytes, options, backend))
    }

    pub fn with_cancel(self, cancel: CancelToken) -> Self {
        match self {
            Self::Lottie(s) => Self::Lottie(s.with_cancel(cancel)),
            Self::Video(s) => Self::Video(s.with_cancel(cancel)),
        }
    }

    pub fn initialize(&mut self) -> StickerResult<AnimationMetadata> {
        match self {
            Self::Lottie(s) => s.initialize(),
            Self::Video(s) => s.initialize(),
        }
    }

    pub fn metadata(&self) -> Option<AnimationMetadata> {
        match self {
            Self::Lottie(s) => s.metadata(),
            Self::Video(s) => s.metadata(),
        }
    }

    pub fn produce_frames(&mut self, sink: &mut dyn FrameSink) -> StickerResult<()> {
        match self {
            Self::Lottie(s) => s.produce_frames(sink),
            Self::Video(s) => s.produce_frames(sink),
        }
    }

    pub fn release(&mut self) {
        match self {
            Self::Lottie(s) => s.release(),
            Self::Video(s) => s.release(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Lottie(_) => "lottie",
            Self::Video(_) => "video",
        }
    }
}
