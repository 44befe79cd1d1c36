use crate::{
    core::{AnimationMetadata, CancelToken, Frame, FrameTiming, delay_for_fps},
    decode::FrameSink,
    error::{DecodeError, StickerResult},
    lottie::{LottieRasterizer, Scene, parse_composition},
};

/// Vector sticker source. Frames are rasterized one at a time on the calling thread.
pub struct LottieSource {
    id: String,
    bytes: Vec<u8>,
    cancel: CancelToken,
    rasterizer: Option<LottieRasterizer>,
    metadata: Option<AnimationMetadata>,
    consumed: bool,
}

impl LottieSource {
    pub fn new(bytes: impl Into<Vec<u8>>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bytes: bytes.into(),
            cancel: CancelToken::new(),
            rasterizer: None,
            metadata: None,
            consumed: false,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    #[tracing::instrument(skip(self), fields(id = %self.id, bytes = self.bytes.len()))]
    pub fn initialize(&mut self) -> StickerResult<AnimationMetadata> {
        let model = parse_composition(&self.bytes)?;
        let scene = Scene::from_model(&model)?;
        let metadata = AnimationMetadata::new(
            scene.width,
            scene.height,
            scene.duration_frames(),
            FrameTiming::Rate {
                fps: scene.frame_rate,
            },
        )?;
        self.rasterizer = Some(LottieRasterizer::new(scene)?);
        self.metadata = Some(metadata);
        // The document is no longer needed once the scene is built.
        self.bytes = Vec::new();
        tracing::debug!(
            width = metadata.width,
            height = metadata.height,
            frames = metadata.frame_count,
            "lottie composition loaded"
        );
        Ok(metadata)
    }

    pub fn metadata(&self) -> Option<AnimationMetadata> {
        self.metadata
    }

    /// Rasterize frames `0..=duration`, each with delay `round(1000 / fr)`.
    pub fn produce_frames(&mut self, sink: &mut dyn FrameSink) -> StickerResult<()> {
        let (Some(rasterizer), Some(metadata)) = (self.rasterizer.as_ref(), self.metadata) else {
            return Err(DecodeError::NotInitialized.into());
        };
        if self.consumed {
            return Err(DecodeError::AlreadyConsumed.into());
        }
        self.consumed = true;

        let delay_ms = match metadata.timing {
            FrameTiming::Rate { fps } => delay_for_fps(fps),
            FrameTiming::Delay { ms } => ms,
        };
        for index in 0..=metadata.frame_count {
            self.cancel.check()?;
            let buffer = rasterizer.render(index)?;
            sink.accept(Frame {
                buffer,
                index,
                delay_ms,
            })?;
        }
        Ok(())
    }

    pub fn release(&mut self) {
        self.rasterizer = None;
    }
}
