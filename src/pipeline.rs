//! Decode → key → encode orchestration.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
};

use crate::{
    config::StickerConfig,
    core::{AnimationMetadata, CancelToken, Frame},
    decode::FrameSource,
    encode::{EncodeJob, Encoder, FfmpegGifEncoder, ProcessBridge},
    error::{StickerError, StickerResult},
    media::MediaBackend,
};

const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StickerKind {
    Lottie,
    Webm,
}

impl StickerKind {
    /// Sniff the input: EBML magic for WebM, a JSON object for Lottie.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&EBML_MAGIC) {
            return Some(Self::Webm);
        }
        match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => Some(Self::Lottie),
            _ => None,
        }
    }
}

/// One sticker to convert.
#[derive(Clone, Debug)]
pub struct StickerJob {
    pub id: String,
    pub bytes: Arc<[u8]>,
    pub kind: StickerKind,
    pub dst: PathBuf,
    pub config: StickerConfig,
    pub bridge: Option<ProcessBridge>,
}

impl StickerJob {
    /// Build a job, detecting the input kind from its bytes.
    pub fn new(
        id: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
        dst: impl Into<PathBuf>,
        config: StickerConfig,
    ) -> StickerResult<Self> {
        let bytes = bytes.into();
        let kind = StickerKind::detect(&bytes).ok_or_else(|| {
            StickerError::validation("input is neither a Lottie document nor a WebM file")
        })?;
        Ok(Self {
            id: id.into(),
            bytes,
            kind,
            dst: dst.into(),
            config,
            bridge: None,
        })
    }

    /// Use a preconfigured bridge (log/statistics callbacks) instead of the config default.
    pub fn with_bridge(mut self, bridge: ProcessBridge) -> Self {
        self.bridge = Some(bridge);
        self
    }

    fn bridge(&self) -> ProcessBridge {
        self.bridge.clone().unwrap_or_else(|| self.config.bridge())
    }

    pub fn frame_source(&self, backend: Arc<dyn MediaBackend>) -> FrameSource {
        match self.kind {
            StickerKind::Lottie => FrameSource::lottie(self.bytes.to_vec(), self.id.clone()),
            StickerKind::Webm => FrameSource::video(
                Arc::clone(&self.bytes),
                self.config.video_options(),
                backend,
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobOutput {
    pub path: Option<PathBuf>,
    pub metadata: AnimationMetadata,
    pub frames: u64,
}

/// Drain an initialized source into `encoder`: start, every frame in order, process.
pub fn encode_frames(
    source: &mut FrameSource,
    encoder: &mut Encoder,
) -> StickerResult<(Option<PathBuf>, u64)> {
    encoder.start()?;
    let mut frames = 0u64;
    source.produce_frames(&mut |frame: Frame| -> StickerResult<()> {
        frames += 1;
        encoder.add_frame(frame)
    })?;
    let path = encoder.process()?;
    Ok((path, frames))
}

/// Run one job through the frame pipeline. Source and encoder are released on every path.
#[tracing::instrument(skip_all, fields(id = %job.id, kind = ?job.kind, dst = %job.dst.display()))]
pub fn run_job(
    job: &StickerJob,
    backend: Arc<dyn MediaBackend>,
    cancel: CancelToken,
) -> StickerResult<JobOutput> {
    job.config.validate()?;
    let mut source = job.frame_source(backend).with_cancel(cancel);
    let result = run_source(job, &mut source);
    source.release();
    match &result {
        Ok(out) => tracing::info!(frames = out.frames, "sticker converted"),
        Err(e) => tracing::warn!(error = %e, "sticker conversion failed"),
    }
    result
}

fn run_source(job: &StickerJob, source: &mut FrameSource) -> StickerResult<JobOutput> {
    let metadata = source.initialize()?;
    let rate = job
        .config
        .fps
        .unwrap_or_else(|| metadata.timing.rate_hint());
    let encode_job = EncodeJob::new(&job.dst, rate).with_transparent(job.config.transparentize);
    let mut encoder = Encoder::ffmpeg(&encode_job, job.bridge())?;
    let result = encode_frames(source, &mut encoder);
    encoder.end();
    let (path, frames) = result?;
    Ok(JobOutput {
        path,
        metadata,
        frames,
    })
}

/// Convert WebM bytes straight to GIF with one ffmpeg pass, skipping frame buffering.
#[tracing::instrument(skip_all, fields(id = %job.id, dst = %job.dst.display()))]
pub fn transcode_webm<F>(job: &StickerJob, preview: F) -> StickerResult<PathBuf>
where
    F: FnOnce(&Path) -> StickerResult<()>,
{
    job.config.validate()?;
    if job.kind != StickerKind::Webm {
        return Err(StickerError::validation("direct transcode requires WebM input"));
    }
    let encode_job = EncodeJob::new(&job.dst, job.config.fps.unwrap_or(30))
        .with_max_dimension(job.config.max_dimension);
    let mut encoder =
        FfmpegGifEncoder::new(&encode_job, job.bridge())?.with_preview(job.config.preview);
    let result = encoder
        .start()
        .and_then(|()| encoder.transcode_video(&job.bytes, job.config.max_dimension, preview));
    encoder.end();
    result
}

/// Handle to a job running on a background worker thread.
pub struct JobHandle {
    handle: JoinHandle<StickerResult<JobOutput>>,
    cancel: CancelToken,
}

impl JobHandle {
    /// Ask the job to stop at its next poll. An in-flight ffmpeg run is not interrupted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> StickerResult<JobOutput> {
        self.handle
            .join()
            .map_err(|_| StickerError::Other(anyhow::anyhow!("sticker job thread panicked")))?
    }
}

pub fn spawn_job(job: StickerJob, backend: Arc<dyn MediaBackend>) -> StickerResult<JobHandle> {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let handle = std::thread::Builder::new()
        .name(format!("sticker-job-{}", job.id))
        .spawn(move || run_job(&job, backend, token))?;
    Ok(JobHandle { handle, cancel })
}
