//! Container and codec seams used by the video frame source.
//!
//! The decode loop in [`crate::decode::video`] only talks to the traits defined here.
//! [`FfmpegMediaBackend`] provides the production implementation: `ffprobe` for container
//! facts, an ffmpeg stream copy as the demuxer and an ffmpeg child process as the decoder
//! session.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::{
    color::Yuv420Image,
    error::{StickerError, StickerResult},
};

pub mod container;
pub mod ffmpeg_codec;

pub use container::{ContainerRetriever, FfmpegDemuxer, IvfReader, MAX_SAMPLE_BYTES};
pub use ffmpeg_codec::FfmpegCodec;

/// Random-access view over encoded media bytes.
pub trait ByteSource: Send + Sync {
    fn size(&self) -> u64;

    /// Copy up to `buf.len()` bytes starting at `offset`. `None` means end of data.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Option<usize>;
}

#[derive(Clone, Debug)]
pub struct MemorySource(Arc<[u8]>);

impl MemorySource {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }
}

impl ByteSource for MemorySource {
    fn size(&self) -> u64 {
        self.0.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Option<usize> {
        let start = usize::try_from(offset).ok()?;
        if start >= self.0.len() {
            return None;
        }
        let n = buf.len().min(self.0.len() - start);
        buf[..n].copy_from_slice(&self.0[start..start + n]);
        Some(n)
    }
}

/// Fill `buf` completely from `offset` or fail with a container error.
pub(crate) fn read_exact_at(src: &dyn ByteSource, offset: u64, buf: &mut [u8]) -> StickerResult<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read_at(offset + filled as u64, &mut buf[filled..]) {
            Some(0) | None => {
                return Err(StickerError::container(format!(
                    "unexpected end of data at offset {}",
                    offset + filled as u64
                )));
            }
            Some(n) => filled += n,
        }
    }
    Ok(())
}

/// Stream description for one container track.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackFormat {
    /// `video/x-vnd.on2.vp9`, `audio/opus`, ...
    pub mime: String,
    pub codec_id: String,
    pub width: u32,
    pub height: u32,
    pub default_duration_ns: Option<u64>,
}

impl TrackFormat {
    pub fn is_video(&self) -> bool {
        self.mime.starts_with("video/")
    }
}

/// Container-level facts, available before any sample is decoded.
pub trait MetadataRetriever: Send {
    fn video_width(&self) -> Option<u32>;
    fn video_height(&self) -> Option<u32>;
    fn duration_ms(&self) -> Option<u64>;
    fn release(&mut self);
}

/// Splits a container into per-track compressed samples.
pub trait Demuxer: Send {
    fn track_count(&self) -> usize;
    fn track_format(&self, index: usize) -> Option<TrackFormat>;
    fn select_track(&mut self, index: usize) -> StickerResult<()>;

    /// Copy the current sample into `buf`. `None` once the selected track is exhausted.
    fn read_sample_data(&mut self, buf: &mut Vec<u8>) -> StickerResult<Option<usize>>;

    /// Presentation time of the current sample in microseconds.
    fn sample_time_us(&self) -> Option<i64>;

    /// Move to the next sample. Returns `false` at end of stream.
    fn advance(&mut self) -> StickerResult<bool>;

    fn release(&mut self);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferInfo {
    pub size: usize,
    pub pts_us: i64,
    pub end_of_stream: bool,
}

/// Image layout handed out for one decoded output buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodedImage {
    /// Planar or semi-planar 4:2:0.
    Yuv420(Yuv420Image),
    /// Single compressed plane (still-image codecs).
    Jpeg { data: Vec<u8> },
    /// Packed RGBA8, rows possibly padded.
    Rgba {
        width: u32,
        height: u32,
        row_stride: usize,
        data: Vec<u8>,
    },
    Other {
        width: u32,
        height: u32,
        format: String,
    },
}

/// Stateful buffer-queue decoder session.
///
/// Input and output slots are identified by ids handed out by the dequeue calls. Every
/// dequeued output must be returned with [`VideoCodec::release_output_buffer`] or the
/// session stalls.
pub trait VideoCodec: Send {
    fn dequeue_input_buffer(&mut self, timeout: Duration) -> StickerResult<Option<usize>>;
    fn input_buffer(&mut self, id: usize) -> StickerResult<&mut Vec<u8>>;
    fn queue_input_buffer(
        &mut self,
        id: usize,
        size: usize,
        pts_us: i64,
        end_of_stream: bool,
    ) -> StickerResult<()>;
    fn dequeue_output_buffer(
        &mut self,
        timeout: Duration,
    ) -> StickerResult<Option<(usize, BufferInfo)>>;
    fn output_image(&mut self, id: usize) -> StickerResult<Option<DecodedImage>>;
    fn release_output_buffer(&mut self, id: usize);
    fn release(&mut self);
}

/// Factory for the three collaborators of a video decode session.
pub trait MediaBackend: Send + Sync {
    fn open_retriever(&self, source: Arc<dyn ByteSource>)
    -> StickerResult<Box<dyn MetadataRetriever>>;
    fn open_demuxer(&self, source: Arc<dyn ByteSource>) -> StickerResult<Box<dyn Demuxer>>;
    fn create_decoder(&self, format: &TrackFormat) -> StickerResult<Box<dyn VideoCodec>>;
}

/// `ffprobe` next to `ffmpeg`, or the one on `PATH` for a bare program name.
pub fn sibling_ffprobe(ffmpeg: &Path) -> PathBuf {
    match ffmpeg.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => dir.join(format!("ffprobe{}", std::env::consts::EXE_SUFFIX)),
        None => PathBuf::from("ffprobe"),
    }
}

/// Demuxing and decoding through the ffmpeg command-line tools.
#[derive(Clone, Debug)]
pub struct FfmpegMediaBackend {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

impl Default for FfmpegMediaBackend {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegMediaBackend {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        let ffmpeg_path = ffmpeg_path.into();
        Self {
            ffprobe_path: sibling_ffprobe(&ffmpeg_path),
            ffmpeg_path,
        }
    }

    pub fn with_ffprobe(mut self, ffprobe_path: impl Into<PathBuf>) -> Self {
        self.ffprobe_path = ffprobe_path.into();
        self
    }
}

impl MediaBackend for FfmpegMediaBackend {
    fn open_retriever(
        &self,
        source: Arc<dyn ByteSource>,
    ) -> StickerResult<Box<dyn MetadataRetriever>> {
        Ok(Box::new(ContainerRetriever::open(
            &self.ffprobe_path,
            source.as_ref(),
        )?))
    }

    fn open_demuxer(&self, source: Arc<dyn ByteSource>) -> StickerResult<Box<dyn Demuxer>> {
        Ok(Box::new(FfmpegDemuxer::open(
            &self.ffmpeg_path,
            &self.ffprobe_path,
            source.as_ref(),
        )?))
    }

    fn create_decoder(&self, format: &TrackFormat) -> StickerResult<Box<dyn VideoCodec>> {
        Ok(Box::new(FfmpegCodec::spawn(&self.ffmpeg_path, format)?))
    }
}
