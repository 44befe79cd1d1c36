#![forbid(unsafe_code)]
//! Sticker conversion: Lottie and WebM sources decoded to RGBA frames, black backgrounds
//! keyed to transparency, and frames palettized into looping GIFs through ffmpeg.

pub mod alpha;
pub mod color;
pub mod config;
pub mod core;
pub mod decode;
pub mod encode;
pub mod error;
pub mod lottie;
pub mod media;
pub mod pipeline;

pub use alpha::{AlphaKeyer, flood_fill_edge_black};
pub use color::{ColorRange, Plane, Yuv420Image, yuv420_to_rgba};
pub use config::StickerConfig;
pub use core::{AnimationMetadata, CancelToken, Frame, FrameTiming, PixelBuffer};
pub use decode::{FrameSink, FrameSource, LottieSource, VideoOptions, VideoSource};
pub use encode::{
    EncodeJob, Encoder, FfmpegGifEncoder, LogCallback, LogLevel, LogLine, MemoryEncoder,
    ProcessBridge, Statistics, StatisticsCallback, is_ffmpeg_available, is_ffmpeg_on_path,
    scaled_dimensions,
};
pub use error::{DecodeError, EncodeError, StickerError, StickerResult};
pub use media::{FfmpegMediaBackend, MediaBackend};
pub use pipeline::{
    JobHandle, JobOutput, StickerJob, StickerKind, encode_frames, run_job, spawn_job,
    transcode_webm,
};
