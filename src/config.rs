use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context as _;

use crate::{
    alpha::STRICT_BLACK_THRESHOLD,
    decode::VideoOptions,
    encode::ProcessBridge,
    error::{StickerError, StickerResult},
    media::FfmpegMediaBackend,
};

/// Pipeline settings supplied by the host application.
///
/// Load order: defaults, then a JSON file, then `STICKER_*` environment variables.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StickerConfig {
    /// Output frame rate. `None` uses the source's own rate.
    pub fps: Option<u32>,
    /// Cap on the longer output side for direct transcodes.
    pub max_dimension: u32,
    pub transparentize: bool,
    pub alpha_threshold: u8,
    pub ffmpeg_path: PathBuf,
    /// Defaults to `ffprobe` beside `ffmpeg_path`.
    pub ffprobe_path: Option<PathBuf>,
    pub poll_timeout_ms: u64,
    pub fallback_fps: f64,
    /// Extract a preview frame before direct transcodes.
    pub preview: bool,
}

impl Default for StickerConfig {
    fn default() -> Self {
        Self {
            fps: None,
            max_dimension: 512,
            transparentize: true,
            alpha_threshold: STRICT_BLACK_THRESHOLD,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: None,
            poll_timeout_ms: 10,
            fallback_fps: 30.0,
            preview: true,
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl StickerConfig {
    pub fn from_path(path: &Path) -> StickerResult<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        let cfg: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config '{}'", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `STICKER_*` overrides from `vars`. Unparsable values are ignored.
    pub fn apply_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let value = value.as_ref();
            match key.as_ref() {
                "STICKER_FFMPEG" if !value.trim().is_empty() => {
                    self.ffmpeg_path = PathBuf::from(value.trim());
                }
                "STICKER_FFPROBE" if !value.trim().is_empty() => {
                    self.ffprobe_path = Some(PathBuf::from(value.trim()));
                }
                "STICKER_FPS" => {
                    if let Some(fps) = value.trim().parse::<u32>().ok().filter(|&n| n > 0) {
                        self.fps = Some(fps);
                    }
                }
                "STICKER_MAX_DIMENSION" => {
                    if let Some(max) = value.trim().parse::<u32>().ok().filter(|&n| n > 0) {
                        self.max_dimension = max;
                    }
                }
                "STICKER_TRANSPARENTIZE" => {
                    if let Some(on) = parse_bool(value) {
                        self.transparentize = on;
                    }
                }
                "STICKER_ALPHA_THRESHOLD" => {
                    if let Ok(t) = value.trim().parse::<u8>() {
                        self.alpha_threshold = t;
                    }
                }
                _ => {}
            }
        }
        self
    }

    pub fn from_env(self) -> Self {
        self.apply_env(std::env::vars())
    }

    pub fn validate(&self) -> StickerResult<()> {
        if self.fps == Some(0) {
            return Err(StickerError::validation("fps must be non-zero"));
        }
        if self.max_dimension == 0 {
            return Err(StickerError::validation("max_dimension must be non-zero"));
        }
        if self.poll_timeout_ms == 0 {
            return Err(StickerError::validation("poll_timeout_ms must be non-zero"));
        }
        if !self.fallback_fps.is_finite() || self.fallback_fps <= 0.0 {
            return Err(StickerError::validation("fallback_fps must be positive"));
        }
        if self.ffmpeg_path.as_os_str().is_empty() {
            return Err(StickerError::validation("ffmpeg_path is empty"));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn video_options(&self) -> VideoOptions {
        VideoOptions {
            transparentize: self.transparentize,
            alpha_threshold: self.alpha_threshold,
            poll_timeout: self.poll_timeout(),
            fallback_fps: self.fallback_fps,
        }
    }

    pub fn bridge(&self) -> ProcessBridge {
        ProcessBridge::new(&self.ffmpeg_path)
    }

    pub fn media_backend(&self) -> FfmpegMediaBackend {
        let backend = FfmpegMediaBackend::new(&self.ffmpeg_path);
        match &self.ffprobe_path {
            Some(ffprobe) => backend.with_ffprobe(ffprobe),
            None => backend,
        }
    }
}
