use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::error::{DecodeError, StickerError, StickerResult};

/// Bytes per pixel of every raster produced by this crate (RGBA8, straight alpha).
pub const CHANNELS: usize = 4;

/// How a source describes the spacing of its frames.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum FrameTiming {
    /// Constant rate in frames per second.
    Rate { fps: f64 },
    /// Constant delay between frames in milliseconds.
    Delay { ms: u32 },
}

impl FrameTiming {
    /// Per-frame delay in whole milliseconds.
    pub fn delay_ms(self) -> u32 {
        match self {
            Self::Rate { fps } => delay_for_fps(fps),
            Self::Delay { ms } => ms,
        }
    }

    /// Integer frame rate suitable for an ffmpeg `-r` flag (at least 1).
    pub fn rate_hint(self) -> u32 {
        match self {
            Self::Rate { fps } => fps.round().max(1.0) as u32,
            Self::Delay { ms } if ms > 0 => ((1000.0 / f64::from(ms)).round() as u32).max(1),
            Self::Delay { .. } => 1,
        }
    }
}

/// `round(1000 / fps)`, or 0 for non-positive rates.
pub fn delay_for_fps(fps: f64) -> u32 {
    if fps <= 0.0 || !fps.is_finite() {
        return 0;
    }
    (1000.0 / fps).round() as u32
}

/// Size and timing of an animation, fixed once a source is initialized.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AnimationMetadata {
    pub width: u32,
    pub height: u32,
    /// Duration in frames for vector sources, in milliseconds for video sources.
    pub frame_count: u64,
    pub timing: FrameTiming,
}

impl AnimationMetadata {
    pub fn new(width: u32, height: u32, frame_count: u64, timing: FrameTiming) -> StickerResult<Self> {
        if width == 0 || height == 0 {
            return Err(StickerError::validation(format!(
                "animation size must be non-zero, got {width}x{height}"
            )));
        }
        Ok(Self {
            width,
            height,
            frame_count,
            timing,
        })
    }
}

/// Packed RGBA8 raster with an explicit row stride.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    stride: usize,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Fully transparent buffer without row padding.
    pub fn new(width: u32, height: u32) -> Self {
        let stride = width as usize * CHANNELS;
        Self {
            width,
            height,
            stride,
            data: vec![0; stride * height as usize],
        }
    }

    /// Wrap tightly packed RGBA8 bytes.
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> StickerResult<Self> {
        Self::from_strided(width, height, width as usize * CHANNELS, data)
    }

    /// Wrap RGBA8 rows that may carry trailing padding.
    pub fn from_strided(
        width: u32,
        height: u32,
        stride: usize,
        data: Vec<u8>,
    ) -> StickerResult<Self> {
        let row_bytes = width as usize * CHANNELS;
        if stride < row_bytes {
            return Err(StickerError::validation(format!(
                "row stride {stride} is smaller than {row_bytes} bytes of pixels"
            )));
        }
        let needed = match height as usize {
            0 => 0,
            h => stride * (h - 1) + row_bytes,
        };
        if data.len() < needed {
            return Err(StickerError::validation(format!(
                "pixel data has {} bytes, expected at least {needed}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            stride,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    fn row_bytes(&self) -> usize {
        self.width as usize * CHANNELS
    }

    pub fn is_tight(&self) -> bool {
        self.stride == self.row_bytes()
            && self.data.len() == self.row_bytes() * self.height as usize
    }

    /// Copy rows into a padding-free buffer; tight buffers are returned as is.
    pub fn into_tight(self) -> Self {
        if self.is_tight() {
            return self;
        }
        let row_bytes = self.row_bytes();
        let mut data = Vec::with_capacity(row_bytes * self.height as usize);
        for y in 0..self.height as usize {
            let start = y * self.stride;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        Self {
            width: self.width,
            height: self.height,
            stride: row_bytes,
            data,
        }
    }

    /// Raw bytes including any row padding.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.data[start..start + self.row_bytes()]
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = y as usize * self.stride + x as usize * CHANNELS;
        [
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let i = y as usize * self.stride + x as usize * CHANNELS;
        self.data[i..i + CHANNELS].copy_from_slice(&rgba);
    }

    pub fn fill(&mut self, rgba: [u8; 4]) {
        for y in 0..self.height {
            for x in 0..self.width {
                self.set_pixel(x, y, rgba);
            }
        }
    }

    /// Tight RGBA8 bytes, consuming the buffer.
    pub fn into_raw(self) -> Vec<u8> {
        self.into_tight().data
    }

    pub fn into_rgba_image(self) -> StickerResult<image::RgbaImage> {
        let (w, h) = (self.width, self.height);
        image::RgbaImage::from_raw(w, h, self.into_raw())
            .ok_or_else(|| StickerError::validation("pixel buffer does not match its dimensions"))
    }
}

impl From<image::RgbaImage> for PixelBuffer {
    fn from(img: image::RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            stride: width as usize * CHANNELS,
            data: img.into_raw(),
        }
    }
}

/// One produced raster plus its position in the sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub buffer: PixelBuffer,
    /// Frame number for vector sources, presentation time in ms for video sources.
    pub index: u64,
    pub delay_ms: u32,
}

/// Shared flag that asks a running job to stop at its next poll.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> StickerResult<()> {
        if self.is_cancelled() {
            return Err(DecodeError::Cancelled.into());
        }
        Ok(())
    }
}
