use std::{sync::Arc, time::Duration};

use crate::{
    alpha::{STRICT_BLACK_THRESHOLD, flood_fill_edge_black},
    color::yuv420_to_rgba,
    core::{AnimationMetadata, CancelToken, Frame, FrameTiming, PixelBuffer},
    decode::FrameSink,
    error::{DecodeError, StickerError, StickerResult},
    media::{
        ByteSource, DecodedImage, Demuxer, MediaBackend, MemorySource, MetadataRetriever,
        TrackFormat, VideoCodec,
    },
};

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VideoOptions {
    /// Key the border-connected black background to transparency.
    pub transparentize: bool,
    pub alpha_threshold: u8,
    /// Upper bound for each input/output dequeue poll.
    pub poll_timeout: Duration,
    /// Rate reported in metadata when the track declares no frame duration.
    pub fallback_fps: f64,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            transparentize: true,
            alpha_threshold: STRICT_BLACK_THRESHOLD,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            fallback_fps: 30.0,
        }
    }
}

/// Retriever, demuxer and decoder owned by one source. Released in that order, once.
struct CodecSession {
    retriever: Option<Box<dyn MetadataRetriever>>,
    demuxer: Option<Box<dyn Demuxer>>,
    decoder: Option<Box<dyn VideoCodec>>,
    format: TrackFormat,
}

impl CodecSession {
    fn release(&mut self) {
        if let Some(mut r) = self.retriever.take() {
            r.release();
        }
        if let Some(mut d) = self.demuxer.take() {
            d.release();
        }
        if let Some(mut c) = self.decoder.take() {
            c.release();
        }
    }
}

impl Drop for CodecSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Video sticker source driving a buffer-queue decoder.
pub struct VideoSource {
    bytes: Arc<[u8]>,
    options: VideoOptions,
    backend: Arc<dyn MediaBackend>,
    cancel: CancelToken,
    session: Option<CodecSession>,
    metadata: Option<AnimationMetadata>,
    consumed: bool,
}

impl VideoSource {
    pub fn new(
        bytes: impl Into<Arc<[u8]>>,
        options: VideoOptions,
        backend: Arc<dyn MediaBackend>,
    ) -> Self {
        Self {
            bytes: bytes.into(),
            options,
            backend,
            cancel: CancelToken::new(),
            session: None,
            metadata: None,
            consumed: false,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[tracing::instrument(skip(self), fields(bytes = self.bytes.len()))]
    pub fn initialize(&mut self) -> StickerResult<AnimationMetadata> {
        let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(Arc::clone(&self.bytes)));
        let mut session = CodecSession {
            retriever: Some(self.backend.open_retriever(Arc::clone(&source))?),
            demuxer: None,
            decoder: None,
            format: TrackFormat::default(),
        };
        session.demuxer = Some(self.backend.open_demuxer(source)?);

        // Dropping `session` on any early return releases what was acquired.
        let (track, format) = {
            let Some(demuxer) = session.demuxer.as_ref() else {
                return Err(DecodeError::NotInitialized.into());
            };
            (0..demuxer.track_count())
                .find_map(|i| demuxer.track_format(i).filter(TrackFormat::is_video).map(|f| (i, f)))
                .ok_or(DecodeError::NoVideoTrack)?
        };
        if let Some(demuxer) = session.demuxer.as_mut() {
            demuxer.select_track(track)?;
        }

        let (width, height, duration_ms) = match session.retriever.as_ref() {
            Some(r) => (
                r.video_width().filter(|&w| w > 0).unwrap_or(format.width),
                r.video_height().filter(|&h| h > 0).unwrap_or(format.height),
                r.duration_ms().unwrap_or(0),
            ),
            None => (format.width, format.height, 0),
        };
        let timing = match format.default_duration_ns {
            Some(ns) if ns > 0 => FrameTiming::Rate {
                fps: 1e9 / ns as f64,
            },
            _ => FrameTiming::Rate {
                fps: self.options.fallback_fps,
            },
        };
        let metadata = AnimationMetadata::new(width, height, duration_ms, timing)?;

        tracing::debug!(
            track,
            mime = %format.mime,
            width,
            height,
            duration_ms,
            "selected video track"
        );
        session.format = format;
        self.session = Some(session);
        self.metadata = Some(metadata);
        Ok(metadata)
    }

    pub fn metadata(&self) -> Option<AnimationMetadata> {
        self.metadata
    }

    /// Drain the decoder until both input and output have reached end of stream.
    pub fn produce_frames(&mut self, sink: &mut dyn FrameSink) -> StickerResult<()> {
        if self.consumed {
            return Err(DecodeError::AlreadyConsumed.into());
        }
        let Some(session) = self.session.as_mut() else {
            return Err(DecodeError::NotInitialized.into());
        };
        self.consumed = true;

        if session.decoder.is_none() {
            session.decoder = Some(self.backend.create_decoder(&session.format)?);
        }
        let (Some(demuxer), Some(decoder)) = (session.demuxer.as_mut(), session.decoder.as_mut())
        else {
            return Err(DecodeError::NotInitialized.into());
        };

        let timeout = self.options.poll_timeout;
        let mut input_eos = false;
        let mut output_eos = false;
        let mut last_pts_ms: u64 = 0;
        let mut emitted: u64 = 0;

        while !output_eos {
            self.cancel.check()?;

            if !input_eos && let Some(slot) = decoder.dequeue_input_buffer(timeout)? {
                let buf = decoder.input_buffer(slot)?;
                match demuxer.read_sample_data(buf)? {
                    Some(size) => {
                        let pts_us = demuxer.sample_time_us().unwrap_or(0);
                        decoder.queue_input_buffer(slot, size, pts_us, false)?;
                        demuxer.advance()?;
                    }
                    None => {
                        decoder.queue_input_buffer(slot, 0, 0, true)?;
                        input_eos = true;
                        tracing::trace!("queued input end of stream");
                    }
                }
            }

            let Some((id, info)) = decoder.dequeue_output_buffer(timeout)? else {
                continue;
            };
            let emitted_frame = if info.size > 0 {
                let result = decoder.output_image(id).and_then(|image| {
                    let Some(image) = image else {
                        return Ok(false);
                    };
                    let buffer = normalize_image(image, &self.options)?;
                    let pts_ms = u64::try_from(info.pts_us / 1000).unwrap_or(0);
                    let delay_ms = u32::try_from(pts_ms.saturating_sub(last_pts_ms)).unwrap_or(u32::MAX);
                    sink.accept(Frame {
                        buffer,
                        index: pts_ms,
                        delay_ms,
                    })?;
                    last_pts_ms = pts_ms;
                    Ok(true)
                });
                decoder.release_output_buffer(id);
                result?
            } else {
                decoder.release_output_buffer(id);
                false
            };
            if emitted_frame {
                emitted += 1;
            }
            if info.end_of_stream {
                output_eos = true;
            }
        }

        tracing::debug!(frames = emitted, "video decode finished");
        Ok(())
    }

    /// Release the retriever, demuxer and decoder. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.release();
        }
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Bring any supported decoder output into a tight straight-alpha RGBA buffer.
pub fn normalize_image(image: DecodedImage, options: &VideoOptions) -> StickerResult<PixelBuffer> {
    match image {
        DecodedImage::Yuv420(yuv) => {
            let rgba = yuv420_to_rgba(&yuv)?;
            if options.transparentize {
                Ok(flood_fill_edge_black(&rgba, options.alpha_threshold))
            } else {
                Ok(rgba)
            }
        }
        DecodedImage::Jpeg { data } => {
            let decoded = image::load_from_memory(&data).map_err(|e| {
                StickerError::codec(format!("failed to decode compressed frame: {e}"))
            })?;
            Ok(PixelBuffer::from(decoded.to_rgba8()))
        }
        DecodedImage::Rgba {
            width,
            height,
            row_stride,
            data,
        } => Ok(PixelBuffer::from_strided(width, height, row_stride, data)?.into_tight()),
        DecodedImage::Other { format, .. } => Err(DecodeError::UnsupportedPixelFormat(format).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::{ColorRange, Plane, Yuv420Image};

    #[test]
    fn yuv_is_keyed_only_when_requested() {
        let yuv = Yuv420Image {
            width: 2,
            height: 2,
            y: Plane::tight(vec![16; 4], 2),
            u: Plane::tight(vec![128], 1),
            v: Plane::tight(vec![128], 1),
            range: ColorRange::Limited,
        };
        let keyed = normalize_image(DecodedImage::Yuv420(yuv.clone()), &VideoOptions::default())
            .unwrap();
        assert_eq!(keyed.pixel(0, 0), [0, 0, 0, 0]);

        let opts = VideoOptions {
            transparentize: false,
            ..VideoOptions::default()
        };
        let opaque = normalize_image(DecodedImage::Yuv420(yuv), &opts).unwrap();
        assert_eq!(opaque.pixel(0, 0), [0, 0, 0, 255]);
    }

    #[test]
    fn padded_rgba_becomes_tight() {
        let mut data = vec![0xAA; 2 * 12];
        data[0..4].copy_from_slice(&[1, 2, 3, 4]);
        let img = DecodedImage::Rgba {
            width: 2,
            height: 2,
            row_stride: 12,
            data,
        };
        let buf = normalize_image(img, &VideoOptions::default()).unwrap();
        assert!(buf.is_tight());
        assert_eq!(buf.pixel(0, 0), [1, 2, 3, 4]);
    }

    #[test]
    fn other_layouts_are_unsupported() {
        let img = DecodedImage::Other {
            width: 2,
            height: 2,
            format: "P010".into(),
        };
        let err = normalize_image(img, &VideoOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            StickerError::Decode(DecodeError::UnsupportedPixelFormat(_))
        ));
    }
}
