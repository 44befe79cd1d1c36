use std::{
    collections::VecDeque,
    io::Cursor,
    path::Path,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use sticker_gif::{
    CancelToken, DecodeError, FfmpegMediaBackend, Frame, FrameSource, StickerError,
    StickerResult, VideoOptions, Yuv420Image, is_ffmpeg_on_path,
    media::{
        BufferInfo, ByteSource, DecodedImage, Demuxer, MediaBackend, MemorySource,
        MetadataRetriever, TrackFormat, VideoCodec,
    },
};

type Log = Arc<Mutex<Vec<&'static str>>>;

struct ScriptedRetriever {
    log: Log,
}

impl MetadataRetriever for ScriptedRetriever {
    fn video_width(&self) -> Option<u32> {
        Some(4)
    }
    fn video_height(&self) -> Option<u32> {
        Some(2)
    }
    fn duration_ms(&self) -> Option<u64> {
        Some(100)
    }
    fn release(&mut self) {
        self.log.lock().unwrap().push("retriever");
    }
}

struct ScriptedDemuxer {
    tracks: Vec<TrackFormat>,
    samples: Vec<(i64, Vec<u8>)>,
    cursor: usize,
    log: Log,
}

impl Demuxer for ScriptedDemuxer {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }
    fn track_format(&self, index: usize) -> Option<TrackFormat> {
        self.tracks.get(index).cloned()
    }
    fn select_track(&mut self, _index: usize) -> StickerResult<()> {
        Ok(())
    }
    fn read_sample_data(&mut self, buf: &mut Vec<u8>) -> StickerResult<Option<usize>> {
        let Some((_, data)) = self.samples.get(self.cursor) else {
            return Ok(None);
        };
        buf.clear();
        buf.extend_from_slice(data);
        Ok(Some(data.len()))
    }
    fn sample_time_us(&self) -> Option<i64> {
        self.samples.get(self.cursor).map(|(pts, _)| *pts)
    }
    fn advance(&mut self) -> StickerResult<bool> {
        self.cursor += 1;
        Ok(self.cursor < self.samples.len())
    }
    fn release(&mut self) {
        self.log.lock().unwrap().push("demuxer");
    }
}

/// Echoes each queued sample back as one decoded output.
struct EchoCodec {
    input: Vec<u8>,
    pending: VecDeque<(i64, bool)>,
    image: DecodedImage,
    outstanding: Arc<Mutex<i64>>,
    eos_queued: bool,
    log: Log,
}

impl VideoCodec for EchoCodec {
    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> StickerResult<Option<usize>> {
        Ok((!self.eos_queued).then_some(0))
    }
    fn input_buffer(&mut self, _id: usize) -> StickerResult<&mut Vec<u8>> {
        Ok(&mut self.input)
    }
    fn queue_input_buffer(
        &mut self,
        _id: usize,
        _size: usize,
        pts_us: i64,
        end_of_stream: bool,
    ) -> StickerResult<()> {
        self.eos_queued |= end_of_stream;
        self.pending.push_back((pts_us, end_of_stream));
        Ok(())
    }
    fn dequeue_output_buffer(
        &mut self,
        _timeout: Duration,
    ) -> StickerResult<Option<(usize, BufferInfo)>> {
        let Some((pts_us, eos)) = self.pending.pop_front() else {
            return Ok(None);
        };
        *self.outstanding.lock().unwrap() += 1;
        Ok(Some((
            1,
            BufferInfo {
                size: if eos { 0 } else { 32 },
                pts_us,
                end_of_stream: eos,
            },
        )))
    }
    fn output_image(&mut self, _id: usize) -> StickerResult<Option<DecodedImage>> {
        Ok(Some(self.image.clone()))
    }
    fn release_output_buffer(&mut self, _id: usize) {
        *self.outstanding.lock().unwrap() -= 1;
    }
    fn release(&mut self) {
        self.log.lock().unwrap().push("decoder");
    }
}

struct ScriptedBackend {
    tracks: Vec<TrackFormat>,
    samples: Vec<(i64, Vec<u8>)>,
    image: DecodedImage,
    log: Log,
    outstanding: Arc<Mutex<i64>>,
}

impl ScriptedBackend {
    fn new(tracks: Vec<TrackFormat>, pts_us: &[i64], image: DecodedImage) -> Self {
        Self {
            tracks,
            samples: pts_us.iter().map(|&p| (p, vec![0u8; 8])).collect(),
            image,
            log: Arc::default(),
            outstanding: Arc::default(),
        }
    }
}

impl MediaBackend for ScriptedBackend {
    fn open_retriever(
        &self,
        _source: Arc<dyn ByteSource>,
    ) -> StickerResult<Box<dyn MetadataRetriever>> {
        Ok(Box::new(ScriptedRetriever {
            log: Arc::clone(&self.log),
        }))
    }

    fn open_demuxer(&self, _source: Arc<dyn ByteSource>) -> StickerResult<Box<dyn Demuxer>> {
        Ok(Box::new(ScriptedDemuxer {
            tracks: self.tracks.clone(),
            samples: self.samples.clone(),
            cursor: 0,
            log: Arc::clone(&self.log),
        }))
    }

    fn create_decoder(&self, _format: &TrackFormat) -> StickerResult<Box<dyn VideoCodec>> {
        Ok(Box::new(EchoCodec {
            input: Vec::new(),
            pending: VecDeque::new(),
            image: self.image.clone(),
            outstanding: Arc::clone(&self.outstanding),
            eos_queued: false,
            log: Arc::clone(&self.log),
        }))
    }
}

fn vp9_track() -> TrackFormat {
    TrackFormat {
        mime: "video/x-vnd.on2.vp9".to_string(),
        codec_id: "vp9".to_string(),
        width: 4,
        height: 2,
        ..TrackFormat::default()
    }
}

fn opus_track() -> TrackFormat {
    TrackFormat {
        mime: "audio/opus".to_string(),
        codec_id: "opus".to_string(),
        ..TrackFormat::default()
    }
}

fn red_rgba() -> DecodedImage {
    DecodedImage::Rgba {
        width: 4,
        height: 2,
        row_stride: 16,
        data: [255u8, 0, 0, 255].repeat(8),
    }
}

fn collect(source: &mut FrameSource) -> StickerResult<Vec<Frame>> {
    let mut frames = Vec::new();
    source.produce_frames(&mut |f: Frame| -> StickerResult<()> {
        frames.push(f);
        Ok(())
    })?;
    Ok(frames)
}

#[test]
fn frames_follow_presentation_time() {
    let backend = Arc::new(ScriptedBackend::new(
        vec![opus_track(), vp9_track()],
        &[0, 33_000, 66_000, 100_000],
        red_rgba(),
    ));
    let mut source = FrameSource::video(vec![0u8; 4], VideoOptions::default(), backend.clone());
    let meta = source.initialize().unwrap();
    assert_eq!((meta.width, meta.height), (4, 2));
    assert_eq!(meta.frame_count, 100);

    let frames = collect(&mut source).unwrap();
    let indices: Vec<u64> = frames.iter().map(|f| f.index).collect();
    let delays: Vec<u32> = frames.iter().map(|f| f.delay_ms).collect();
    assert_eq!(indices, vec![0, 33, 66, 100]);
    assert_eq!(delays, vec![0, 33, 33, 34]);
    assert_eq!(frames[0].buffer.pixel(3, 1), [255, 0, 0, 255]);
    assert_eq!(*backend.outstanding.lock().unwrap(), 0);

    source.release();
    assert_eq!(
        *backend.log.lock().unwrap(),
        vec!["retriever", "demuxer", "decoder"]
    );
}

#[test]
fn second_pass_is_rejected() {
    let backend = Arc::new(ScriptedBackend::new(vec![vp9_track()], &[0], red_rgba()));
    let mut source = FrameSource::video(vec![0u8; 4], VideoOptions::default(), backend);
    source.initialize().unwrap();
    collect(&mut source).unwrap();
    let err = collect(&mut source).unwrap_err();
    assert!(matches!(
        err,
        StickerError::Decode(DecodeError::AlreadyConsumed)
    ));
}

#[test]
fn audio_only_input_fails_before_any_frame() {
    let backend = Arc::new(ScriptedBackend::new(vec![opus_track()], &[0], red_rgba()));
    let mut source = FrameSource::video(vec![0u8; 4], VideoOptions::default(), backend.clone());
    let err = source.initialize().unwrap_err();
    assert!(matches!(err, StickerError::Decode(DecodeError::NoVideoTrack)));

    let mut calls = 0;
    let err = source
        .produce_frames(&mut |_f: Frame| -> StickerResult<()> {
            calls += 1;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(
        err,
        StickerError::Decode(DecodeError::NotInitialized)
    ));
    assert_eq!(calls, 0);
    // The partially opened session was released on the failed initialize.
    assert_eq!(*backend.log.lock().unwrap(), vec!["retriever", "demuxer"]);
}

#[test]
fn unsupported_layout_still_returns_the_buffer() {
    let image = DecodedImage::Other {
        width: 4,
        height: 2,
        format: "P010".to_string(),
    };
    let backend = Arc::new(ScriptedBackend::new(vec![vp9_track()], &[0, 40_000], image));
    let mut source = FrameSource::video(vec![0u8; 4], VideoOptions::default(), backend.clone());
    source.initialize().unwrap();
    let err = collect(&mut source).unwrap_err();
    assert!(matches!(
        err,
        StickerError::Decode(DecodeError::UnsupportedPixelFormat(_))
    ));
    assert_eq!(*backend.outstanding.lock().unwrap(), 0);
}

#[test]
fn compressed_frames_are_decoded() {
    let mut png = Vec::new();
    image::RgbaImage::from_pixel(4, 2, image::Rgba([0, 0, 255, 255]))
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();
    let backend = Arc::new(ScriptedBackend::new(
        vec![vp9_track()],
        &[0],
        DecodedImage::Jpeg { data: png },
    ));
    let mut source = FrameSource::video(vec![0u8; 4], VideoOptions::default(), backend);
    source.initialize().unwrap();
    let frames = collect(&mut source).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].buffer.pixel(0, 0), [0, 0, 255, 255]);
}

#[test]
fn cancelled_decode_stops_early() {
    let backend = Arc::new(ScriptedBackend::new(vec![vp9_track()], &[0, 40_000], red_rgba()));
    let cancel = CancelToken::new();
    let mut source = FrameSource::video(vec![0u8; 4], VideoOptions::default(), backend)
        .with_cancel(cancel.clone());
    source.initialize().unwrap();
    cancel.cancel();
    let err = collect(&mut source).unwrap_err();
    assert!(matches!(err, StickerError::Decode(DecodeError::Cancelled)));
}

#[test]
fn first_delay_counts_from_time_zero() {
    let backend = Arc::new(ScriptedBackend::new(
        vec![vp9_track()],
        &[40_000, 80_000],
        red_rgba(),
    ));
    let mut source = FrameSource::video(vec![0u8; 4], VideoOptions::default(), backend);
    source.initialize().unwrap();
    let frames = collect(&mut source).unwrap();
    let indices: Vec<u64> = frames.iter().map(|f| f.index).collect();
    let delays: Vec<u32> = frames.iter().map(|f| f.delay_ms).collect();
    assert_eq!(indices, vec![40, 80]);
    assert_eq!(delays, vec![40, 40]);
}

/// 4x2 frame: black everywhere except a white 2x1 patch in the bottom row.
fn black_border_i420() -> DecodedImage {
    let mut data = vec![16, 16, 16, 16, 16, 235, 235, 16];
    data.extend_from_slice(&[128; 4]);
    DecodedImage::Yuv420(Yuv420Image::from_i420(4, 2, &data).unwrap())
}

#[test]
fn planar_output_is_keyed_only_when_transparentize_is_set() {
    for (transparentize, corner) in [(true, [0, 0, 0, 0]), (false, [0, 0, 0, 255])] {
        let backend = Arc::new(ScriptedBackend::new(
            vec![vp9_track()],
            &[0],
            black_border_i420(),
        ));
        let options = VideoOptions {
            transparentize,
            ..VideoOptions::default()
        };
        let mut source = FrameSource::video(vec![0u8; 4], options, backend.clone());
        source.initialize().unwrap();
        let frames = collect(&mut source).unwrap();
        assert_eq!(frames.len(), 1);
        let buffer = &frames[0].buffer;
        assert_eq!((buffer.width(), buffer.height()), (4, 2));
        assert_eq!(buffer.pixel(0, 0), corner, "transparentize = {transparentize}");
        let patch = buffer.pixel(1, 1);
        assert_eq!(patch[3], 255);
        assert!(patch[0] >= 250, "{patch:?}");
        assert_eq!(*backend.outstanding.lock().unwrap(), 0);
    }
}

fn element(id: &[u8], body: &[u8]) -> Vec<u8> {
    let mut out = id.to_vec();
    out.push(0x01);
    out.extend_from_slice(&(body.len() as u64).to_be_bytes()[1..]);
    out.extend_from_slice(body);
    out
}

/// WebM whose only track declares a 2^55 byte CodecPrivate inside a 14 byte entry.
fn oversized_codec_private_webm() -> Vec<u8> {
    let mut doc = element(&[0x1A, 0x45, 0xDF, 0xA3], &element(&[0x42, 0x82], b"webm"));
    let mut entry = element(&[0xD7], &[1]);
    entry.extend_from_slice(&[0x63, 0xA2, 0x01, 0x80, 0, 0, 0, 0, 0, 0]);
    let tracks = element(&[0x16, 0x54, 0xAE, 0x6B], &element(&[0xAE], &entry));
    doc.extend(element(&[0x18, 0x53, 0x80, 0x67], &tracks));
    doc
}

#[test]
fn oversized_element_sizes_are_an_error() {
    let backend = Arc::new(FfmpegMediaBackend::default());
    let bytes = oversized_codec_private_webm();
    // Opening either half must return, whether or not the tools accept the file.
    let source: Arc<dyn ByteSource> = Arc::new(MemorySource::new(bytes.clone()));
    if let Ok(mut retriever) = backend.open_retriever(Arc::clone(&source)) {
        assert_eq!(retriever.video_width(), None);
        retriever.release();
    }
    if let Ok(mut demuxer) = backend.open_demuxer(source) {
        let formats: Vec<TrackFormat> = (0..demuxer.track_count())
            .filter_map(|i| demuxer.track_format(i))
            .collect();
        assert!(formats.iter().all(|f| !f.is_video()));
        demuxer.release();
    }

    let mut frames = FrameSource::video(bytes, VideoOptions::default(), backend);
    assert!(frames.initialize().is_err());
}

fn tools_available() -> bool {
    let ffprobe = std::process::Command::new("ffprobe")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success());
    ffprobe && is_ffmpeg_on_path()
}

/// Render a lavfi source to WebM. `None` when this ffmpeg build lacks the encoder.
fn render_webm(dir: &Path, name: &str, args: &[&str]) -> Option<Vec<u8>> {
    let out = dir.join(name);
    let status = std::process::Command::new("ffmpeg")
        .args(["-nostdin", "-hide_banner", "-loglevel", "error", "-y"])
        .args(args)
        .arg(&out)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .ok()?;
    if !status.success() {
        return None;
    }
    std::fs::read(out).ok()
}

#[test]
fn real_container_without_video_is_rejected() {
    if !tools_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let Some(webm) = render_webm(
        dir.path(),
        "tone.webm",
        &["-f", "lavfi", "-i", "sine=frequency=440:duration=0.2", "-c:a", "libopus"],
    ) else {
        return;
    };
    let backend = Arc::new(FfmpegMediaBackend::default());
    let mut source = FrameSource::video(webm, VideoOptions::default(), backend);
    let err = source.initialize().unwrap_err();
    assert!(matches!(err, StickerError::Decode(DecodeError::NoVideoTrack)));
}

#[test]
fn real_vp9_clip_decodes_with_keyed_background() {
    if !tools_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let Some(webm) = render_webm(
        dir.path(),
        "box.webm",
        &[
            "-f",
            "lavfi",
            "-i",
            "color=c=black:s=32x16:r=10:d=0.3",
            "-vf",
            "drawbox=x=8:y=4:w=16:h=8:color=white:t=fill",
            "-pix_fmt",
            "yuv420p",
            "-c:v",
            "libvpx-vp9",
        ],
    ) else {
        return;
    };
    let options = VideoOptions {
        alpha_threshold: 24,
        ..VideoOptions::default()
    };
    let backend = Arc::new(FfmpegMediaBackend::default());
    let mut source = FrameSource::video(webm, options, backend);
    let meta = source.initialize().unwrap();
    assert_eq!((meta.width, meta.height), (32, 16));

    let frames = collect(&mut source).unwrap();
    source.release();
    assert_eq!(frames.len(), 3);
    let delays: Vec<u32> = frames.iter().map(|f| f.delay_ms).collect();
    assert_eq!(delays, vec![0, 100, 100]);
    for f in &frames {
        assert_eq!(f.buffer.pixel(0, 0)[3], 0);
        let center = f.buffer.pixel(16, 8);
        assert_eq!(center[3], 255);
        assert!(center[0] > 200, "{center:?}");
    }
}
