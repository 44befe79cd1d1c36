//! Container access through ffmpeg's own tools.
//!
//! The encoded bytes are spilled to a temporary file once per opener. `ffprobe` lists the
//! streams and the duration; `ffmpeg -c copy -f ivf` re-muxes the selected video track onto
//! stdout, where it is read back one sample at a time.

use std::{
    io::{BufReader, Read, Write},
    path::{Path, PathBuf},
    process::{ChildStdout, Command, Stdio},
    thread::JoinHandle,
};

use anyhow::Context as _;
use tempfile::NamedTempFile;

use crate::{
    encode::bridge::ChildGuard,
    error::{DecodeError, StickerError, StickerResult},
    media::{
        ByteSource, Demuxer, MetadataRetriever, TrackFormat, ffmpeg_codec::read_frame,
        read_exact_at,
    },
};

const SPILL_CHUNK: usize = 64 * 1024;
const IVF_HEADER_LEN: usize = 32;
const IVF_FRAME_HEADER_LEN: usize = 12;

/// Largest compressed sample accepted from the IVF stream.
pub const MAX_SAMPLE_BYTES: usize = 16 * 1024 * 1024;

/// Copy the whole source into a temporary file the ffmpeg tools can open by path.
fn spill(source: &dyn ByteSource) -> StickerResult<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("sticker-media-")
        .suffix(".webm")
        .tempfile()
        .context("failed to create temporary media file")?;
    let size = source.size();
    let mut buf = vec![0u8; SPILL_CHUNK];
    let mut offset = 0u64;
    while offset < size {
        let len = SPILL_CHUNK.min(usize::try_from(size - offset).unwrap_or(SPILL_CHUNK));
        read_exact_at(source, offset, &mut buf[..len])?;
        file.write_all(&buf[..len])
            .with_context(|| format!("failed to write '{}'", file.path().display()))?;
        offset += len as u64;
    }
    file.flush()
        .with_context(|| format!("failed to write '{}'", file.path().display()))?;
    Ok(file)
}

#[derive(Debug, serde::Deserialize)]
struct StreamInfo {
    index: usize,
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct FormatInfo {
    duration: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ContainerReport {
    #[serde(default)]
    streams: Vec<StreamInfo>,
    #[serde(default)]
    format: Option<FormatInfo>,
}

fn parse_ff_ratio(s: &str) -> Option<(u32, u32)> {
    let (num, den) = s.split_once('/')?;
    let num = num.trim().parse::<u32>().ok()?;
    let den = den.trim().parse::<u32>().ok()?;
    if num == 0 || den == 0 {
        return None;
    }
    Some((num, den))
}

fn mime_for(codec_type: &str, codec_name: &str) -> String {
    match codec_name {
        "vp8" => "video/x-vnd.on2.vp8".to_owned(),
        "vp9" => "video/x-vnd.on2.vp9".to_owned(),
        "av1" => "video/av01".to_owned(),
        "opus" => "audio/opus".to_owned(),
        "vorbis" => "audio/vorbis".to_owned(),
        other => format!("{codec_type}/{other}"),
    }
}

impl StreamInfo {
    fn track_format(&self) -> TrackFormat {
        let codec_type = self.codec_type.as_deref().unwrap_or("data");
        let codec_name = self.codec_name.as_deref().unwrap_or("unknown");
        let default_duration_ns = self
            .avg_frame_rate
            .as_deref()
            .and_then(parse_ff_ratio)
            .or_else(|| self.r_frame_rate.as_deref().and_then(parse_ff_ratio))
            .map(|(num, den)| 1_000_000_000 * u64::from(den) / u64::from(num));
        TrackFormat {
            mime: mime_for(codec_type, codec_name),
            codec_id: codec_name.to_owned(),
            width: self.width.unwrap_or(0),
            height: self.height.unwrap_or(0),
            default_duration_ns,
        }
    }
}

impl ContainerReport {
    fn parse(json: &[u8]) -> StickerResult<Self> {
        serde_json::from_slice(json)
            .map_err(|e| StickerError::container(format!("unreadable ffprobe output: {e}")))
    }

    fn video_stream(&self) -> Option<&StreamInfo> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
    }

    fn duration_ms(&self) -> Option<u64> {
        let secs = self
            .format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|s| s.is_finite() && *s >= 0.0)?;
        Some((secs * 1000.0).round() as u64)
    }
}

fn inspect(ffprobe: &Path, file: &Path) -> StickerResult<ContainerReport> {
    let out = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(file)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            StickerError::codec(format!("failed to run '{}': {e}", ffprobe.display()))
        })?;
    if !out.status.success() {
        return Err(StickerError::container(format!(
            "ffprobe rejected the container: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    ContainerReport::parse(&out.stdout)
}

/// Container facts read with `ffprobe`.
#[derive(Debug)]
pub struct ContainerRetriever {
    report: Option<ContainerReport>,
}

impl ContainerRetriever {
    pub fn open(ffprobe: &Path, source: &dyn ByteSource) -> StickerResult<Self> {
        let file = spill(source)?;
        let report = inspect(ffprobe, file.path())?;
        tracing::debug!(
            streams = report.streams.len(),
            duration_ms = ?report.duration_ms(),
            "read container streams"
        );
        Ok(Self {
            report: Some(report),
        })
    }
}

impl MetadataRetriever for ContainerRetriever {
    fn video_width(&self) -> Option<u32> {
        self.report.as_ref()?.video_stream()?.width
    }

    fn video_height(&self) -> Option<u32> {
        self.report.as_ref()?.video_stream()?.height
    }

    fn duration_ms(&self) -> Option<u64> {
        self.report.as_ref()?.duration_ms()
    }

    fn release(&mut self) {
        self.report = None;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IvfPacket {
    pub data: Vec<u8>,
    pub pts_us: i64,
}

/// Reads the IVF framing ffmpeg writes for VP8, VP9 and AV1 streams.
#[derive(Debug)]
pub struct IvfReader<R> {
    inner: R,
    rate: u32,
    scale: u32,
}

impl<R: Read> IvfReader<R> {
    pub fn new(mut inner: R) -> StickerResult<Self> {
        let mut header = [0u8; IVF_HEADER_LEN];
        inner
            .read_exact(&mut header)
            .map_err(|e| StickerError::container(format!("missing IVF header: {e}")))?;
        if &header[0..4] != b"DKIF" {
            return Err(StickerError::container("stream is not IVF"));
        }
        let header_len = usize::from(u16::from_le_bytes([header[6], header[7]]));
        if header_len > IVF_HEADER_LEN {
            let extra = (header_len - IVF_HEADER_LEN) as u64;
            std::io::copy(&mut (&mut inner).take(extra), &mut std::io::sink())
                .map_err(|e| StickerError::container(format!("truncated IVF header: {e}")))?;
        }
        let rate = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
        let scale = u32::from_le_bytes([header[20], header[21], header[22], header[23]]);
        if rate == 0 || scale == 0 {
            return Err(StickerError::container(format!(
                "IVF time base {scale}/{rate} is invalid"
            )));
        }
        Ok(Self { inner, rate, scale })
    }

    /// Next frame, or `None` at a clean end of stream.
    pub fn next_packet(&mut self) -> StickerResult<Option<IvfPacket>> {
        let mut header = [0u8; IVF_FRAME_HEADER_LEN];
        let more = read_frame(&mut self.inner, &mut header)
            .map_err(|e| StickerError::container(format!("truncated IVF frame header: {e}")))?;
        if !more {
            return Ok(None);
        }
        let size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if size > MAX_SAMPLE_BYTES {
            return Err(StickerError::container(format!(
                "IVF frame of {size} bytes exceeds the {MAX_SAMPLE_BYTES} byte limit"
            )));
        }
        let mut pts = [0u8; 8];
        pts.copy_from_slice(&header[4..]);
        let pts = i64::from_le_bytes(pts);

        let mut data = vec![0u8; size];
        self.inner
            .read_exact(&mut data)
            .map_err(|e| StickerError::container(format!("truncated IVF frame: {e}")))?;
        Ok(Some(IvfPacket {
            data,
            pts_us: self.to_micros(pts),
        }))
    }

    fn to_micros(&self, pts: i64) -> i64 {
        let us = i128::from(pts) * i128::from(self.scale) * 1_000_000 / i128::from(self.rate);
        us.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
    }
}

/// One running `-c copy -f ivf` re-mux of the selected track.
struct CopySession {
    child: ChildGuard,
    reader: IvfReader<BufReader<ChildStdout>>,
    current: Option<IvfPacket>,
    stderr: Option<JoinHandle<String>>,
}

impl CopySession {
    fn stderr_text(&mut self) -> String {
        self.stderr
            .take()
            .and_then(|t| t.join().ok())
            .map(|s| s.trim().to_owned())
            .unwrap_or_default()
    }

    /// Reap ffmpeg after its stream ended and surface a non-success exit.
    fn finish(&mut self) -> StickerResult<()> {
        let status = self.child.wait();
        let log = self.stderr_text();
        match status {
            Some(s) if s.success() => Ok(()),
            Some(s) => Err(StickerError::container(format!(
                "ffmpeg demux exited with {s}: {log}"
            ))),
            None => Ok(()),
        }
    }
}

/// Per-track samples extracted by an ffmpeg stream copy.
pub struct FfmpegDemuxer {
    ffmpeg: PathBuf,
    file: Option<NamedTempFile>,
    /// ffmpeg stream index and format of each track.
    tracks: Vec<(usize, TrackFormat)>,
    session: Option<CopySession>,
}

impl FfmpegDemuxer {
    pub fn open(ffmpeg: &Path, ffprobe: &Path, source: &dyn ByteSource) -> StickerResult<Self> {
        let file = spill(source)?;
        let report = inspect(ffprobe, file.path())?;
        let tracks = report
            .streams
            .iter()
            .map(|s| (s.index, s.track_format()))
            .collect();
        Ok(Self {
            ffmpeg: ffmpeg.to_path_buf(),
            file: Some(file),
            tracks,
            session: None,
        })
    }

    fn start_copy(&self, stream: usize) -> StickerResult<CopySession> {
        let Some(file) = self.file.as_ref() else {
            return Err(DecodeError::NotInitialized.into());
        };
        let mut child = Command::new(&self.ffmpeg)
            .args(["-nostdin", "-hide_banner", "-loglevel", "error", "-i"])
            .arg(file.path())
            .args(["-map", &format!("0:{stream}"), "-c", "copy", "-f", "ivf", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                StickerError::codec(format!("failed to spawn '{}': {e}", self.ffmpeg.display()))
            })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut child = ChildGuard::new(child);
        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            return Err(StickerError::codec("failed to open ffmpeg pipes (unexpected)"));
        };

        let drain = std::thread::Builder::new()
            .name("sticker-demux-err".into())
            .spawn(move || {
                let mut stderr = stderr;
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })?;

        let reader = match IvfReader::new(BufReader::new(stdout)) {
            Ok(reader) => reader,
            Err(e) => {
                // The pipe is closed by now, so ffmpeg exits and its log says why.
                let status = child.wait();
                let log = drain.join().unwrap_or_default();
                return Err(match status {
                    Some(s) if !s.success() => StickerError::container(format!(
                        "ffmpeg demux exited with {s}: {}",
                        log.trim()
                    )),
                    _ => e,
                });
            }
        };
        let mut session = CopySession {
            child,
            reader,
            current: None,
            stderr: Some(drain),
        };
        session.current = session.reader.next_packet()?;
        if session.current.is_none() {
            session.finish()?;
        }
        Ok(session)
    }
}

impl Demuxer for FfmpegDemuxer {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, index: usize) -> Option<TrackFormat> {
        self.tracks.get(index).map(|(_, f)| f.clone())
    }

    fn select_track(&mut self, index: usize) -> StickerResult<()> {
        let Some((stream, format)) = self.tracks.get(index) else {
            return Err(StickerError::validation(format!("no track {index}")));
        };
        if !format.is_video() {
            return Err(DecodeError::UnsupportedCodec(format.codec_id.clone()).into());
        }
        let stream = *stream;
        // Replacing a running session drops its guard, which kills ffmpeg.
        self.session = None;
        self.session = Some(self.start_copy(stream)?);
        tracing::debug!(track = index, stream, "started ffmpeg stream copy");
        Ok(())
    }

    fn read_sample_data(&mut self, buf: &mut Vec<u8>) -> StickerResult<Option<usize>> {
        let Some(session) = self.session.as_ref() else {
            return Err(DecodeError::NotInitialized.into());
        };
        let Some(packet) = session.current.as_ref() else {
            return Ok(None);
        };
        buf.clear();
        buf.extend_from_slice(&packet.data);
        Ok(Some(packet.data.len()))
    }

    fn sample_time_us(&self) -> Option<i64> {
        Some(self.session.as_ref()?.current.as_ref()?.pts_us)
    }

    fn advance(&mut self) -> StickerResult<bool> {
        let Some(session) = self.session.as_mut() else {
            return Ok(false);
        };
        if session.current.is_none() {
            return Ok(false);
        }
        session.current = session.reader.next_packet()?;
        if session.current.is_none() {
            session.finish()?;
            return Ok(false);
        }
        Ok(true)
    }

    fn release(&mut self) {
        self.session = None;
        self.tracks.clear();
        if let Some(file) = self.file.take()
            && let Err(e) = file.close()
        {
            tracing::debug!(error = %e, "failed to remove temporary media file");
        }
    }
}

impl Drop for FfmpegDemuxer {
    fn drop(&mut self) {
        self.release();
    }
}
