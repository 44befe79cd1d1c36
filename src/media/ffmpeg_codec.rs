//! Decoder session backed by an ffmpeg child process.
//!
//! Compressed samples are framed as IVF and written to ffmpeg's stdin by a writer thread;
//! raw I420 frames are read back from stdout by a reader thread. Both directions expose a
//! fixed pool of slots so the caller sees the same dequeue/queue/release cycle a hardware
//! codec would offer.
//!
//! Timestamps are not carried through ffmpeg's raw output. Each written sample pushes its
//! pts onto a FIFO and each decoded frame pops one, which holds for codecs that emit one
//! frame per sample in decode order (VP8, VP9 without hidden-frame reordering, AV1 in WebM).

use std::{
    collections::{HashMap, VecDeque},
    io::{Read, Write},
    path::Path,
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    sync::{
        Arc, Mutex,
        mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender},
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    color::Yuv420Image,
    encode::bridge::ChildGuard,
    error::{DecodeError, StickerError, StickerResult},
    media::{BufferInfo, DecodedImage, TrackFormat, VideoCodec},
};

const INPUT_SLOTS: usize = 4;
const OUTPUT_SLOTS: usize = 3;
const IVF_HEADER_LEN: u16 = 32;

struct InputPacket {
    slot: usize,
    data: Vec<u8>,
    size: usize,
    pts_us: i64,
    end_of_stream: bool,
}

enum OutputEvent {
    Frame { data: Vec<u8>, pts_us: i64 },
    Eos,
    Failed(String),
}

type PtsQueue = Arc<Mutex<VecDeque<i64>>>;

fn fourcc(format: &TrackFormat) -> StickerResult<[u8; 4]> {
    match format.mime.as_str() {
        "video/x-vnd.on2.vp8" => Ok(*b"VP80"),
        "video/x-vnd.on2.vp9" => Ok(*b"VP90"),
        "video/av01" => Ok(*b"AV01"),
        _ => Err(DecodeError::UnsupportedCodec(format.codec_id.clone()).into()),
    }
}

fn ivf_header(fourcc: [u8; 4], width: u32, height: u32) -> [u8; IVF_HEADER_LEN as usize] {
    let mut h = [0u8; IVF_HEADER_LEN as usize];
    h[0..4].copy_from_slice(b"DKIF");
    h[4..6].copy_from_slice(&0u16.to_le_bytes());
    h[6..8].copy_from_slice(&IVF_HEADER_LEN.to_le_bytes());
    h[8..12].copy_from_slice(&fourcc);
    h[12..14].copy_from_slice(&(width.min(u32::from(u16::MAX)) as u16).to_le_bytes());
    h[14..16].copy_from_slice(&(height.min(u32::from(u16::MAX)) as u16).to_le_bytes());
    // Millisecond time base: rate 1000, scale 1.
    h[16..20].copy_from_slice(&1000u32.to_le_bytes());
    h[20..24].copy_from_slice(&1u32.to_le_bytes());
    h
}

fn ivf_frame_header(size: usize, pts_us: i64) -> [u8; 12] {
    let mut h = [0u8; 12];
    h[0..4].copy_from_slice(&(size as u32).to_le_bytes());
    h[4..12].copy_from_slice(&(pts_us / 1000).to_le_bytes());
    h
}

pub struct FfmpegCodec {
    width: u32,
    height: u32,
    child: Option<Child>,
    input_tx: Option<SyncSender<InputPacket>>,
    free_inputs: Receiver<(usize, Vec<u8>)>,
    input_slots: Vec<Vec<u8>>,
    events: Receiver<OutputEvent>,
    free_outputs: Option<Sender<Vec<u8>>>,
    outputs: HashMap<usize, Vec<u8>>,
    next_output: usize,
    stderr_log: Arc<Mutex<String>>,
    threads: Vec<JoinHandle<()>>,
}

impl FfmpegCodec {
    pub fn spawn(program: &Path, format: &TrackFormat) -> StickerResult<Self> {
        let fourcc = fourcc(format)?;
        if format.width == 0 || format.height == 0 {
            return Err(StickerError::container(format!(
                "video track '{}' has no pixel size",
                format.codec_id
            )));
        }

        let mut child = Command::new(program)
            .args([
                "-hide_banner",
                "-nostats",
                "-loglevel",
                "error",
                "-f",
                "ivf",
                "-i",
                "pipe:0",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "yuv420p",
                "-fps_mode",
                "passthrough",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                StickerError::codec(format!("failed to spawn '{}': {e}", program.display()))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StickerError::codec("failed to open ffmpeg stdin (unexpected)"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StickerError::codec("failed to open ffmpeg stdout (unexpected)"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| StickerError::codec("failed to open ffmpeg stderr (unexpected)"))?;
        let child = ChildGuard::new(child);

        let pts: PtsQueue = Arc::default();
        let stderr_log: Arc<Mutex<String>> = Arc::default();

        let (input_tx, input_rx) = mpsc::sync_channel::<InputPacket>(INPUT_SLOTS);
        let (free_in_tx, free_inputs) = mpsc::channel();
        for slot in 0..INPUT_SLOTS {
            let _ = free_in_tx.send((slot, Vec::new()));
        }
        let (events_tx, events) = mpsc::channel();
        let (free_out_tx, free_out_rx) = mpsc::channel();
        let frame_len = Yuv420Image::i420_len(format.width, format.height);
        for _ in 0..OUTPUT_SLOTS {
            let _ = free_out_tx.send(Vec::with_capacity(frame_len));
        }

        let header = ivf_header(fourcc, format.width, format.height);
        let writer_pts = Arc::clone(&pts);
        let writer = std::thread::Builder::new()
            .name("sticker-ffmpeg-in".into())
            .spawn(move || write_loop(stdin, header, input_rx, free_in_tx, writer_pts))?;
        let reader = std::thread::Builder::new()
            .name("sticker-ffmpeg-out".into())
            .spawn(move || read_loop(stdout, frame_len, free_out_rx, events_tx, pts))?;
        let log = Arc::clone(&stderr_log);
        let drain = std::thread::Builder::new()
            .name("sticker-ffmpeg-err".into())
            .spawn(move || {
                let mut stderr = stderr;
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                if let Ok(mut log) = log.lock() {
                    log.push_str(&buf);
                }
            })?;

        tracing::debug!(
            codec = %format.codec_id,
            width = format.width,
            height = format.height,
            "started ffmpeg decoder session"
        );

        Ok(Self {
            width: format.width,
            height: format.height,
            child: child.into_inner(),
            input_tx: Some(input_tx),
            free_inputs,
            input_slots: vec![Vec::new(); INPUT_SLOTS],
            events,
            free_outputs: Some(free_out_tx),
            outputs: HashMap::new(),
            next_output: 0,
            stderr_log,
            threads: vec![writer, reader, drain],
        })
    }

    fn stderr_text(&self) -> String {
        self.stderr_log
            .lock()
            .map(|s| s.trim().to_owned())
            .unwrap_or_default()
    }

    /// Wait for ffmpeg to exit and surface a non-success status with its log.
    fn finish_child(&mut self) -> StickerResult<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        self.input_tx = None;
        let status = child
            .wait()
            .map_err(|e| StickerError::codec(format!("failed to wait for ffmpeg: {e}")))?;
        self.join_threads();
        if !status.success() {
            return Err(StickerError::codec(format!(
                "ffmpeg decoder exited with {status}: {}",
                self.stderr_text()
            )));
        }
        Ok(())
    }

    fn join_threads(&mut self) {
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }

    fn store_output(&mut self, data: Vec<u8>) -> usize {
        let id = self.next_output;
        self.next_output += 1;
        self.outputs.insert(id, data);
        id
    }
}

fn write_loop(
    mut stdin: ChildStdin,
    header: [u8; IVF_HEADER_LEN as usize],
    packets: Receiver<InputPacket>,
    free: Sender<(usize, Vec<u8>)>,
    pts: PtsQueue,
) {
    if let Err(e) = stdin.write_all(&header) {
        tracing::debug!(error = %e, "ffmpeg stdin closed before ivf header");
        return;
    }
    while let Ok(packet) = packets.recv() {
        let size = packet.size.min(packet.data.len());
        if size > 0 {
            if let Ok(mut q) = pts.lock() {
                q.push_back(packet.pts_us);
            }
            let written = stdin
                .write_all(&ivf_frame_header(size, packet.pts_us))
                .and_then(|()| stdin.write_all(&packet.data[..size]));
            if let Err(e) = written {
                tracing::debug!(error = %e, "ffmpeg stdin closed");
                break;
            }
        }
        if packet.end_of_stream {
            break;
        }
        if free.send((packet.slot, packet.data)).is_err() {
            break;
        }
    }
    // Dropping stdin signals end of input to ffmpeg.
}

/// `Ok(false)` on clean end of stream before any byte of a frame.
pub(crate) fn read_frame(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("truncated frame: {filled} of {} bytes", buf.len()),
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn read_loop(
    mut stdout: ChildStdout,
    frame_len: usize,
    free: Receiver<Vec<u8>>,
    events: Sender<OutputEvent>,
    pts: PtsQueue,
) {
    let mut last_pts = -1;
    while let Ok(mut buf) = free.recv() {
        buf.resize(frame_len, 0);
        let event = match read_frame(&mut stdout, &mut buf) {
            Ok(true) => {
                let queued = pts.lock().ok().and_then(|mut q| q.pop_front());
                let pts_us = queued.unwrap_or(last_pts + 1);
                last_pts = pts_us;
                OutputEvent::Frame { data: buf, pts_us }
            }
            Ok(false) => OutputEvent::Eos,
            Err(e) => OutputEvent::Failed(e.to_string()),
        };
        let done = !matches!(event, OutputEvent::Frame { .. });
        if events.send(event).is_err() || done {
            break;
        }
    }
}

impl VideoCodec for FfmpegCodec {
    fn dequeue_input_buffer(&mut self, timeout: Duration) -> StickerResult<Option<usize>> {
        if self.input_tx.is_none() {
            return Ok(None);
        }
        match self.free_inputs.recv_timeout(timeout) {
            Ok((slot, mut data)) => {
                data.clear();
                self.input_slots[slot] = data;
                Ok(Some(slot))
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    fn input_buffer(&mut self, id: usize) -> StickerResult<&mut Vec<u8>> {
        self.input_slots
            .get_mut(id)
            .ok_or_else(|| StickerError::codec(format!("unknown input slot {id}")))
    }

    fn queue_input_buffer(
        &mut self,
        id: usize,
        size: usize,
        pts_us: i64,
        end_of_stream: bool,
    ) -> StickerResult<()> {
        let data = std::mem::take(self.input_buffer(id)?);
        let Some(tx) = self.input_tx.as_ref() else {
            return Err(StickerError::codec("input already reached end of stream"));
        };
        let packet = InputPacket {
            slot: id,
            data,
            size,
            pts_us,
            end_of_stream,
        };
        if tx.send(packet).is_err() {
            return Err(StickerError::codec(format!(
                "ffmpeg decoder stopped accepting input: {}",
                self.stderr_text()
            )));
        }
        if end_of_stream {
            self.input_tx = None;
        }
        Ok(())
    }

    fn dequeue_output_buffer(
        &mut self,
        timeout: Duration,
    ) -> StickerResult<Option<(usize, BufferInfo)>> {
        match self.events.recv_timeout(timeout) {
            Ok(OutputEvent::Frame { data, pts_us }) => {
                let size = data.len();
                let id = self.store_output(data);
                Ok(Some((
                    id,
                    BufferInfo {
                        size,
                        pts_us,
                        end_of_stream: false,
                    },
                )))
            }
            Ok(OutputEvent::Eos) => {
                self.finish_child()?;
                let id = self.store_output(Vec::new());
                Ok(Some((
                    id,
                    BufferInfo {
                        size: 0,
                        pts_us: 0,
                        end_of_stream: true,
                    },
                )))
            }
            Ok(OutputEvent::Failed(msg)) => {
                let _ = self.finish_child();
                Err(StickerError::codec(format!("{msg}: {}", self.stderr_text())))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(StickerError::codec(
                "ffmpeg decoder output closed unexpectedly",
            )),
        }
    }

    fn output_image(&mut self, id: usize) -> StickerResult<Option<DecodedImage>> {
        let Some(data) = self.outputs.get(&id) else {
            return Ok(None);
        };
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(DecodedImage::Yuv420(Yuv420Image::from_i420(
            self.width,
            self.height,
            data,
        )?)))
    }

    fn release_output_buffer(&mut self, id: usize) {
        if let Some(data) = self.outputs.remove(&id)
            && !data.is_empty()
            && let Some(tx) = self.free_outputs.as_ref()
        {
            let _ = tx.send(data);
        }
    }

    fn release(&mut self) {
        self.input_tx = None;
        self.free_outputs = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.join_threads();
        self.outputs.clear();
    }
}

impl Drop for FfmpegCodec {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(mime: &str) -> TrackFormat {
        TrackFormat {
            mime: mime.to_owned(),
            codec_id: "V_TEST".to_owned(),
            width: 16,
            height: 8,
            default_duration_ns: None,
        }
    }

    #[test]
    fn ivf_header_layout() {
        let h = ivf_header(*b"VP90", 640, 360);
        assert_eq!(&h[0..4], b"DKIF");
        assert_eq!(u16::from_le_bytes([h[6], h[7]]), 32);
        assert_eq!(&h[8..12], b"VP90");
        assert_eq!(u16::from_le_bytes([h[12], h[13]]), 640);
        assert_eq!(u16::from_le_bytes([h[14], h[15]]), 360);
        assert_eq!(u32::from_le_bytes([h[16], h[17], h[18], h[19]]), 1000);
    }

    #[test]
    fn frame_header_carries_size_and_millis() {
        let h = ivf_frame_header(513, 40_000);
        assert_eq!(u32::from_le_bytes([h[0], h[1], h[2], h[3]]), 513);
        assert_eq!(i64::from_le_bytes(h[4..12].try_into().unwrap()), 40);
    }

    #[test]
    fn unknown_codecs_are_rejected_before_spawning() {
        let err = FfmpegCodec::spawn(Path::new("ffmpeg"), &format("video/avc")).err();
        assert!(matches!(
            err,
            Some(StickerError::Decode(DecodeError::UnsupportedCodec(_)))
        ));
    }

    #[test]
    fn missing_binary_is_a_codec_error() {
        let err = FfmpegCodec::spawn(
            Path::new("/nonexistent/sticker-gif-ffmpeg"),
            &format("video/x-vnd.on2.vp9"),
        )
        .err();
        assert!(matches!(err, Some(StickerError::Decode(DecodeError::Codec(_)))));
    }
}
