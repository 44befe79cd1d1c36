//! Runs ffmpeg sessions and turns their asynchronous completion into a blocking call.

use std::{
    ffi::OsString,
    fmt,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::Arc,
    thread::JoinHandle,
};

use crate::error::{EncodeError, StickerResult};

/// Severity of one ffmpeg log line, as printed with `-loglevel level+info`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Quiet,
    Panic,
    Fatal,
    Error,
    Warning,
    Info,
    Verbose,
    Debug,
    Trace,
}

impl LogLevel {
    fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "quiet" => Self::Quiet,
            "panic" => Self::Panic,
            "fatal" => Self::Fatal,
            "error" => Self::Error,
            "warning" => Self::Warning,
            "info" => Self::Info,
            "verbose" => Self::Verbose,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
}

impl LogLine {
    /// Split the `[level]` tag off a line. Lines may also start with a `[component @ 0x..]`
    /// prefix, which is kept in the message.
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim_end();
        let mut rest = trimmed;
        let mut prefix = "";
        if let Some(end) = rest.find("] ").filter(|_| rest.starts_with('['))
            && rest[1..end].contains(" @ ")
        {
            prefix = &rest[..end + 2];
            rest = &rest[end + 2..];
        }
        if let Some(stripped) = rest.strip_prefix('[')
            && let Some(end) = stripped.find(']')
            && let Some(level) = LogLevel::from_tag(&stripped[..end])
        {
            let message = format!("{prefix}{}", stripped[end + 1..].trim_start());
            return Self { level, message };
        }
        let level = if trimmed.to_ascii_lowercase().contains("error") {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        Self {
            level,
            message: trimmed.to_owned(),
        }
    }
}

/// Encoding progress reported by ffmpeg's `-progress` output.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Statistics {
    pub session_id: u64,
    pub video_frame_number: u64,
    pub video_fps: f64,
    pub video_quality: f64,
    pub size: u64,
    /// Output time in milliseconds.
    pub time: f64,
    /// kbit/s.
    pub bitrate: f64,
    pub speed: f64,
}

impl Statistics {
    /// Apply one `key=value` progress line. Returns `true` when a block is complete.
    fn apply(&mut self, key: &str, value: &str) -> bool {
        let num = |v: &str| v.trim().trim_end_matches('x').parse::<f64>().unwrap_or(0.0);
        match key {
            "frame" => self.video_frame_number = value.trim().parse().unwrap_or(0),
            "fps" => self.video_fps = num(value),
            "total_size" => self.size = value.trim().parse().unwrap_or(0),
            "out_time_us" => self.time = num(value) / 1000.0,
            "bitrate" => self.bitrate = num(value.trim().trim_end_matches("kbits/s")),
            "speed" => self.speed = num(value),
            "progress" => return true,
            k if k.starts_with("stream_") && k.ends_with("_q") => self.video_quality = num(value),
            _ => {}
        }
        false
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "sessionId: {}", self.session_id)?;
        writeln!(f, "videoFrameNumber: {}", self.video_frame_number)?;
        writeln!(f, "videoFps: {:.2}", self.video_fps)?;
        writeln!(f, "videoQuality: {:.2}", self.video_quality)?;
        writeln!(f, "size: {}", self.size)?;
        writeln!(f, "time: {:.0}", self.time)?;
        writeln!(f, "bitrate: {:.2}", self.bitrate)?;
        write!(f, "speed: {:.2}", self.speed)
    }
}

pub type LogCallback = Arc<dyn Fn(&LogLine) + Send + Sync>;
pub type StatisticsCallback = Arc<dyn Fn(&Statistics) + Send + Sync>;

/// Final state of one ffmpeg session.
#[derive(Clone, Debug)]
pub struct SessionOutcome {
    pub session_id: u64,
    pub status: Option<ExitStatus>,
    pub log: String,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }

    fn status_text(&self) -> String {
        match self.status {
            Some(s) => s.to_string(),
            None => "no exit status".to_owned(),
        }
    }
}

/// Kills and reaps a child process on drop unless it was waited on or handed off first.
pub(crate) struct ChildGuard(Option<Child>);

impl ChildGuard {
    pub(crate) fn new(child: Child) -> Self {
        Self(Some(child))
    }

    pub(crate) fn wait(&mut self) -> Option<ExitStatus> {
        self.0.take()?.wait().ok()
    }

    pub(crate) fn into_inner(mut self) -> Option<Child> {
        self.0.take()
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.0.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

pub fn is_ffmpeg_available(program: &Path) -> bool {
    Command::new(program)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn is_ffmpeg_on_path() -> bool {
    is_ffmpeg_available(Path::new("ffmpeg"))
}

static NEXT_SESSION: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// Spawns ffmpeg with the session's global flags and streams its diagnostics.
#[derive(Clone)]
pub struct ProcessBridge {
    program: PathBuf,
    log_callback: Option<LogCallback>,
    statistics_callback: Option<StatisticsCallback>,
}

impl fmt::Debug for ProcessBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessBridge")
            .field("program", &self.program)
            .field("log_callback", &self.log_callback.is_some())
            .field("statistics_callback", &self.statistics_callback.is_some())
            .finish()
    }
}

impl Default for ProcessBridge {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl ProcessBridge {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            log_callback: None,
            statistics_callback: None,
        }
    }

    pub fn with_log_callback(mut self, cb: LogCallback) -> Self {
        self.log_callback = Some(cb);
        self
    }

    pub fn with_statistics_callback(mut self, cb: StatisticsCallback) -> Self {
        self.statistics_callback = Some(cb);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Start a session and return immediately; `on_complete` fires exactly once.
    pub fn execute_async<F>(&self, args: &[OsString], on_complete: F) -> StickerResult<JoinHandle<()>>
    where
        F: FnOnce(SessionOutcome) + Send + 'static,
    {
        let session_id = NEXT_SESSION.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut cmd = Command::new(&self.program);
        cmd.args(["-nostdin", "-hide_banner", "-y", "-loglevel", "level+info"])
            .args(["-progress", "pipe:1", "-nostats"])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        tracing::debug!(session_id, program = %self.program.display(), ?args, "starting ffmpeg session");

        let mut child = cmd.spawn().map_err(|e| EncodeError::Spawn {
            program: self.program.display().to_string(),
            reason: e.to_string(),
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        // Reaped on every early return below, including a failed thread spawn.
        let mut child = ChildGuard::new(child);

        let stats_cb = self.statistics_callback.clone();
        let progress = std::thread::Builder::new()
            .name(format!("ffmpeg-progress-{session_id}"))
            .spawn(move || {
                let Some(stdout) = stdout else { return };
                let mut stats = Statistics {
                    session_id,
                    ..Statistics::default()
                };
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    let Some((key, value)) = line.split_once('=') else {
                        continue;
                    };
                    if stats.apply(key.trim(), value)
                        && let Some(cb) = stats_cb.as_ref()
                    {
                        cb(&stats);
                    }
                }
            })?;

        let log_cb = self.log_callback.clone();
        let handle = std::thread::Builder::new()
            .name(format!("ffmpeg-session-{session_id}"))
            .spawn(move || {
                let mut log = String::new();
                if let Some(stderr) = stderr {
                    for line in BufReader::new(stderr).lines() {
                        let Ok(line) = line else { break };
                        let parsed = LogLine::parse(&line);
                        match parsed.level {
                            LogLevel::Panic | LogLevel::Fatal | LogLevel::Error => {
                                tracing::warn!(session_id, "ffmpeg: {}", parsed.message)
                            }
                            LogLevel::Warning | LogLevel::Info => {
                                tracing::debug!(session_id, "ffmpeg: {}", parsed.message)
                            }
                            _ => tracing::trace!(session_id, "ffmpeg: {}", parsed.message),
                        }
                        if let Some(cb) = log_cb.as_ref() {
                            cb(&parsed);
                        }
                        log.push_str(&line);
                        log.push('\n');
                    }
                }
                let status = child.wait();
                let _ = progress.join();
                on_complete(SessionOutcome {
                    session_id,
                    status,
                    log,
                });
            })?;
        Ok(handle)
    }

    /// Run a session to completion. Non-success yields [`EncodeError::ExternalProcessFailed`].
    ///
    /// Blocks the calling thread, so it must not be called from inside an async runtime.
    pub fn execute(&self, args: &[OsString]) -> StickerResult<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = self.execute_async(args, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        let outcome = rx.blocking_recv();
        let _ = handle.join();
        let Ok(outcome) = outcome else {
            return Err(EncodeError::ExternalProcessFailed {
                status: "session ended without completion".to_owned(),
                log: String::new(),
            }
            .into());
        };
        if !outcome.is_success() {
            tracing::warn!(
                session_id = outcome.session_id,
                status = %outcome.status_text(),
                "ffmpeg session failed"
            );
            return Err(EncodeError::ExternalProcessFailed {
                status: outcome.status_text(),
                log: outcome.log.trim().to_owned(),
            }
            .into());
        }
        tracing::debug!(session_id = outcome.session_id, "ffmpeg session completed");
        Ok(())
    }
}
