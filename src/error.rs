pub type StickerResult<T> = Result<T, StickerError>;

/// Failures raised while turning source bytes into frames.
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("malformed composition: {0}")]
    MalformedComposition(String),

    #[error("no video track found in media")]
    NoVideoTrack,

    #[error("unsupported pixel format: {0}")]
    UnsupportedPixelFormat(String),

    #[error("unsupported codec '{0}'")]
    UnsupportedCodec(String),

    #[error("malformed container: {0}")]
    Container(String),

    #[error("decoder failure: {0}")]
    Codec(String),

    #[error("decode was cancelled")]
    Cancelled,

    #[error("frame sequence was already consumed")]
    AlreadyConsumed,

    #[error("frame source is not initialized")]
    NotInitialized,
}

/// Failures raised while producing the output file.
#[derive(thiserror::Error, Debug)]
pub enum EncodeError {
    #[error("ffmpeg exited with {status}: {log}")]
    ExternalProcessFailed { status: String, log: String },

    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("encoder is already finalized")]
    Finalized,
}

#[derive(thiserror::Error, Debug)]
pub enum StickerError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StickerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Decode(DecodeError::MalformedComposition(msg.into()))
    }

    pub fn container(msg: impl Into<String>) -> Self {
        Self::Decode(DecodeError::Container(msg.into()))
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Decode(DecodeError::Codec(msg.into()))
    }

    /// Captured ffmpeg log for encode failures, if any.
    pub fn process_log(&self) -> Option<&str> {
        match self {
            Self::Encode(EncodeError::ExternalProcessFailed { log, .. }) => Some(log),
            _ => None,
        }
    }
}
