use thiserror::Error;

/// Error taxonomy shared across ingress, egress, and the transcoder bridge.
///
/// Module-internal glue still returns `anyhow::Result` where no caller needs
/// to match on a specific kind; this enum is for the seams where callers do.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("unsupported codec for stream {stream_id}")]
    UnsupportedCodec { stream_id: String },

    #[error("no media track appeared for stream {stream_id}")]
    MissingTrack { stream_id: String },

    #[error("timed out waiting for tracks on stream {stream_id}")]
    TrackWaitTimeout { stream_id: String },

    #[error("stream not found: {0}")]
    NotFoundStream(String),

    #[error("no stream key provided")]
    NoStreamKey,

    #[error("write failed: {0}")]
    WriteFailure(String),

    #[error("codec initialization failed: {0}")]
    CodecInitFailure(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
