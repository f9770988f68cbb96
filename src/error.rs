use std::path::PathBuf;

use thiserror::Error;

/// Failures reported synchronously by engine operations.
///
/// Runtime capture I/O failures are not in here: those are recorded on the bank
/// (see [`crate::bank::CaptureFault`]) and never unwind into the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bank {0} does not exist")]
    InvalidBank(usize),

    #[error("channel {0} does not exist")]
    InvalidChannel(usize),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("bank {0} has no sound file loaded")]
    NoSource(usize),

    #[error("cannot open {path:?}: {source}")]
    SourceOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path:?} is not a playable PCM WAV file: {reason}")]
    SourceFormat { path: PathBuf, reason: String },

    #[error("cannot create capture file {path:?}: {reason}")]
    CaptureOpen { path: PathBuf, reason: String },

    #[error("bank {0} is already capturing")]
    AlreadyCapturing(usize),

    #[error("capture writer is not running")]
    CaptureWriterStopped,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("playback worker for bank {0} panicked")]
    WorkerPanicked(usize),

    #[error("audio server error: {0}")]
    AudioServer(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
