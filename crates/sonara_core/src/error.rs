//! Engine Error Types

use thiserror::Error;

/// Errors that can occur in the audio server engine.
///
/// Variants are grouped by how they propagate: errors local to one stream or
/// client are reported to that client only; device-level errors trigger the
/// disable/enable reset path; only bootstrap failures abort the server.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("Device {0} is busy")]
    DeviceBusy(u32),

    #[error("Device {dev} unavailable: {source}")]
    DeviceUnavailable {
        dev: u32,
        #[source]
        source: Box<CoreError>,
    },

    #[error("Peer disconnected")]
    PeerGone,

    #[error("Transient I/O condition, retry")]
    Transient,

    #[error("Severe underrun reported by driver")]
    SevereUnderrun,

    #[error("Fatal engine state: {0}")]
    Fatal(&'static str),

    #[error("Stream {0:#x} not found")]
    NoSuchStream(u64),

    #[error("Device index {0} not found")]
    NoSuchDevice(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("Protocol error: {0}")]
    Proto(#[from] sonara_proto::ProtoError),

    #[error("DSP error: {0}")]
    Dsp(#[from] sonara_dsp::DspError),

    #[error("Audio thread is not running")]
    ThreadDown,
}

impl CoreError {
    /// True for conditions that should be retried without state change.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Transient => true,
            CoreError::Io(e) => e.kind() == std::io::ErrorKind::WouldBlock,
            CoreError::Sys(e) => *e == nix::Error::EAGAIN || *e == nix::Error::EINTR,
            _ => false,
        }
    }

    /// Errno-style code reported in `StreamConnected.err` replies.
    pub fn wire_code(&self) -> i32 {
        match self {
            CoreError::InvalidArgument(_) => -libc::EINVAL,
            CoreError::ResourceExhausted(_) => -libc::ENOMEM,
            CoreError::DeviceBusy(_) => -libc::EBUSY,
            CoreError::DeviceUnavailable { .. } => -libc::ENODEV,
            CoreError::NoSuchStream(_) | CoreError::NoSuchDevice(_) => -libc::ENOENT,
            CoreError::PeerGone => -libc::EPIPE,
            CoreError::Transient => -libc::EAGAIN,
            CoreError::Sys(e) => -(*e as i32),
            _ => -libc::EIO,
        }
    }
}

/// Result type alias for engine operations
pub type CoreResult<T> = Result<T, CoreError>;
