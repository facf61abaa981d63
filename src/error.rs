//! Error types for the encrypted I/O queue.
//!
//! Two layers live here. [`IoStatus`] is the stable, copyable completion
//! status carried by every request through the pipeline and reported to the
//! submitter. [`QueueError`] and [`ConversionError`] are the internal error
//! taxonomy used by `Result`-returning operations; each maps onto a stable
//! [`IoStatus`] for the management interface.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::crypto::CryptoError;

/// Completion status of a single submitted request.
///
/// The numeric codes returned by [`IoStatus::code`] are stable and are what a
/// management interface should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// The request completed and all bytes were transferred.
    Success,
    /// Bad offset, length or target. Also reported for writes denied by
    /// hidden volume protection.
    InvalidParameter,
    /// The request was cancelled before it was admitted.
    Cancelled,
    /// The queue is stopping and no longer admits requests.
    DeviceNotReady,
    /// The write targets a protected area of a system drive.
    WriteProtected,
    /// The device returned fewer bytes than requested.
    EndOfFile,
    /// A buffer could not be allocated.
    InsufficientResources,
    /// The backing device failed.
    DeviceError(io::ErrorKind),
}

impl IoStatus {
    /// Returns true for [`IoStatus::Success`].
    pub fn is_success(self) -> bool {
        self == IoStatus::Success
    }

    /// Stable numeric code for the status.
    pub fn code(self) -> u32 {
        match self {
            IoStatus::Success => 0,
            IoStatus::InvalidParameter => 1,
            IoStatus::Cancelled => 2,
            IoStatus::DeviceNotReady => 3,
            IoStatus::WriteProtected => 4,
            IoStatus::EndOfFile => 5,
            IoStatus::InsufficientResources => 6,
            IoStatus::DeviceError(_) => 7,
        }
    }
}

impl fmt::Display for IoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoStatus::Success => write!(f, "success"),
            IoStatus::InvalidParameter => write!(f, "invalid parameter"),
            IoStatus::Cancelled => write!(f, "cancelled"),
            IoStatus::DeviceNotReady => write!(f, "device not ready"),
            IoStatus::WriteProtected => write!(f, "write protected"),
            IoStatus::EndOfFile => write!(f, "end of file"),
            IoStatus::InsufficientResources => write!(f, "insufficient resources"),
            IoStatus::DeviceError(kind) => write!(f, "device error ({})", kind),
        }
    }
}

/// Errors raised by the queue and its quiescence controller.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Offset or length is not a multiple of the data unit size.
    #[error("Invalid parameter: offset or length is not data unit aligned")]
    Alignment,

    /// Request lies outside the addressable range, or its arithmetic overflows.
    #[error("Invalid parameter: request out of range")]
    OutOfRange,

    /// Hidden volume protection denied the write.
    ///
    /// The message intentionally matches a generic parameter failure.
    #[error("Invalid parameter")]
    ProtectionViolation,

    /// Write targets the boot header or an area outside the hidden system.
    #[error("Write to protected area at offset {0}")]
    WriteProtected(u64),

    /// Backing device failure.
    #[error("Device I/O error: {0}")]
    Device(#[from] io::Error),

    /// Device returned fewer bytes than requested.
    #[error("Unexpected end of device at offset {0}")]
    EndOfFile(u64),

    /// Buffer allocation failed.
    #[error("Failed to allocate {0} bytes")]
    ResourceExhaustion(usize),

    /// Outstanding I/O did not drain before the hold timeout.
    #[error("Timed out waiting for outstanding I/O to drain")]
    QuiescenceTimeout,

    /// Operation not valid in the current queue state.
    #[error("Invalid queue state: {0}")]
    InvalidState(&'static str),

    /// The queue is stopping or stopped.
    #[error("Queue is stopped")]
    Stopped,

    /// Cipher failure.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A queue lock was poisoned by a panicking thread.
    #[error("Queue lock poisoned")]
    LockPoisoned,
}

impl QueueError {
    /// Maps the error onto the stable per-request status.
    pub fn status(&self) -> IoStatus {
        match self {
            QueueError::Alignment | QueueError::OutOfRange | QueueError::ProtectionViolation => {
                IoStatus::InvalidParameter
            }
            QueueError::WriteProtected(_) => IoStatus::WriteProtected,
            QueueError::Device(e) => IoStatus::DeviceError(e.kind()),
            QueueError::EndOfFile(_) => IoStatus::EndOfFile,
            QueueError::ResourceExhaustion(_) => IoStatus::InsufficientResources,
            QueueError::Stopped => IoStatus::DeviceNotReady,
            QueueError::QuiescenceTimeout
            | QueueError::InvalidState(_)
            | QueueError::Crypto(_)
            | QueueError::LockPoisoned => IoStatus::DeviceError(io::ErrorKind::Other),
        }
    }
}

/// Errors raised by the conversion engine and the decoy wipe task.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// Queue-level failure (hold, crypto, allocation).
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Reading a block failed and no unreadable-sector policy applied.
    #[error("Read failed at offset {offset}: {source}")]
    Read {
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// Writing a block failed. The block was rolled back on a best-effort basis.
    #[error("Write failed at offset {offset}: {source}")]
    Write {
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// The region record could not be persisted.
    #[error("Failed to persist encrypted area: {0}")]
    Persist(String),

    /// The stored region record is corrupt.
    #[error("Encrypted area record checksum mismatch")]
    Checksum,

    /// The configured area is empty or malformed.
    #[error("Invalid configured area: {0}")]
    InvalidArea(String),

    /// The conversion thread panicked.
    #[error("Conversion thread panicked")]
    ThreadPanicked,
}

impl ConversionError {
    /// Maps the error onto the stable status reported to management callers.
    pub fn status(&self) -> IoStatus {
        match self {
            ConversionError::Queue(e) => e.status(),
            ConversionError::Read { source, .. } | ConversionError::Write { source, .. } => {
                IoStatus::DeviceError(source.kind())
            }
            ConversionError::InvalidArea(_) => IoStatus::InvalidParameter,
            ConversionError::Persist(_)
            | ConversionError::Checksum
            | ConversionError::ThreadPanicked => IoStatus::DeviceError(io::ErrorKind::Other),
        }
    }
}

/// Type alias for Results using QueueError.
pub type Result<T> = std::result::Result<T, QueueError>;
