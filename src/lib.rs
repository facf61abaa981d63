//! Secure Cryptor Queue - encrypted block I/O with online conversion
//!
//! This library sits between a consumer and a block device and encrypts the
//! part of the device that lies inside the *encrypted area* with
//! XTS-AES-256, one 512-byte data unit at a time. While the device stays in
//! use, a background task can grow the encrypted area (encrypt in place),
//! shrink it (decrypt in place) or wipe a decoy area.
//!
//! # Features
//!
//! - **Three-stage pipeline**: submission, device I/O and completion run on
//!   their own threads, with double-buffered fragments in between
//! - **Partial encryption**: requests straddling the area bound are split
//!   into plaintext and ciphertext parts
//! - **Quiescence**: the queue can be drained and held so the area bound
//!   moves without racing foreground I/O
//! - **Hidden volume protection**: the first write into a protected range
//!   latches every later write into failure
//! - **Resumable conversion**: the area bound is persisted periodically
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use secure_cryptor_queue::{
//!     AreaBounds, ConversionConfig, ConversionEngine, ConversionRequest, EncryptedIoQueue,
//!     MemoryDevice, MemoryHeaderStore, QueueConfig, XtsCryptoContext,
//! };
//!
//! let device = Arc::new(MemoryDevice::from_data(vec![7u8; 16 * 1024]));
//! let config = QueueConfig::filter()
//!     .small()
//!     .with_areas(AreaBounds::EMPTY, AreaBounds::with_length(0, 16 * 1024));
//! let queue = Arc::new(
//!     EncryptedIoQueue::start(config, Arc::new(XtsCryptoContext::random()), device).unwrap(),
//! );
//!
//! let engine = ConversionEngine::new(
//!     queue.clone(),
//!     Arc::new(MemoryHeaderStore::new()),
//!     ConversionConfig::new(4096, 8192),
//! );
//! let outcome = engine.start_conversion(ConversionRequest::encrypt()).unwrap().wait();
//! assert!(outcome.is_success());
//! assert_eq!(queue.read(0, 512).data, vec![7u8; 512]);
//! ```

pub mod config;
pub mod conversion;
pub mod crypto;
pub mod error;
pub mod memory;
pub mod progress;
pub mod queue;
pub mod volume;

pub use config::{
    ConversionConfig, FilterParams, ProtectedRange, QueueConfig, QueueKind, RemapConfig, VolumeParams,
    DATA_UNIT_SIZE,
};
pub use conversion::{
    ConversionEngine, ConversionHandle, ConversionMode, ConversionRequest, ConversionStatus, DeviceHeaderStore,
    MemoryHeaderStore, PersistHeader, RegionRecord, TaskOutcome, WipeAlgorithm, WipeHandle, WipeRequest,
    WipeStatus,
};
pub use crypto::{CryptoContext, CryptoError, XtsCryptoContext};
pub use error::{ConversionError, IoStatus, QueueError, Result};
pub use progress::{format_bytes, format_duration, ProgressCallback, ProgressTracker};
pub use queue::{Direction, EncryptedIoQueue, IoCompletion, IoHandle, QueueStatus};
pub use volume::{AreaBounds, BlockDevice, FileDevice, MemoryDevice, ProtectedSectors};
