//! Encrypted I/O queue
//!
//! The queue sits between callers and a [`BlockDevice`] and transparently
//! encrypts and decrypts the part of every request that falls inside the
//! encrypted area. Each queue runs three long-lived worker threads, connected
//! by channels:
//!
//! ```text
//! submit() ──► Submission ──► Device I/O ──► Completion ──► IoHandle
//!              │ validate      │ read/write   │ decrypt reads
//!              │ fragment      │ remap split  │ complete item
//!              │ encrypt writes│ read-ahead   │
//! ```
//!
//! ## Fragments
//!
//! Submission splits a request into fragments of at most the configured
//! fragment size and stages each one in a buffer of a fixed ring (two
//! buffers by default), so encryption of one fragment overlaps the device
//! access of the previous one.
//!
//! ## Quiescence
//!
//! [`EncryptedIoQueue::hold_when_idle`] drains all outstanding requests and
//! suspends admission; [`EncryptedIoQueue::resume_from_hold`] lifts it. The
//! encrypted area bound is only changed while the queue is held.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use secure_cryptor_queue::config::QueueConfig;
//! use secure_cryptor_queue::crypto::XtsCryptoContext;
//! use secure_cryptor_queue::queue::EncryptedIoQueue;
//! use secure_cryptor_queue::volume::{AreaBounds, MemoryDevice};
//!
//! let device = Arc::new(MemoryDevice::new(64 * 1024));
//! let crypto = Arc::new(XtsCryptoContext::random());
//! let config = QueueConfig::filter()
//!     .with_areas(AreaBounds::new(0, 64 * 1024 - 1), AreaBounds::new(0, 64 * 1024 - 1));
//!
//! let queue = EncryptedIoQueue::start(config, crypto, device).unwrap();
//! assert!(queue.write(4096, vec![0x42; 1024]).status.is_success());
//! assert_eq!(queue.read(4096, 1024).data, vec![0x42; 1024]);
//! queue.stop().unwrap();
//! ```

mod completion;
mod device_io;
mod hold;
mod read_ahead;
pub mod request;
mod submission;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel as chan;
use log::{debug, info, warn};
use zeroize::Zeroize;

use crate::config::{QueueConfig, QueueKind, MAX_FRAGMENT_SIZE, PREALLOCATED_ITEM_COUNT, PREALLOCATED_ITEM_MAX_COUNT};
use crate::crypto::CryptoContext;
use crate::error::{IoStatus, QueueError, Result};
use crate::memory::{BufferPool, FragmentBuffers, PoolStats};
use crate::volume::{AreaBounds, BlockDevice, ProtectedSectors, SharedBounds};

use hold::{OutstandingIo, SuspendState};
use read_ahead::ReadAheadCache;
use request::{Item, SubmitMessage};

pub use request::{Direction, IoCompletion, IoHandle};

/// Snapshot of the queue state for management callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    /// An encrypted area exists.
    pub encrypted: bool,
    pub region_start: i64,
    pub region_end: i64,
    pub configured_start: i64,
    pub configured_end: i64,
    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
}

/// State shared by the worker threads and the queue handle.
pub(crate) struct QueueShared {
    pub config: QueueConfig,
    pub crypto: Arc<dyn CryptoContext>,
    pub device: Arc<dyn BlockDevice>,
    pub pool: BufferPool,
    pub fragments: FragmentBuffers,
    pub read_ahead: ReadAheadCache,
    /// Sectors served from saved contents and closed to writes.
    pub protected: ProtectedSectors,
    pub encrypted_area: SharedBounds,
    pub configured_area: SharedBounds,
    pub outstanding: OutstandingIo,
    pub suspend: SuspendState,
    /// Fragments queued for, but not yet taken by, the device I/O stage.
    pub io_pending: AtomicUsize,
    pub stop_pending: AtomicBool,
    /// Latched after the first write denied by hidden volume protection.
    pub protection_triggered: AtomicBool,
    pub total_bytes_read: AtomicU64,
    pub total_bytes_written: AtomicU64,
}

impl QueueShared {
    /// Applies the inactive-scope or remap bias to a data unit index.
    pub fn biased_data_unit(&self, unit: u64) -> Result<u64> {
        if let Some(first) = self.config.first_data_unit {
            return unit.checked_add(first).ok_or(QueueError::OutOfRange);
        }
        match self.config.remap {
            Some(remap) => unit
                .checked_add_signed(remap.remapped_area_data_unit_offset)
                .ok_or(QueueError::OutOfRange),
            None => Ok(unit),
        }
    }

    pub fn is_filter(&self) -> bool {
        matches!(self.config.kind, QueueKind::Filter(_))
    }

    /// Reports an item to its submitter and retires it.
    ///
    /// Safe to call more than once; only the first call has an effect.
    pub fn complete_item(&self, item: &Item) {
        let Some((status, mut payload)) = item.finish() else {
            return;
        };

        let mut bytes_transferred = 0;
        if status.is_success() {
            bytes_transferred = item.length;
            let total = match item.direction {
                Direction::Read => &self.total_bytes_read,
                Direction::Write => &self.total_bytes_written,
            };
            total.fetch_add(item.length as u64, Ordering::SeqCst);
        } else if item.direction == Direction::Read {
            // No partial plaintext leaves a failed read
            payload.zeroize();
            payload.clear();
        }

        item.send(IoCompletion {
            status,
            bytes_transferred,
            data: payload,
        });
        self.outstanding.decrement();
    }

    /// Completes an item that failed before reaching the device.
    pub fn fail_item(&self, item: &Item, status: IoStatus) {
        item.fail(status);
        self.complete_item(item);
    }
}

/// Encrypted block I/O queue in front of one device.
pub struct EncryptedIoQueue {
    shared: Arc<QueueShared>,
    submit_tx: Mutex<Option<chan::Sender<SubmitMessage>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EncryptedIoQueue {
    /// Allocates the queue buffers and starts the worker threads.
    ///
    /// # Errors
    ///
    /// [`QueueError::ResourceExhaustion`] if buffers cannot be allocated,
    /// [`QueueError::Device`] if a worker thread cannot be spawned.
    pub fn start(
        config: QueueConfig,
        crypto: Arc<dyn CryptoContext>,
        device: Arc<dyn BlockDevice>,
    ) -> Result<Self> {
        Self::start_with_protected_sectors(config, crypto, device, ProtectedSectors::new())
    }

    /// Starts a drive filter queue that serves `protected` from their saved
    /// contents and refuses writes over them.
    ///
    /// # Errors
    ///
    /// [`QueueError::InvalidState`] if sectors are given for a volume queue,
    /// otherwise as [`EncryptedIoQueue::start`].
    pub fn start_with_protected_sectors(
        config: QueueConfig,
        crypto: Arc<dyn CryptoContext>,
        device: Arc<dyn BlockDevice>,
        protected: ProtectedSectors,
    ) -> Result<Self> {
        if !protected.is_empty() && !matches!(config.kind, QueueKind::Filter(_)) {
            return Err(QueueError::InvalidState("protected sectors need a drive filter queue"));
        }

        let mut config = config;
        config.fragment_size = config.effective_fragment_size();

        let fragments = match FragmentBuffers::new(config.fragment_depth, config.fragment_size) {
            Ok(fragments) => fragments,
            Err(QueueError::ResourceExhaustion(_)) if config.fragment_size > MAX_FRAGMENT_SIZE => {
                warn!(
                    "Cannot allocate {} byte fragments, falling back to {}",
                    config.fragment_size, MAX_FRAGMENT_SIZE
                );
                config.fragment_size = MAX_FRAGMENT_SIZE;
                FragmentBuffers::new(config.fragment_depth, config.fragment_size)?
            }
            Err(e) => return Err(e),
        };

        let read_ahead = ReadAheadCache::new(config.fragment_size)?;

        let pool = BufferPool::new();
        let count = config.preallocated_item_count.min(PREALLOCATED_ITEM_MAX_COUNT);
        if let Err(e) = pool.preallocate(config.fragment_size, count) {
            if count <= PREALLOCATED_ITEM_COUNT {
                return Err(e);
            }
            warn!("Preallocation of {} buffers failed, retrying with {}", count, PREALLOCATED_ITEM_COUNT);
            pool.preallocate(config.fragment_size, PREALLOCATED_ITEM_COUNT)?;
        }
        pool.finish_startup();

        let shared = Arc::new(QueueShared {
            config,
            crypto,
            device,
            pool,
            fragments,
            read_ahead,
            protected,
            encrypted_area: SharedBounds::new(config.encrypted_area),
            configured_area: SharedBounds::new(config.configured_area),
            outstanding: OutstandingIo::new(),
            suspend: SuspendState::new(),
            io_pending: AtomicUsize::new(0),
            stop_pending: AtomicBool::new(false),
            protection_triggered: AtomicBool::new(false),
            total_bytes_read: AtomicU64::new(0),
            total_bytes_written: AtomicU64::new(0),
        });

        let (submit_tx, submit_rx) = chan::unbounded();
        let (device_tx, device_rx) = chan::unbounded();
        let (completion_tx, completion_rx) = chan::unbounded();

        let mut workers = Vec::with_capacity(3);
        let stage = Arc::clone(&shared);
        workers.push(Self::spawn("scq-submission", move || {
            submission::run(stage, submit_rx, device_tx)
        })?);
        let stage = Arc::clone(&shared);
        workers.push(Self::spawn("scq-device-io", move || {
            device_io::run(stage, device_rx, completion_tx)
        })?);
        let stage = Arc::clone(&shared);
        workers.push(Self::spawn("scq-completion", move || {
            completion::run(stage, completion_rx)
        })?);

        info!(
            "Queue started ({} byte fragments, encrypted area {:?})",
            config.fragment_size, config.encrypted_area
        );

        Ok(Self {
            shared,
            submit_tx: Mutex::new(Some(submit_tx)),
            workers: Mutex::new(workers),
        })
    }

    fn spawn(name: &str, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
        Ok(thread::Builder::new().name(name.to_string()).spawn(f)?)
    }

    /// Submits a request and returns a handle to its completion.
    ///
    /// For writes, `payload` holds the data. For reads it is an optional
    /// buffer to reuse for the result and may be empty.
    pub fn submit(&self, direction: Direction, offset: u64, length: usize, payload: Vec<u8>) -> IoHandle {
        let (tx, rx) = chan::bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = IoHandle::new(rx, Arc::clone(&cancelled));

        self.shared.outstanding.increment();
        let item = Arc::new(Item::new(direction, offset, length, cancelled, tx));

        if self.shared.stop_pending.load(Ordering::SeqCst) {
            item.set_payload(payload);
            self.shared.fail_item(&item, IoStatus::DeviceNotReady);
            return handle;
        }

        let sent = match self.submit_tx.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(tx) => tx
                    .send(SubmitMessage::Item {
                        item: Arc::clone(&item),
                        payload,
                    })
                    .map_err(|e| match e.into_inner() {
                        SubmitMessage::Item { payload, .. } => payload,
                        SubmitMessage::Shutdown => Vec::new(),
                    }),
                None => Err(payload),
            },
            Err(_) => Err(Vec::new()),
        };

        if let Err(payload) = sent {
            item.set_payload(payload);
            self.shared.fail_item(&item, IoStatus::DeviceNotReady);
        }
        handle
    }

    /// Reads `length` bytes at `offset` and waits for the result.
    pub fn read(&self, offset: u64, length: usize) -> IoCompletion {
        self.submit(Direction::Read, offset, length, Vec::with_capacity(length))
            .wait()
    }

    /// Writes `data` at `offset` and waits for the result.
    pub fn write(&self, offset: u64, data: Vec<u8>) -> IoCompletion {
        let length = data.len();
        self.submit(Direction::Write, offset, length, data).wait()
    }

    /// Drains outstanding I/O and suspends admission.
    ///
    /// A zero `timeout` waits forever. On failure the queue keeps running.
    /// The hold is exclusive: while one caller drains or holds the queue,
    /// every other call fails with [`QueueError::InvalidState`].
    pub fn hold_when_idle(&self, timeout: Duration) -> Result<()> {
        self.shared.hold_when_idle(timeout)
    }

    /// Lifts a hold. Fails with [`QueueError::InvalidState`] when not held.
    pub fn resume_from_hold(&self) -> Result<()> {
        self.shared.resume_from_hold()
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspend.is_suspended()
    }

    /// False once [`EncryptedIoQueue::stop`] was called.
    pub fn is_running(&self) -> bool {
        !self.shared.stop_pending.load(Ordering::SeqCst)
    }

    /// Number of admitted, not yet completed requests.
    pub fn outstanding_io(&self) -> u64 {
        self.shared.outstanding.get()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn encrypted_area(&self) -> Result<AreaBounds> {
        self.shared.encrypted_area.get()
    }

    pub fn configured_area(&self) -> Result<AreaBounds> {
        self.shared.configured_area.get()
    }

    /// The queue must be held while the encrypted area changes.
    pub(crate) fn encrypted_area_cell(&self) -> &SharedBounds {
        &self.shared.encrypted_area
    }

    pub(crate) fn configured_area_cell(&self) -> &SharedBounds {
        &self.shared.configured_area
    }

    pub(crate) fn crypto(&self) -> &Arc<dyn CryptoContext> {
        &self.shared.crypto
    }

    pub(crate) fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.shared.device
    }

    pub(crate) fn invalidate_read_ahead(&self) {
        self.shared.read_ahead.invalidate();
    }

    /// Buffer pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    /// Reads served from the read-ahead slot.
    pub fn read_ahead_hits(&self) -> u64 {
        self.shared.read_ahead.hits()
    }

    /// Current area bounds and transfer totals.
    pub fn status(&self) -> Result<QueueStatus> {
        let encrypted = self.shared.encrypted_area.get()?;
        let configured = self.shared.configured_area.get()?;
        Ok(QueueStatus {
            encrypted: encrypted.start != crate::volume::AREA_EMPTY,
            region_start: encrypted.start,
            region_end: encrypted.end,
            configured_start: configured.start,
            configured_end: configured.end,
            total_bytes_read: self.shared.total_bytes_read.load(Ordering::SeqCst),
            total_bytes_written: self.shared.total_bytes_written.load(Ordering::SeqCst),
        })
    }

    /// Stops admission, drains outstanding I/O, joins the workers and closes
    /// the crypto context.
    ///
    /// Must not be called while the queue is held with requests waiting.
    pub fn stop(&self) -> Result<()> {
        if self.shared.stop_pending.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("Stopping queue, {} requests outstanding", self.shared.outstanding.get());
        self.shared.outstanding.wait_for_zero(Duration::ZERO)?;

        let tx = self
            .submit_tx
            .lock()
            .map_err(|_| QueueError::LockPoisoned)?
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(SubmitMessage::Shutdown);
        }

        let workers: Vec<_> = self
            .workers
            .lock()
            .map_err(|_| QueueError::LockPoisoned)?
            .drain(..)
            .collect();
        for worker in workers {
            worker
                .join()
                .map_err(|_| QueueError::InvalidState("worker thread panicked"))?;
        }

        self.shared.crypto.close();
        info!("Queue stopped");
        Ok(())
    }
}

impl Drop for EncryptedIoQueue {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                warn!("Failed to stop queue: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RemapConfig, DATA_UNIT_SIZE};
    use crate::crypto::XtsCryptoContext;
    use crate::volume::MemoryDevice;

    const DEVICE_SIZE: usize = 64 * 1024;

    fn create_queue(config: QueueConfig) -> (EncryptedIoQueue, Arc<MemoryDevice>) {
        let device = Arc::new(MemoryDevice::new(DEVICE_SIZE));
        let crypto = Arc::new(XtsCryptoContext::random());
        let queue = EncryptedIoQueue::start(config, crypto, device.clone()).unwrap();
        (queue, device)
    }

    fn encrypted_filter() -> QueueConfig {
        let area = AreaBounds::with_length(0, DEVICE_SIZE as u64);
        QueueConfig::filter().small().with_areas(area, area)
    }

    #[test]
    fn test_write_read_round_trip() {
        let (queue, device) = create_queue(encrypted_filter());
        let data: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();

        let completion = queue.write(8192, data.clone());
        assert_eq!(completion.status, IoStatus::Success);
        assert_eq!(completion.bytes_transferred, 4096);

        assert_ne!(device.raw(8192, 4096), data);
        assert_eq!(queue.read(8192, 4096).data, data);
    }

    #[test]
    fn test_plaintext_area_untouched() {
        let (queue, device) = create_queue(QueueConfig::filter().small());
        let data = vec![0x5Au8; 2048];

        assert!(queue.write(0, data.clone()).status.is_success());
        assert_eq!(device.raw(0, 2048), data);
    }

    #[test]
    fn test_unaligned_write_rejected() {
        let (queue, _device) = create_queue(encrypted_filter());
        assert_eq!(queue.write(100, vec![0u8; 512]).status, IoStatus::InvalidParameter);
        assert_eq!(queue.write(512, vec![0u8; 100]).status, IoStatus::InvalidParameter);
        assert_eq!(queue.read(0, 0).status, IoStatus::InvalidParameter);
        assert_eq!(queue.outstanding_io(), 0);
    }

    #[test]
    fn test_status_totals() {
        let (queue, _device) = create_queue(encrypted_filter());
        queue.write(0, vec![1u8; 1024]);
        queue.read(0, 512);

        let status = queue.status().unwrap();
        assert!(status.encrypted);
        assert_eq!(status.region_start, 0);
        assert_eq!(status.region_end, DEVICE_SIZE as i64 - 1);
        assert_eq!(status.total_bytes_written, 1024);
        assert_eq!(status.total_bytes_read, 512);
    }

    #[test]
    fn test_cancelled_request() {
        let (queue, _device) = create_queue(encrypted_filter());
        queue.hold_when_idle(Duration::from_millis(100)).unwrap();

        let handle = queue.submit(Direction::Write, 0, 512, vec![0u8; 512]);
        handle.cancel();
        queue.resume_from_hold().unwrap();

        assert_eq!(handle.wait().status, IoStatus::Cancelled);
    }

    #[test]
    fn test_biased_data_unit() {
        let config = QueueConfig::filter().with_remap(RemapConfig {
            remapped_area_offset: 4096,
            remapped_area_data_unit_offset: -8,
        });
        let (queue, _device) = create_queue(config);
        assert_eq!(queue.shared.biased_data_unit(10).unwrap(), 2);
        assert!(queue.shared.biased_data_unit(1).is_err());

        let mut config = QueueConfig::filter();
        config.first_data_unit = Some(100);
        let (queue, _device) = create_queue(config);
        assert_eq!(queue.shared.biased_data_unit(10).unwrap(), 110);
    }

    #[test]
    fn test_submit_after_stop() {
        let (queue, _device) = create_queue(encrypted_filter());
        queue.stop().unwrap();
        assert!(!queue.is_running());

        let completion = queue.read(0, DATA_UNIT_SIZE);
        assert_eq!(completion.status, IoStatus::DeviceNotReady);
        assert_eq!(queue.outstanding_io(), 0);
    }
}
