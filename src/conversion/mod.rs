//! Online conversion of the encrypted area.
//!
//! A [`ConversionEngine`] runs at most one conversion task (encrypt or
//! decrypt in place) and, independently, at most one decoy wipe task against
//! a running [`EncryptedIoQueue`]. Both tasks work block by block and hold
//! the queue around every device access, so foreground I/O keeps flowing
//! between blocks and never observes a half-converted block.
//!
//! ```text
//!   encrypt:  [ encrypted ........ | plaintext ............ ]
//!             start           end ──►                configured end
//!
//!   decrypt:  [ plaintext | encrypted ................. ]
//!                   start ◄── end
//! ```
//!
//! Progress is persisted through a [`PersistHeader`] so that an interrupted
//! run resumes from the last recorded bound.

mod decoy;
pub mod header;
mod setup;
pub mod wipe;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};
use zeroize::Zeroizing;

use crate::config::ConversionConfig;
use crate::error::{ConversionError, IoStatus, QueueError};
use crate::progress::{ProgressCallback, ProgressTracker};
use crate::queue::EncryptedIoQueue;
use crate::volume::AREA_EMPTY;

use decoy::DecoyWiper;
use setup::Converter;

pub use header::{DeviceHeaderStore, MemoryHeaderStore, PersistHeader, RegionRecord};
pub use wipe::{wipe_buffer, WipeAlgorithm};

pub type Result<T> = std::result::Result<T, ConversionError>;

/// Pause between hold attempts that fail without waiting.
const HOLD_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Direction of a conversion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionMode {
    Encrypt,
    Decrypt,
}

/// Parameters of a conversion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionRequest {
    pub mode: ConversionMode,
    /// Overwrite passes applied to each block before its ciphertext is
    /// written. Only used when encrypting.
    pub wipe_algorithm: Option<WipeAlgorithm>,
    /// Encryption: zero-fill unreadable sectors instead of failing.
    pub zero_unreadable: bool,
    /// Decryption: substitute zeros for unreadable sectors instead of failing.
    pub skip_unreadable: bool,
}

impl ConversionRequest {
    pub fn encrypt() -> Self {
        Self {
            mode: ConversionMode::Encrypt,
            wipe_algorithm: None,
            zero_unreadable: false,
            skip_unreadable: false,
        }
    }

    pub fn decrypt() -> Self {
        Self {
            mode: ConversionMode::Decrypt,
            ..Self::encrypt()
        }
    }

    pub fn with_wipe(mut self, algorithm: WipeAlgorithm) -> Self {
        self.wipe_algorithm = Some(algorithm);
        self
    }

    pub fn zero_unreadable(mut self) -> Self {
        self.zero_unreadable = true;
        self
    }

    pub fn skip_unreadable(mut self) -> Self {
        self.skip_unreadable = true;
        self
    }
}

/// Parameters of a decoy wipe.
pub struct WipeRequest {
    /// One-time key of the wipe cipher. Zeroized as soon as it is loaded.
    pub key: Zeroizing<Vec<u8>>,
    pub algorithm: WipeAlgorithm,
}

/// Snapshot of the conversion task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConversionStatus {
    pub running: bool,
    pub mode: Option<ConversionMode>,
    /// Current end of the encrypted area.
    pub current_end: i64,
    /// The task is waiting for foreground I/O to drain.
    pub waiting_for_idle: bool,
    /// Completed fraction of the current run.
    pub progress: f64,
    pub eta: Option<Duration>,
}

/// Snapshot of the decoy wipe task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WipeStatus {
    pub running: bool,
    pub algorithm: Option<WipeAlgorithm>,
    /// Last byte wiped so far, `-1` before the first block.
    pub wiped_end: i64,
    pub progress: f64,
}

/// Final outcome of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub status: IoStatus,
    pub message: Option<String>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// State shared between a background task and its observers.
pub(crate) struct TaskState {
    abort: AtomicBool,
    running: AtomicBool,
    waiting_for_idle: AtomicBool,
    current_end: AtomicI64,
    outcome: Mutex<Option<TaskOutcome>>,
    finished: Condvar,
    progress: Mutex<ProgressTracker>,
}

impl TaskState {
    fn new(current_end: i64, callback: Option<ProgressCallback>) -> Self {
        let mut tracker = ProgressTracker::new(0);
        if let Some(callback) = callback {
            tracker.set_progress_callback(callback);
        }

        Self {
            abort: AtomicBool::new(false),
            running: AtomicBool::new(false),
            waiting_for_idle: AtomicBool::new(false),
            current_end: AtomicI64::new(current_end),
            outcome: Mutex::new(None),
            finished: Condvar::new(),
            progress: Mutex::new(tracker),
        }
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn current_end(&self) -> i64 {
        self.current_end.load(Ordering::SeqCst)
    }

    pub fn publish_end(&self, end: i64) {
        self.current_end.store(end, Ordering::SeqCst);
    }

    pub fn set_waiting_for_idle(&self, waiting: bool) {
        self.waiting_for_idle.store(waiting, Ordering::SeqCst);
    }

    pub fn start_progress(&self, total_bytes: u64) {
        if let Ok(mut tracker) = self.progress.lock() {
            tracker.restart(total_bytes);
        }
    }

    pub fn advance(&self, bytes: u64) {
        if let Ok(mut tracker) = self.progress.lock() {
            tracker.increment(bytes);
        }
    }

    fn progress(&self) -> (f64, Option<Duration>) {
        self.progress
            .lock()
            .map(|t| (t.progress(), t.eta()))
            .unwrap_or((0.0, None))
    }

    fn complete(&self, name: &str, result: Result<()>) {
        let outcome = match result {
            Ok(()) => {
                info!("{} finished", name);
                TaskOutcome {
                    status: IoStatus::Success,
                    message: None,
                }
            }
            Err(e) => {
                error!("{} failed: {}", name, e);
                TaskOutcome {
                    status: e.status(),
                    message: Some(e.to_string()),
                }
            }
        };

        if let Ok(mut tracker) = self.progress.lock() {
            tracker.force_callback();
        }
        if let Ok(mut slot) = self.outcome.lock() {
            *slot = Some(outcome);
            self.running.store(false, Ordering::SeqCst);
            self.finished.notify_all();
        }
    }

    fn outcome(&self) -> Option<TaskOutcome> {
        self.outcome.lock().ok().and_then(|o| o.clone())
    }

    fn wait(&self, timeout: Option<Duration>) -> Option<TaskOutcome> {
        let mut outcome = self.outcome.lock().ok()?;
        match timeout {
            None => {
                while outcome.is_none() {
                    outcome = self.finished.wait(outcome).ok()?;
                }
            }
            Some(timeout) => {
                let (guard, _) = self
                    .finished
                    .wait_timeout_while(outcome, timeout, |o| o.is_none())
                    .ok()?;
                outcome = guard;
            }
        }
        outcome.clone()
    }
}

/// Handle to a running conversion or wipe task.
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

pub type ConversionHandle = TaskHandle;
pub type WipeHandle = TaskHandle;

impl TaskHandle {
    /// Asks the task to stop after the current block.
    pub fn abort(&self) {
        self.state.request_abort();
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Last published end of the converted or wiped range.
    pub fn current_end(&self) -> i64 {
        self.state.current_end()
    }

    /// Blocks until the task finishes.
    pub fn wait(&self) -> TaskOutcome {
        self.state.wait(None).unwrap_or(TaskOutcome {
            status: IoStatus::DeviceError(std::io::ErrorKind::Other),
            message: Some("task state poisoned".to_string()),
        })
    }

    /// Waits up to `timeout`; `None` if the task is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        self.state.wait(Some(timeout))
    }
}

/// Holds the queue, retrying until it succeeds or the task is aborted.
///
/// Returns false on abort.
pub(crate) fn hold_queue(queue: &EncryptedIoQueue, task: &TaskState, timeout: Duration) -> bool {
    loop {
        match queue.hold_when_idle(timeout) {
            Ok(()) => {
                task.set_waiting_for_idle(false);
                return true;
            }
            Err(e) => {
                if task.abort_requested() {
                    task.set_waiting_for_idle(false);
                    return false;
                }
                task.set_waiting_for_idle(true);
                if !matches!(e, QueueError::QuiescenceTimeout) {
                    thread::sleep(HOLD_RETRY_DELAY);
                }
            }
        }
    }
}

struct Task<K> {
    kind: K,
    state: Arc<TaskState>,
    thread: Option<JoinHandle<()>>,
}

impl<K> Task<K> {
    fn stop(&mut self) {
        self.state.request_abort();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Background task panicked");
                self.state.complete("Task", Err(ConversionError::ThreadPanicked));
            }
        }
    }
}

/// Runs conversion and decoy wipe tasks against one queue.
pub struct ConversionEngine {
    queue: Arc<EncryptedIoQueue>,
    header: Arc<dyn PersistHeader>,
    config: ConversionConfig,
    progress_callback: Option<ProgressCallback>,
    conversion: Mutex<Option<Task<ConversionMode>>>,
    wipe: Mutex<Option<Task<WipeAlgorithm>>>,
}

impl ConversionEngine {
    pub fn new(queue: Arc<EncryptedIoQueue>, header: Arc<dyn PersistHeader>, config: ConversionConfig) -> Self {
        Self {
            queue,
            header,
            config,
            progress_callback: None,
            conversion: Mutex::new(None),
            wipe: Mutex::new(None),
        }
    }

    /// Reports the progress of every later task to `callback`.
    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn queue(&self) -> &Arc<EncryptedIoQueue> {
        &self.queue
    }

    /// Starts a conversion run, aborting and joining any running one first.
    pub fn start_conversion(&self, request: ConversionRequest) -> Result<ConversionHandle> {
        let mut slot = self
            .conversion
            .lock()
            .map_err(|_| QueueError::LockPoisoned)?;

        if let Some(task) = slot.as_mut() {
            task.stop();
        }

        let current_end = self.queue.encrypted_area()?.end;
        let state = Arc::new(TaskState::new(current_end, self.progress_callback.clone()));
        let mut converter = Converter::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.header),
            self.config,
            request,
            Arc::clone(&state),
        )?;

        info!(
            "Starting {:?} (wipe {:?}, zero unreadable {}, skip unreadable {})",
            request.mode, request.wipe_algorithm, request.zero_unreadable, request.skip_unreadable
        );

        state.running.store(true, Ordering::SeqCst);
        let task_state = Arc::clone(&state);
        let spawned = thread::Builder::new()
            .name("scq-conversion".to_string())
            .spawn(move || {
                let result = converter.run();
                task_state.complete("Conversion", result);
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                state.running.store(false, Ordering::SeqCst);
                return Err(QueueError::from(e).into());
            }
        };

        *slot = Some(Task {
            kind: request.mode,
            state: Arc::clone(&state),
            thread: Some(thread),
        });
        Ok(TaskHandle { state })
    }

    /// Aborts the running conversion and waits for it to settle.
    pub fn abort_conversion(&self) -> Result<()> {
        let mut slot = self
            .conversion
            .lock()
            .map_err(|_| QueueError::LockPoisoned)?;
        if let Some(task) = slot.as_mut() {
            task.stop();
        }
        Ok(())
    }

    pub fn conversion_status(&self) -> Result<ConversionStatus> {
        let area_end = self.queue.encrypted_area()?.end;
        let slot = self
            .conversion
            .lock()
            .map_err(|_| QueueError::LockPoisoned)?;

        Ok(match slot.as_ref() {
            Some(task) => {
                let running = task.state.running.load(Ordering::SeqCst);
                let (progress, eta) = task.state.progress();
                ConversionStatus {
                    running,
                    mode: Some(task.kind),
                    current_end: if running {
                        task.state.current_end.load(Ordering::SeqCst)
                    } else {
                        area_end
                    },
                    waiting_for_idle: task.state.waiting_for_idle.load(Ordering::SeqCst),
                    progress,
                    eta,
                }
            }
            None => ConversionStatus {
                running: false,
                mode: None,
                current_end: area_end,
                waiting_for_idle: false,
                progress: 0.0,
                eta: None,
            },
        })
    }

    /// Outcome of the last finished conversion.
    pub fn conversion_result(&self) -> Option<TaskOutcome> {
        self.conversion
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(|task| task.state.outcome()))
    }

    /// Starts a decoy wipe of the configured area.
    ///
    /// If a wipe is already running, its handle is returned unchanged.
    pub fn start_wipe(&self, request: WipeRequest) -> Result<WipeHandle> {
        let mut slot = self.wipe.lock().map_err(|_| QueueError::LockPoisoned)?;

        if let Some(task) = slot.as_mut() {
            if task.state.running.load(Ordering::SeqCst) {
                return Ok(TaskHandle {
                    state: Arc::clone(&task.state),
                });
            }
            task.stop();
        }

        let state = Arc::new(TaskState::new(AREA_EMPTY, self.progress_callback.clone()));
        let algorithm = request.algorithm;
        let mut wiper = DecoyWiper::new(Arc::clone(&self.queue), self.config, request, Arc::clone(&state))?;

        info!("Starting decoy wipe ({})", algorithm);

        state.running.store(true, Ordering::SeqCst);
        let task_state = Arc::clone(&state);
        let spawned = thread::Builder::new()
            .name("scq-decoy-wipe".to_string())
            .spawn(move || {
                let result = wiper.run();
                task_state.complete("Decoy wipe", result);
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                state.running.store(false, Ordering::SeqCst);
                return Err(QueueError::from(e).into());
            }
        };

        *slot = Some(Task {
            kind: algorithm,
            state: Arc::clone(&state),
            thread: Some(thread),
        });
        Ok(TaskHandle { state })
    }

    pub fn abort_wipe(&self) -> Result<()> {
        let mut slot = self.wipe.lock().map_err(|_| QueueError::LockPoisoned)?;
        if let Some(task) = slot.as_mut() {
            task.stop();
        }
        Ok(())
    }

    pub fn wipe_status(&self) -> WipeStatus {
        let slot = self.wipe.lock().ok();
        match slot.as_ref().and_then(|s| s.as_ref()) {
            Some(task) => WipeStatus {
                running: task.state.running.load(Ordering::SeqCst),
                algorithm: Some(task.kind),
                wiped_end: task.state.current_end.load(Ordering::SeqCst),
                progress: task.state.progress().0,
            },
            None => WipeStatus {
                running: false,
                algorithm: None,
                wiped_end: AREA_EMPTY,
                progress: 0.0,
            },
        }
    }

    pub fn wipe_result(&self) -> Option<TaskOutcome> {
        self.wipe
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(|task| task.state.outcome()))
    }
}

impl Drop for ConversionEngine {
    fn drop(&mut self) {
        if let Ok(slot) = self.conversion.get_mut() {
            if let Some(task) = slot.as_mut() {
                task.stop();
            }
        }
        if let Ok(slot) = self.wipe.get_mut() {
            if let Some(task) = slot.as_mut() {
                task.stop();
            }
        }
    }
}
