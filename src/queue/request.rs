//! Requests flowing through the pipeline.
//!
//! An [`Item`] is one logical request as submitted by a caller. Submission
//! splits it into [`Fragment`]s, which are moved stage to stage through the
//! channels and never shared. The item itself is shared by its fragments and
//! records the first failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel as chan;

use crate::error::IoStatus;
use crate::memory::FragmentBuffer;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Final result of a submitted request.
#[derive(Debug)]
pub struct IoCompletion {
    pub status: IoStatus,
    pub bytes_transferred: usize,
    /// Data read, or the submitted payload for writes.
    pub data: Vec<u8>,
}

impl IoCompletion {
    pub(crate) fn failed(status: IoStatus, data: Vec<u8>) -> Self {
        Self {
            status,
            bytes_transferred: 0,
            data,
        }
    }
}

/// Pending request returned by `EncryptedIoQueue::submit`.
pub struct IoHandle {
    receiver: chan::Receiver<IoCompletion>,
    cancelled: Arc<AtomicBool>,
}

impl IoHandle {
    pub(crate) fn new(receiver: chan::Receiver<IoCompletion>, cancelled: Arc<AtomicBool>) -> Self {
        Self { receiver, cancelled }
    }

    /// Marks the request cancelled. Has no effect once it was admitted to
    /// submission.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Blocks until the request completes.
    pub fn wait(self) -> IoCompletion {
        self.receiver
            .recv()
            .unwrap_or_else(|_| IoCompletion::failed(IoStatus::DeviceNotReady, Vec::new()))
    }

    /// Waits up to `timeout` for completion.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<IoCompletion> {
        match self.receiver.recv_timeout(timeout) {
            Ok(completion) => Some(completion),
            Err(chan::RecvTimeoutError::Timeout) => None,
            Err(chan::RecvTimeoutError::Disconnected) => {
                Some(IoCompletion::failed(IoStatus::DeviceNotReady, Vec::new()))
            }
        }
    }

    /// Returns the completion if it is already available.
    pub fn try_wait(&self) -> Option<IoCompletion> {
        self.receiver.try_recv().ok()
    }
}

struct ItemState {
    status: IoStatus,
    /// Write data, or the read assembly buffer. Handed back on completion.
    payload: Vec<u8>,
    completed: bool,
}

/// One logical request.
pub(crate) struct Item {
    pub direction: Direction,
    pub offset: u64,
    pub length: usize,
    cancelled: Arc<AtomicBool>,
    state: Mutex<ItemState>,
    sender: chan::Sender<IoCompletion>,
}

impl Item {
    pub fn new(
        direction: Direction,
        offset: u64,
        length: usize,
        cancelled: Arc<AtomicBool>,
        sender: chan::Sender<IoCompletion>,
    ) -> Self {
        Self {
            direction,
            offset,
            length,
            cancelled,
            state: Mutex::new(ItemState {
                status: IoStatus::Success,
                payload: Vec::new(),
                completed: false,
            }),
            sender,
        }
    }

    pub fn is_write(&self) -> bool {
        self.direction == Direction::Write
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> IoStatus {
        self.state
            .lock()
            .map(|s| s.status)
            .unwrap_or(IoStatus::DeviceError(std::io::ErrorKind::Other))
    }

    pub fn is_ok(&self) -> bool {
        self.status().is_success()
    }

    /// Records a failure unless an earlier one is already recorded.
    pub fn fail(&self, status: IoStatus) {
        if let Ok(mut state) = self.state.lock() {
            if state.status.is_success() {
                state.status = status;
            }
        }
    }

    pub fn set_payload(&self, payload: Vec<u8>) {
        if let Ok(mut state) = self.state.lock() {
            state.payload = payload;
        }
    }

    /// Runs `f` on the payload. `None` once the item has completed.
    pub fn with_payload<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut state = self.state.lock().ok()?;
        if state.completed {
            return None;
        }
        Some(f(&mut state.payload))
    }

    /// Marks the item completed and returns its status and payload.
    ///
    /// Returns `None` if the item was already completed.
    pub fn finish(&self) -> Option<(IoStatus, Vec<u8>)> {
        let mut state = self.state.lock().ok()?;
        if state.completed {
            return None;
        }
        state.completed = true;
        Some((state.status, std::mem::take(&mut state.payload)))
    }

    pub fn send(&self, completion: IoCompletion) {
        // The submitter may have dropped its handle
        let _ = self.sender.send(completion);
    }
}

/// One slice of an item, owned by a single stage at a time.
pub(crate) struct Fragment {
    pub item: Arc<Item>,
    /// Device offset of the slice.
    pub offset: u64,
    pub length: usize,
    /// Position of the slice in the item payload.
    pub item_offset: usize,
    /// Encrypted sub-range relative to `offset`.
    pub encrypted_offset: usize,
    pub encrypted_length: usize,
    pub buffer: Option<FragmentBuffer>,
    pub complete_original: bool,
}

/// Message to the submission stage.
pub(crate) enum SubmitMessage {
    Item { item: Arc<Item>, payload: Vec<u8> },
    Shutdown,
}

/// Message between the device I/O and completion stages.
pub(crate) enum StageMessage {
    Fragment(Fragment),
    Shutdown,
}
