//! Quiescence controller.
//!
//! A holder (the conversion engine) asks the queue to stop admitting new
//! requests and waits for the outstanding counter to drain. While the queue
//! is held, no fragment is in the device I/O or completion stage and
//! submission blocks on the resume signal, which makes it safe to move the
//! encrypted area bound.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use super::QueueShared;
use crate::error::{QueueError, Result};

/// Grace period before re-checking the counter after a drain wake-up.
const DRAIN_GRACE: Duration = Duration::from_millis(1);

/// Number of admitted, not yet completed items (plus an active read-ahead).
pub(crate) struct OutstandingIo {
    count: Mutex<u64>,
    drained: Condvar,
}

impl OutstandingIo {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    pub fn increment(&self) {
        if let Ok(mut count) = self.count.lock() {
            *count += 1;
        }
    }

    pub fn decrement(&self) {
        if let Ok(mut count) = self.count.lock() {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.drained.notify_all();
            }
        }
    }

    pub fn get(&self) -> u64 {
        self.count.lock().map(|c| *c).unwrap_or(0)
    }

    /// Waits until the counter reaches zero. A zero `timeout` waits forever.
    ///
    /// Returns false on timeout.
    pub fn wait_for_zero(&self, timeout: Duration) -> Result<bool> {
        let mut count = self.count.lock().map_err(|_| QueueError::LockPoisoned)?;

        if timeout.is_zero() {
            while *count > 0 {
                count = self.drained.wait(count).map_err(|_| QueueError::LockPoisoned)?;
            }
            return Ok(true);
        }

        let deadline = Instant::now() + timeout;
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (guard, _) = self
                .drained
                .wait_timeout(count, deadline - now)
                .map_err(|_| QueueError::LockPoisoned)?;
            count = guard;
        }
        Ok(true)
    }
}

/// Suspension flags of a queue.
pub(crate) struct SuspendState {
    suspended: Mutex<bool>,
    resumed: Condvar,
    /// Claimed by one holder from the start of its drain until it resumes.
    owned: AtomicBool,
}

impl SuspendState {
    pub fn new() -> Self {
        Self {
            suspended: Mutex::new(false),
            resumed: Condvar::new(),
            owned: AtomicBool::new(false),
        }
    }

    /// Claims the hold. False if another holder owns it.
    fn claim(&self) -> bool {
        self.owned
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release(&self) {
        self.owned.store(false, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.lock().map(|s| *s).unwrap_or(false)
    }

    fn set(&self, value: bool) -> Result<()> {
        let mut suspended = self.suspended.lock().map_err(|_| QueueError::LockPoisoned)?;
        *suspended = value;
        if !value {
            self.resumed.notify_all();
        }
        Ok(())
    }

    /// Blocks while the queue is suspended.
    pub fn wait_while_suspended(&self) -> Result<()> {
        let mut suspended = self.suspended.lock().map_err(|_| QueueError::LockPoisoned)?;
        while *suspended {
            suspended = self.resumed.wait(suspended).map_err(|_| QueueError::LockPoisoned)?;
        }
        Ok(())
    }
}

impl QueueShared {
    /// Waits for all outstanding I/O to drain and suspends admission.
    ///
    /// A zero `timeout` waits forever. On failure the queue is left running.
    /// Only one holder at a time gets past the claim; any other caller fails
    /// with `InvalidState` until the hold is resumed.
    pub(crate) fn hold_when_idle(&self, timeout: Duration) -> Result<()> {
        if !self.suspend.claim() {
            return Err(QueueError::InvalidState("queue is already held"));
        }

        match self.drain_and_suspend(timeout) {
            Ok(()) => {
                self.read_ahead.invalidate();
                Ok(())
            }
            Err(e) => {
                self.suspend.release();
                Err(e)
            }
        }
    }

    fn drain_and_suspend(&self, timeout: Duration) -> Result<()> {
        loop {
            while self.outstanding.get() > 0 {
                if !self.outstanding.wait_for_zero(timeout)? {
                    debug!("Hold timed out with {} requests outstanding", self.outstanding.get());
                    return Err(QueueError::QuiescenceTimeout);
                }

                thread::sleep(DRAIN_GRACE);
                if self.outstanding.get() > 0 {
                    return Err(QueueError::QuiescenceTimeout);
                }
            }

            self.suspend.set(true)?;

            if self.outstanding.get() == 0 {
                return Ok(());
            }

            // A request slipped in before the flag was visible
            self.suspend.set(false)?;
        }
    }

    /// Lifts a hold and wakes blocked admissions.
    pub(crate) fn resume_from_hold(&self) -> Result<()> {
        if !self.suspend.is_suspended() {
            return Err(QueueError::InvalidState("queue is not held"));
        }
        self.suspend.set(false)?;
        self.suspend.release();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_outstanding_counter() {
        let io = OutstandingIo::new();
        io.increment();
        io.increment();
        assert_eq!(io.get(), 2);
        io.decrement();
        io.decrement();
        io.decrement();
        assert_eq!(io.get(), 0);
    }

    #[test]
    fn test_wait_for_zero_timeout() {
        let io = OutstandingIo::new();
        io.increment();
        assert!(!io.wait_for_zero(Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn test_wait_for_zero_wakes() {
        let io = Arc::new(OutstandingIo::new());
        io.increment();

        let waker = Arc::clone(&io);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.decrement();
        });

        assert!(io.wait_for_zero(Duration::ZERO).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_claim_is_exclusive() {
        let state = SuspendState::new();
        assert!(state.claim());
        assert!(!state.claim());
        state.release();
        assert!(state.claim());
    }

    #[test]
    fn test_suspend_blocks_until_resumed() {
        let state = Arc::new(SuspendState::new());
        state.set(true).unwrap();
        assert!(state.is_suspended());

        let waiter_state = Arc::clone(&state);
        let waiter = thread::spawn(move || waiter_state.wait_while_suspended().is_ok());

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        state.set(false).unwrap();
        assert!(waiter.join().unwrap());
    }
}
