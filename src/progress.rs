//! Progress tracking for conversion and wipe runs.
//!
//! A [`ProgressTracker`] counts the bytes a background task has converted
//! against the total it set out to convert, and estimates rate and time
//! remaining. An optional callback is throttled so that a fast loop does
//! not flood the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callback invoked on progress updates.
///
/// Arguments are the completed fraction (0.0 to 1.0), the bytes processed
/// and the total bytes of the run.
pub type ProgressCallback = Arc<dyn Fn(f64, u64, u64) + Send + Sync>;

pub struct ProgressTracker {
    start_time: Instant,
    bytes_processed: u64,
    total_bytes: u64,
    callback: Option<ProgressCallback>,
    last_callback_time: Option<Instant>,
    callback_throttle: Duration,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("bytes_processed", &self.bytes_processed)
            .field("total_bytes", &self.total_bytes)
            .field("callback", &self.callback.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl ProgressTracker {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            start_time: Instant::now(),
            bytes_processed: 0,
            total_bytes,
            callback: None,
            last_callback_time: None,
            callback_throttle: Duration::from_millis(100),
        }
    }

    /// Restarts the run with a new total, keeping the callback.
    pub fn restart(&mut self, total_bytes: u64) {
        self.start_time = Instant::now();
        self.bytes_processed = 0;
        self.total_bytes = total_bytes;
        self.last_callback_time = None;
    }

    /// Sets the bytes processed so far and fires the callback if the
    /// throttle allows.
    pub fn update(&mut self, bytes: u64) {
        self.bytes_processed = bytes;

        if let Some(callback) = &self.callback {
            let due = self
                .last_callback_time
                .map(|last| last.elapsed() >= self.callback_throttle)
                .unwrap_or(true);

            if due {
                callback(self.progress(), self.bytes_processed, self.total_bytes);
                self.last_callback_time = Some(Instant::now());
            }
        }
    }

    pub fn increment(&mut self, delta: u64) {
        self.update(self.bytes_processed.saturating_add(delta));
    }

    /// Minimum time between two callback invocations.
    pub fn set_throttle(&mut self, duration: Duration) {
        self.callback_throttle = duration;
    }

    pub fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.callback = Some(callback);
    }

    /// Invokes the callback now, bypassing the throttle.
    pub fn force_callback(&mut self) {
        if let Some(callback) = &self.callback {
            callback(self.progress(), self.bytes_processed, self.total_bytes);
            self.last_callback_time = Some(Instant::now());
        }
    }

    /// Completed fraction, 1.0 when there is nothing to do.
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            (self.bytes_processed as f64 / self.total_bytes as f64).min(1.0)
        }
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Estimated time remaining, once enough time has passed to measure a rate.
    pub fn eta(&self) -> Option<Duration> {
        let rate = self.bytes_per_second()?;
        if rate <= 0.0 {
            return None;
        }
        let remaining = self.total_bytes.saturating_sub(self.bytes_processed);
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }

    pub fn bytes_per_second(&self) -> Option<f64> {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.1 {
            return None;
        }
        Some(self.bytes_processed as f64 / elapsed)
    }
}

/// Formats a byte count as a human-readable string.
///
/// ```
/// use secure_cryptor_queue::progress::format_bytes;
///
/// assert_eq!(format_bytes(1024), "1.0 KB");
/// assert_eq!(format_bytes(1536 * 1024), "1.5 MB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let unit_index = ((bytes_f64.log2() / 10.0).floor() as usize).min(UNITS.len() - 1);
    let value = bytes_f64 / 1024_f64.powi(unit_index as i32);

    format!("{:.1} {}", value, UNITS[unit_index])
}

/// Formats a duration as `1h 2m 3s`, dropping leading zero fields.
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();

    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_progress_tracker_basic() {
        let mut tracker = ProgressTracker::new(1000);
        assert_eq!(tracker.progress(), 0.0);
        assert_eq!(tracker.total_bytes(), 1000);

        tracker.update(500);
        assert_eq!(tracker.progress(), 0.5);

        tracker.increment(600);
        assert_eq!(tracker.bytes_processed(), 1100);
        assert_eq!(tracker.progress(), 1.0);
    }

    #[test]
    fn test_zero_total_is_complete() {
        assert_eq!(ProgressTracker::new(0).progress(), 1.0);
    }

    #[test]
    fn test_restart_keeps_callback() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();

        let mut tracker = ProgressTracker::new(100);
        tracker.set_progress_callback(Arc::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        tracker.update(100);
        tracker.restart(200);

        assert_eq!(tracker.bytes_processed(), 0);
        assert_eq!(tracker.total_bytes(), 200);
        tracker.update(50);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_throttle() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();

        let mut tracker = ProgressTracker::new(1000);
        tracker.set_progress_callback(Arc::new(move |progress, processed, total| {
            assert!((0.0..=1.0).contains(&progress));
            assert!(processed <= total);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        tracker.set_throttle(Duration::from_secs(60));

        tracker.update(250);
        tracker.update(500);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tracker.force_callback();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rate_and_eta() {
        let mut tracker = ProgressTracker::new(1000);
        assert!(tracker.bytes_per_second().is_none());
        assert!(tracker.eta().is_none());

        std::thread::sleep(Duration::from_millis(150));
        tracker.update(500);
        assert!(tracker.bytes_per_second().is_some());
        assert!(tracker.eta().is_some());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512.0 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(64 * 1024 * 1024), "64.0 MB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m 5s");
    }
}
