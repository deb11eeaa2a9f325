//! Shutdown coordination shared by the daemon's front-ends.
//!
//! The front-ends run as OS-thread pools blocked in `accept`/`recv_from`,
//! not tokio tasks, so there is no task set to cancel. What they need is a
//! flag to stop picking up new work, and a way for the process entry point
//! to wait for in-flight requests to finish before exiting.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared shutdown flag plus an in-flight request counter, handed to every
/// front-end at startup.
#[derive(Clone)]
pub struct ShutdownHandle {
    shutting_down: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl ShutdownHandle {
    pub fn new() -> ShutdownHandle {
        ShutdownHandle {
            shutting_down: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Marks one request as started; the returned guard decrements the
    /// counter on drop, including on panic.
    pub fn track_request(&self) -> RequestGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        RequestGuard {
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Blocks (via polling sleep) until every tracked request finishes or
    /// `timeout` elapses, whichever comes first. Returns `true` if drained
    /// cleanly.
    pub fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight_count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        true
    }
}

impl Default for ShutdownHandle {
    fn default() -> ShutdownHandle {
        ShutdownHandle::new()
    }
}

pub struct RequestGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_in_flight_requests() {
        let handle = ShutdownHandle::new();
        assert_eq!(handle.in_flight_count(), 0);
        {
            let _guard = handle.track_request();
            assert_eq!(handle.in_flight_count(), 1);
        }
        assert_eq!(handle.in_flight_count(), 0);
    }

    #[test]
    fn drain_returns_false_on_timeout_with_outstanding_work() {
        let handle = ShutdownHandle::new();
        let _guard = handle.track_request();
        assert!(!handle.wait_for_drain(Duration::from_millis(100)));
    }

    #[test]
    fn drain_returns_true_once_empty() {
        let handle = ShutdownHandle::new();
        assert!(handle.wait_for_drain(Duration::from_millis(100)));
    }

    #[test]
    fn begin_shutdown_sets_flag() {
        let handle = ShutdownHandle::new();
        assert!(!handle.is_shutting_down());
        handle.begin_shutdown();
        assert!(handle.is_shutting_down());
    }
}
