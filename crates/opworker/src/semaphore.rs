//! Counting semaphore built on a mutex and condition variable.
//!
//! The scheduler uses two of these: `ops_available`, whose permit count
//! mirrors the number of entries across both operation queues (plus transient
//! pseudo-permits released by the shutdown and bulk-cancel paths), and the
//! startup/shutdown rendezvous shared between the worker thread and its
//! owner.

use std::sync::{Condvar, Mutex};

/// A counting semaphore.
///
/// `acquire` blocks until a permit is available; `release` adds permits and
/// wakes blocked acquirers. The current permit count is observable through
/// `permits()`, which the scheduler's accounting tests rely on.
pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `permits` initial permits.
    pub(crate) fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub(crate) fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.available.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    /// Take a permit if one is available right now.
    pub(crate) fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock().unwrap();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Add `n` permits and wake blocked acquirers.
    pub(crate) fn release(&self, n: usize) {
        let mut permits = self.permits.lock().unwrap();
        *permits += n;
        // contending acquirers re-check the count after waking
        self.available.notify_all();
    }

    /// Current permit count.
    pub(crate) fn permits(&self) -> usize {
        *self.permits.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_new_semaphore_holds_initial_permits() {
        let semaphore = Semaphore::new(3);
        assert_eq!(semaphore.permits(), 3);
    }

    #[test]
    fn test_acquire_consumes_a_permit() {
        let semaphore = Semaphore::new(2);
        semaphore.acquire();
        assert_eq!(semaphore.permits(), 1);
        semaphore.acquire();
        assert_eq!(semaphore.permits(), 0);
    }

    #[test]
    fn test_try_acquire_fails_when_empty() {
        let semaphore = Semaphore::new(1);
        assert!(semaphore.try_acquire());
        assert!(!semaphore.try_acquire());
        assert_eq!(semaphore.permits(), 0);
    }

    #[test]
    fn test_release_adds_permits() {
        let semaphore = Semaphore::new(0);
        semaphore.release(2);
        assert_eq!(semaphore.permits(), 2);
    }

    #[test]
    fn test_release_wakes_blocked_acquirer() {
        let semaphore = Arc::new(Semaphore::new(0));
        let blocked = semaphore.clone();

        let waiter = thread::spawn(move || {
            blocked.acquire();
        });

        // give the waiter a moment to park on the empty semaphore
        thread::sleep(Duration::from_millis(50));
        semaphore.release(1);

        waiter.join().expect("acquirer should be woken by release");
        assert_eq!(semaphore.permits(), 0);
    }
}
