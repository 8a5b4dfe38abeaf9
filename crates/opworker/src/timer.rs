//! Single-shot timeout timer for the operation in flight.
//!
//! The worker thread spends operation execution blocked inside user code, so
//! timeouts are watched from a dedicated timer thread. Only one shot is ever
//! armed (the one for the current operation). Every shot carries a
//! generation number; the scheduler validates the generation before acting
//! on a fire, so a timeout racing a normal completion or a re-arm resolves
//! to exactly one winner.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy)]
struct Shot {
    generation: u64,
    deadline: Instant,
}

struct TimerState {
    armed: Option<Shot>,
    next_generation: u64,
    shutdown: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    changed: Condvar,
}

/// One timer thread watching at most one pending deadline.
///
/// `arm` replaces any pending shot; `disarm` clears it. When the deadline
/// passes, the fire callback receives the shot's generation and must claim
/// it with [`TimeoutTimer::disarm_if`] before acting.
pub(crate) struct TimeoutTimer {
    inner: Arc<TimerInner>,
    thread: Option<JoinHandle<()>>,
}

impl TimeoutTimer {
    pub(crate) fn new<F>(on_fire: F) -> Self
    where
        F: Fn(u64) + Send + 'static,
    {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                armed: None,
                next_generation: 1,
                shutdown: false,
            }),
            changed: Condvar::new(),
        });
        let thread_inner = inner.clone();
        let thread = thread::Builder::new()
            .name("operation-timeout".to_string())
            .spawn(move || Self::run(thread_inner, on_fire))
            .expect("Failed to spawn timeout timer thread");

        Self {
            inner,
            thread: Some(thread),
        }
    }

    /// Arm a shot `timeout` from now, replacing any pending one. Returns the
    /// shot's generation.
    pub(crate) fn arm(&self, timeout: Duration) -> u64 {
        let mut state = self.inner.state.lock().unwrap();
        let generation = state.next_generation;
        state.next_generation += 1;
        state.armed = Some(Shot {
            generation,
            deadline: Instant::now() + timeout,
        });
        self.inner.changed.notify_all();
        generation
    }

    /// Clear any pending shot.
    pub(crate) fn disarm(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.armed = None;
        self.inner.changed.notify_all();
    }

    /// Clear the pending shot only if it is still `generation`. Returns
    /// `true` when this call consumed the shot; a `false` means the shot was
    /// superseded or already disarmed and the fire must be ignored.
    pub(crate) fn disarm_if(&self, generation: u64) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        match state.armed {
            Some(shot) if shot.generation == generation => {
                state.armed = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.inner.state.lock().unwrap().armed.is_some()
    }

    fn run<F>(inner: Arc<TimerInner>, on_fire: F)
    where
        F: Fn(u64),
    {
        let mut state = inner.state.lock().unwrap();
        loop {
            if state.shutdown {
                break;
            }
            match state.armed {
                None => {
                    state = inner.changed.wait(state).unwrap();
                }
                Some(shot) => {
                    let now = Instant::now();
                    if now < shot.deadline {
                        let (guard, _) = inner
                            .changed
                            .wait_timeout(state, shot.deadline - now)
                            .unwrap();
                        state = guard;
                    } else {
                        drop(state);
                        on_fire(shot.generation);
                        state = inner.state.lock().unwrap();
                        // a fire that nobody claimed (the scheduler is gone)
                        // must not leave an expired shot spinning this loop
                        if let Some(pending) = state.armed {
                            if pending.generation == shot.generation {
                                state.armed = None;
                            }
                        }
                    }
                }
            }
        }
    }
}

impl Drop for TimeoutTimer {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
        }
        self.inner.changed.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn wait_for(condition: impl Fn() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_fires_after_deadline() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();
        let timer = TimeoutTimer::new(move |generation| {
            fired_cb.fetch_add(1, Ordering::SeqCst);
            let _ = generation;
        });

        timer.arm(Duration::from_millis(30));
        assert!(wait_for(
            || fired.load(Ordering::SeqCst) == 1,
            Duration::from_secs(2)
        ));
    }

    #[test]
    fn test_fire_reports_the_armed_generation() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = seen.clone();
        let timer = TimeoutTimer::new(move |generation| {
            seen_cb.store(generation, Ordering::SeqCst);
        });

        let generation = timer.arm(Duration::from_millis(20));
        assert!(wait_for(
            || seen.load(Ordering::SeqCst) == generation,
            Duration::from_secs(2)
        ));
    }

    #[test]
    fn test_disarm_prevents_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();
        let timer = TimeoutTimer::new(move |_| {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        });

        timer.arm(Duration::from_millis(60));
        timer.disarm();
        assert!(!timer.is_armed());

        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rearm_supersedes_previous_shot() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let timer = TimeoutTimer::new(move |generation| {
            seen_cb.lock().unwrap().push(generation);
        });

        let first = timer.arm(Duration::from_millis(200));
        let second = timer.arm(Duration::from_millis(20));
        assert!(second > first);

        assert!(wait_for(
            || !seen.lock().unwrap().is_empty(),
            Duration::from_secs(2)
        ));
        thread::sleep(Duration::from_millis(250));
        assert_eq!(*seen.lock().unwrap(), vec![second]);
    }

    #[test]
    fn test_disarm_if_claims_only_matching_generation() {
        let timer = TimeoutTimer::new(|_| {});
        let generation = timer.arm(Duration::from_secs(60));

        assert!(!timer.disarm_if(generation + 1));
        assert!(timer.is_armed());

        assert!(timer.disarm_if(generation));
        assert!(!timer.is_armed());

        // the shot is consumed; a second claim must fail
        assert!(!timer.disarm_if(generation));
    }

    #[test]
    fn test_drop_joins_the_timer_thread() {
        let timer = TimeoutTimer::new(|_| {});
        timer.arm(Duration::from_secs(60));
        drop(timer);
        // drop is successful if this returns without hanging
    }
}
