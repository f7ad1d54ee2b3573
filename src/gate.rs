//! # Rate gate
//! Sliding-window admission control over a timestamp deque.
//!
//! One instance per ceiling: the HTTP layer consults an inbound gate
//! (100/1s) and the analysis client an outbound gate (10/1s). Instances
//! share no state and are handed to their consumers explicitly.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Thread-safe sliding-window limiter.
///
/// `admit` purges expired admissions, checks capacity and appends in one
/// critical section, so concurrent callers can never overshoot the ceiling.
#[derive(Debug)]
pub struct RateGate {
    inner: Mutex<Inner>,
    capacity: usize,
    window: Duration,
}

#[derive(Debug)]
struct Inner {
    /// Admission instants, oldest at the front.
    admitted: VecDeque<Instant>,
}

impl RateGate {
    /// Create a gate allowing `capacity` admissions per `window`.
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                admitted: VecDeque::new(),
            }),
            capacity,
            window,
        }
    }

    /// Convenience constructor for per-second ceilings.
    pub fn per_second(capacity: usize) -> Self {
        Self::new(capacity, Duration::from_secs(1))
    }

    /// Try to admit one call right now. Returns `false` when the window is full.
    pub fn admit(&self) -> bool {
        self.admit_at(Instant::now())
    }

    /// Advisory wait in whole seconds until the oldest retained admission
    /// leaves the window, or 0 when nothing is retained. Read-only; a caller
    /// that waits this long and retries `admit` succeeds unless other
    /// admissions landed in between.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_at(Instant::now())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Window length in seconds (diagnostics).
    pub fn window_secs(&self) -> u64 {
        self.window.as_secs()
    }

    fn admit_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock().expect("rate gate mutex poisoned");
        while let Some(&t) = inner.admitted.front() {
            if now.duration_since(t) >= self.window {
                inner.admitted.pop_front();
            } else {
                break;
            }
        }
        if inner.admitted.len() < self.capacity {
            inner.admitted.push_back(now);
            true
        } else {
            false
        }
    }

    fn retry_after_at(&self, now: Instant) -> u64 {
        let inner = self.inner.lock().expect("rate gate mutex poisoned");
        let Some(&oldest) = inner.admitted.front() else {
            return 0;
        };
        let elapsed = now.duration_since(oldest);
        if elapsed >= self.window {
            return 0;
        }
        (self.window - elapsed).as_secs_f64().ceil() as u64
    }
}
