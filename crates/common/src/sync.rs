//! Counting semaphore and wait bounds
//!
//! [`SyncObject`] is the single blocking primitive of the runtime. Command
//! completion, abort acknowledgement, claim waiting, delayed status timers and
//! bounded callback waits are all expressed as `signal()` / `suspend()` pairs
//! on one of these.

use serde::{Deserialize, Serialize};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the guard if a panicking thread poisoned it.
///
/// Every monitor in the runtime protects plain bookkeeping that stays
/// consistent across a panic in user code, so poisoning is not fatal.
pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Upper bound for a blocking wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeout {
    /// Wait until signalled, however long that takes
    Infinite,
    /// Wait at most this many milliseconds
    Millis(u64),
}

impl Timeout {
    /// The infinite sentinel
    pub const INFINITE: Timeout = Timeout::Infinite;

    /// Do not block at all
    pub const IMMEDIATE: Timeout = Timeout::Millis(0);

    pub const fn from_millis(millis: u64) -> Self {
        Timeout::Millis(millis)
    }

    /// Bound by a duration, saturating at `u64::MAX` milliseconds
    pub fn from_duration(duration: Duration) -> Self {
        Timeout::Millis(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// `None` for the infinite sentinel
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Timeout::Infinite => None,
            Timeout::Millis(ms) => Some(Duration::from_millis(*ms)),
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Timeout::Infinite)
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::Infinite
    }
}

impl From<Option<u64>> for Timeout {
    /// Absent millisecond values map to the infinite sentinel
    fn from(millis: Option<u64>) -> Self {
        millis.map_or(Timeout::Infinite, Timeout::Millis)
    }
}

impl std::fmt::Display for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Timeout::Infinite => write!(f, "infinite"),
            Timeout::Millis(ms) => write!(f, "{}ms", ms),
        }
    }
}

/// Counting semaphore with timed waits
///
/// Starts with zero permits. `signal()` adds one permit and wakes one waiter;
/// `suspend()` consumes one permit, blocking until one is available or the
/// timeout elapses. Signals sent before anyone waits are not lost.
#[derive(Debug, Default)]
pub struct SyncObject {
    permits: Mutex<usize>,
    available: Condvar,
}

impl SyncObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release one permit
    pub fn signal(&self) {
        let mut permits = lock_unpoisoned(&self.permits);
        *permits += 1;
        self.available.notify_one();
    }

    /// Acquire one permit, waiting at most `timeout`
    ///
    /// Returns `true` if a permit was acquired, `false` on timeout.
    pub fn suspend(&self, timeout: Timeout) -> bool {
        let mut permits = lock_unpoisoned(&self.permits);

        let deadline = timeout
            .as_duration()
            .and_then(|limit| Instant::now().checked_add(limit));

        match (timeout, deadline) {
            (Timeout::Millis(_), Some(deadline)) => {
                while *permits == 0 {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .available
                        .wait_timeout(permits, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    permits = guard;
                }
            }
            // Infinite, or a bound too large to represent as an Instant
            _ => {
                while *permits == 0 {
                    permits = self
                        .available
                        .wait(permits)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }

        *permits -= 1;
        true
    }

    /// Acquire a permit only if one is immediately available
    pub fn try_acquire(&self) -> bool {
        self.suspend(Timeout::IMMEDIATE)
    }

    /// Discard all outstanding permits, returning how many there were
    pub fn drain(&self) -> usize {
        let mut permits = lock_unpoisoned(&self.permits);
        std::mem::take(&mut *permits)
    }

    /// Number of outstanding permits
    pub fn available(&self) -> usize {
        *lock_unpoisoned(&self.permits)
    }
}
