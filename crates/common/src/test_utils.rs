//! Test utilities for pos-runtime
//!
//! Helpers shared by the unit and integration tests of every crate. The
//! runtime is thread based, so most assertions poll for a condition instead of
//! awaiting a future.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{wait_for, DEFAULT_TEST_TIMEOUT};
//! use std::sync::atomic::{AtomicBool, Ordering};
//!
//! let flag = AtomicBool::new(true);
//! assert!(wait_for(DEFAULT_TEST_TIMEOUT, || flag.load(Ordering::SeqCst)));
//! ```

use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between two evaluations of a polled condition
pub const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Poll `condition` until it holds or `timeout` elapses
///
/// Returns whether the condition was observed to hold.
pub fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Assert that `condition` keeps failing for the whole of `window`
///
/// Used to check that something does *not* happen, e.g. a cancelled delayed
/// event never firing.
pub fn stays_false<F>(window: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        if condition() {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    !condition()
}
