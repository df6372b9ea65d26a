//! Common utilities for pos-runtime
//!
//! This crate provides the pieces shared by the engine and the binaries:
//! the counting-semaphore sync primitive, the byte-stream transport boundary,
//! error handling and logging setup.

pub mod error;
pub mod logging;
pub mod sync;
pub mod test_utils;
pub mod transport;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use sync::{SyncObject, Timeout, lock_unpoisoned};
pub use transport::{LoopbackTransport, Transport, loopback_pair};
