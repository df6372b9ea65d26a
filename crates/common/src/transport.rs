//! Byte-stream transport boundary
//!
//! Leaf device implementations talk to their hardware through a [`Transport`].
//! The runtime itself never touches one. Serial, TCP, UDP and TLS adapters
//! live outside this workspace; [`loopback_pair`] provides an in-memory pair
//! for tests and the simulator.

use crate::sync::{Timeout, lock_unpoisoned};
use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Instant;

/// Blocking byte stream with a configurable read timeout
pub trait Transport: Send {
    /// Open the underlying connection
    fn open(&mut self) -> Result<()>;

    /// Close the connection; further reads and writes fail with [`Error::Closed`]
    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Read up to `max` bytes
    ///
    /// Blocks until at least one byte is available or the configured timeout
    /// elapses. A timeout yields an empty buffer, not an error.
    fn read(&mut self, max: usize) -> Result<Bytes>;

    /// Write all of `data`, returning the number of bytes written
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    fn flush(&mut self) -> Result<()>;

    /// Bytes that can be read without blocking
    fn available(&self) -> Result<usize>;

    fn set_timeout(&mut self, timeout: Timeout);

    fn timeout(&self) -> Timeout;
}

/// One direction of a loopback connection
#[derive(Debug, Default)]
struct Pipe {
    buffer: Mutex<BytesMut>,
    readable: Condvar,
    closed: AtomicBool,
}

impl Pipe {
    fn push(&self, data: &[u8]) {
        let mut buffer = lock_unpoisoned(&self.buffer);
        buffer.extend_from_slice(data);
        self.readable.notify_all();
    }

    fn take(&self, max: usize, timeout: Timeout) -> Result<Bytes> {
        let deadline = timeout
            .as_duration()
            .and_then(|limit| Instant::now().checked_add(limit));
        let mut buffer = lock_unpoisoned(&self.buffer);

        while buffer.is_empty() {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Bytes::new());
                    }
                    let (guard, _) = self
                        .readable
                        .wait_timeout(buffer, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    buffer = guard;
                }
                None => {
                    buffer = self
                        .readable
                        .wait(buffer)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }

        let count = max.min(buffer.len());
        Ok(buffer.split_to(count).freeze())
    }

    fn len(&self) -> usize {
        lock_unpoisoned(&self.buffer).remaining()
    }

    fn shut(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = lock_unpoisoned(&self.buffer);
        self.readable.notify_all();
    }
}

/// In-memory transport endpoint created by [`loopback_pair`]
#[derive(Debug)]
pub struct LoopbackTransport {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
    open: bool,
    timeout: Timeout,
}

/// Create two connected endpoints: bytes written to one are read from the other
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
    let a_to_b = Arc::new(Pipe::default());
    let b_to_a = Arc::new(Pipe::default());

    (
        LoopbackTransport {
            incoming: b_to_a.clone(),
            outgoing: a_to_b.clone(),
            open: false,
            timeout: Timeout::INFINITE,
        },
        LoopbackTransport {
            incoming: a_to_b,
            outgoing: b_to_a,
            open: false,
            timeout: Timeout::INFINITE,
        },
    )
}

impl LoopbackTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::Transport("Transport not open".to_string()))
        }
    }
}

impl Transport for LoopbackTransport {
    fn open(&mut self) -> Result<()> {
        if self.outgoing.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        self.outgoing.shut();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self, max: usize) -> Result<Bytes> {
        self.ensure_open()?;
        self.incoming.take(max, self.timeout)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        if self.outgoing.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.outgoing.push(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.ensure_open()
    }

    fn available(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.incoming.len())
    }

    fn set_timeout(&mut self, timeout: Timeout) {
        self.timeout = timeout;
    }

    fn timeout(&self) -> Timeout {
        self.timeout
    }
}
