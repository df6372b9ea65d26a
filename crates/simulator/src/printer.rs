//! Simulated receipt printer
//!
//! The printer mechanism sits at the far end of a loopback transport and
//! counts the lines it receives. [`PrinterClass`] supplies the class hooks
//! and [`print_line`] builds the asynchronous command printing one line.

use crate::config::PrinterSettings;
use anyhow::{Context, Result};
use common::{LoopbackTransport, Transport, lock_unpoisoned, loopback_pair};
use engine::{
    DeviceClass, DeviceError, FnTask, SessionProps, StatusDelta, Task, TaskContext,
    class::power_status_delta,
};
use rand::Rng;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Printer status values
pub mod status {
    pub const COVER_OPEN: i32 = 11;
    pub const COVER_OK: i32 = 12;
    pub const REC_EMPTY: i32 = 24;
    pub const REC_NEAR_EMPTY: i32 = 25;
    pub const REC_PAPER_OK: i32 = 26;
    /// Raised when a session asked to be told it went idle
    pub const IDLE: i32 = 1001;
}

/// Extended error code of a paper jam
pub const EXTENDED_JAM: i32 = 201;

/// Receipt printer class hooks
#[derive(Debug, Default)]
pub struct PrinterClass;

impl DeviceClass for PrinterClass {
    fn name(&self) -> &str {
        "POSPrinter"
    }

    fn status_delta(&self, _props: &SessionProps, value: i32) -> StatusDelta {
        let mut delta = power_status_delta(value);
        delta.observable |= matches!(
            value,
            status::COVER_OPEN
                | status::COVER_OK
                | status::REC_EMPTY
                | status::REC_NEAR_EMPTY
                | status::REC_PAPER_OK
        );
        delta
    }

    fn idle_status(&self) -> i32 {
        status::IDLE
    }
}

/// The printing end of the loopback connection
pub struct Mechanism {
    host: Mutex<LoopbackTransport>,
    lines: Arc<AtomicU64>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Mechanism {
    /// Connect a new mechanism, optionally copying its output to `output`
    pub fn start(output: Option<PathBuf>) -> Result<Arc<Mechanism>> {
        let (mut host, mut device) = loopback_pair();
        host.open().context("Failed to open host side of the printer")?;
        device
            .open()
            .context("Failed to open device side of the printer")?;

        let mut sink = match output {
            Some(path) => Some(
                File::create(&path)
                    .with_context(|| format!("Failed to create {}", path.display()))?,
            ),
            None => None,
        };

        let lines = Arc::new(AtomicU64::new(0));
        let counter = lines.clone();
        let reader = thread::Builder::new()
            .name("printer mechanism".to_string())
            .spawn(move || {
                loop {
                    let chunk = match device.read(256) {
                        Ok(chunk) => chunk,
                        Err(common::Error::Closed) => break,
                        Err(e) => {
                            warn!("Printer mechanism read failed: {}", e);
                            break;
                        }
                    };
                    let newlines = chunk.iter().filter(|b| **b == b'\n').count() as u64;
                    counter.fetch_add(newlines, Ordering::Relaxed);
                    if let Some(file) = sink.as_mut() {
                        if let Err(e) = file.write_all(&chunk) {
                            warn!("Printer output lost: {}", e);
                            sink = None;
                        }
                    }
                }
                debug!("Printer mechanism stopped");
            })
            .context("Failed to start printer mechanism thread")?;

        Ok(Arc::new(Mechanism {
            host: Mutex::new(host),
            lines,
            reader: Mutex::new(Some(reader)),
        }))
    }

    /// Send one line to the mechanism
    pub fn write_line(&self, text: &str) -> common::Result<()> {
        let mut host = lock_unpoisoned(&self.host);
        host.write(text.as_bytes())?;
        host.write(b"\n")?;
        host.flush()
    }

    /// Lines the mechanism has received so far
    pub fn lines_printed(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    /// Close the connection and wait for the mechanism to stop
    pub fn shutdown(&self) {
        if let Err(e) = lock_unpoisoned(&self.host).close() {
            warn!("Closing printer connection failed: {}", e);
        }
        if let Some(reader) = lock_unpoisoned(&self.reader).take() {
            if reader.join().is_err() {
                warn!("Printer mechanism thread panicked");
            }
        }
        info!("Printer mechanism printed {} lines", self.lines_printed());
    }
}

/// Asynchronous command printing `text`
///
/// The line takes `line_delay` to print and jams with the configured
/// probability. Aborting interrupts the delay.
pub fn print_line(mechanism: Arc<Mechanism>, text: String, settings: &PrinterSettings) -> impl Task {
    let delay = settings.line_delay();
    let failure_rate = settings.failure_rate;

    FnTask::output("printNormal", move |ctx: &TaskContext<'_>| {
        if ctx.abort_token().sleep(delay) {
            return Err(DeviceError::failure("Print aborted"));
        }
        if failure_rate > 0.0 && rand::rng().random_bool(failure_rate) {
            return Err(DeviceError::extended(EXTENDED_JAM, "Paper jam"));
        }
        mechanism.write_line(&text)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{DEFAULT_TEST_TIMEOUT, wait_for};

    #[test]
    fn test_mechanism_counts_lines() {
        let mechanism = Mechanism::start(None).unwrap();
        mechanism.write_line("TOTAL 12.50").unwrap();
        mechanism.write_line("THANK YOU").unwrap();

        assert!(wait_for(DEFAULT_TEST_TIMEOUT, || mechanism.lines_printed() == 2));
        mechanism.shutdown();
        assert!(mechanism.write_line("late").is_err());
    }

    #[test]
    fn test_printer_statuses_are_observable() {
        let class = PrinterClass;
        let props = SessionProps::default();
        assert!(class.status_delta(&props, status::COVER_OPEN).observable);
        assert!(!class.status_delta(&props, 99).observable);
        assert_eq!(class.idle_status(), status::IDLE);
    }
}
