//! Test utilities for the engine
//!
//! [`RecordingSink`] records every delivered event and can be scripted with
//! an error response and a callback delay. The task constructors cover the
//! command shapes tests need: succeeding, failing, gated and abort polling.

use crate::channel::ChannelKind;
use crate::command::{FnTask, Task, TaskContext};
use crate::driver::Driver;
use crate::error::{DeviceError, Result};
use crate::event::{
    DataEvent, DirectIoEvent, ErrorEvent, Event, OutputCompleteEvent, StatusUpdateEvent,
    TransitionEvent,
};
use crate::session::Session;
use crate::sink::EventSink;
use crate::types::{DeviceIndex, ErrorResponse, OutputId};
use common::{SyncObject, Timeout, lock_unpoisoned};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use common::test_utils::{DEFAULT_TEST_TIMEOUT, POLL_INTERVAL, stays_false, wait_for};

/// Event sink recording everything it receives
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
    error_response: Mutex<Option<ErrorResponse>>,
    direct_io_reply: Mutex<Option<i32>>,
    callback_delay: Mutex<Option<Duration>>,
    active: [AtomicUsize; 3],
    max_active: [AtomicUsize; 3],
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every error event with `response`
    pub fn with_error_response(self, response: ErrorResponse) -> Self {
        self.set_error_response(Some(response));
        self
    }

    /// Sleep inside every callback
    pub fn with_callback_delay(self, delay: Duration) -> Self {
        *lock_unpoisoned(&self.callback_delay) = Some(delay);
        self
    }

    pub fn set_error_response(&self, response: Option<ErrorResponse>) {
        *lock_unpoisoned(&self.error_response) = response;
    }

    /// Data value written into delivered direct IO events
    pub fn set_direct_io_reply(&self, data: Option<i32>) {
        *lock_unpoisoned(&self.direct_io_reply) = data;
    }

    pub fn events(&self) -> Vec<Event> {
        lock_unpoisoned(&self.events).clone()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.events).clear();
    }

    pub fn statuses(&self) -> Vec<StatusUpdateEvent> {
        self.filter(|e| match e {
            Event::Status(s) => Some(s.clone()),
            _ => None,
        })
    }

    pub fn status_values(&self) -> Vec<i32> {
        self.statuses().iter().map(|s| s.status).collect()
    }

    pub fn errors(&self) -> Vec<ErrorEvent> {
        self.filter(|e| match e {
            Event::Error(err) => Some(err.clone()),
            _ => None,
        })
    }

    pub fn data(&self) -> Vec<DataEvent> {
        self.filter(|e| match e {
            Event::Data(d) => Some(d.clone()),
            _ => None,
        })
    }

    pub fn output_ids(&self) -> Vec<OutputId> {
        self.filter(|e| match e {
            Event::OutputComplete(c) => Some(c.output_id),
            _ => None,
        })
    }

    /// Wait until at least `count` events have been recorded
    pub fn wait_for_events(&self, count: usize) -> bool {
        wait_for(DEFAULT_TEST_TIMEOUT, || self.len() >= count)
    }

    /// Highest number of callbacks seen running at once on one channel
    pub fn max_concurrent(&self, kind: ChannelKind) -> usize {
        self.max_active[kind.index()].load(Ordering::SeqCst)
    }

    fn filter<T, F>(&self, f: F) -> Vec<T>
    where
        F: FnMut(&Event) -> Option<T>,
    {
        lock_unpoisoned(&self.events).iter().filter_map(f).collect()
    }

    fn record(&self, kind: ChannelKind, event: Event) {
        let index = kind.index();
        let active = self.active[index].fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active[index].fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = *lock_unpoisoned(&self.callback_delay) {
            std::thread::sleep(delay);
        }
        lock_unpoisoned(&self.events).push(event);

        self.active[index].fetch_sub(1, Ordering::SeqCst);
    }
}

impl EventSink for RecordingSink {
    fn deliver_data(&self, event: &DataEvent) {
        self.record(ChannelKind::Data, Event::Data(event.clone()));
    }

    fn deliver_error(&self, event: &mut ErrorEvent) {
        if let Some(response) = *lock_unpoisoned(&self.error_response) {
            event.set_response(response);
        }
        let kind = if event.locus.is_output() {
            ChannelKind::Output
        } else {
            ChannelKind::Data
        };
        self.record(kind, Event::Error(event.clone()));
    }

    fn deliver_status(&self, event: &StatusUpdateEvent) {
        self.record(ChannelKind::General, Event::Status(event.clone()));
    }

    fn deliver_output_complete(&self, event: &OutputCompleteEvent) {
        self.record(ChannelKind::Output, Event::OutputComplete(event.clone()));
    }

    fn deliver_direct_io(&self, event: &mut DirectIoEvent) {
        if let Some(data) = *lock_unpoisoned(&self.direct_io_reply) {
            let _ = event.set_data(data);
        }
        self.record(ChannelKind::General, Event::DirectIo(event.clone()));
    }

    fn deliver_transition(&self, event: &mut TransitionEvent) {
        self.record(ChannelKind::General, Event::Transition(event.clone()));
    }
}

/// Open, claim and enable a session with a fresh recording sink
pub fn open_enabled(
    driver: &Driver,
    device: DeviceIndex,
    logical_name: &str,
) -> Result<(Arc<Session>, Arc<RecordingSink>)> {
    let sink = Arc::new(RecordingSink::new());
    let session = driver.open_session(device, logical_name, sink.clone());
    session.claim(Timeout::from_millis(1000))?;
    session.set_device_enabled(true)?;
    Ok((session, sink))
}

/// Output task that succeeds
pub fn ok_task(name: &str) -> impl Task {
    FnTask::output(name, |_ctx: &TaskContext<'_>| Ok(()))
}

/// Output task failing with `error`
pub fn failing_task(name: &str, error: DeviceError) -> impl Task {
    FnTask::output(name, move |_ctx: &TaskContext<'_>| Err(error.clone()))
}

/// Output task running until `gate` is signalled or it is aborted
///
/// An abort makes the task fail with a "Command aborted" error.
pub fn gated_task(name: &str, gate: Arc<SyncObject>) -> impl Task {
    FnTask::output(name, move |ctx: &TaskContext<'_>| {
        loop {
            ctx.abort_token().check()?;
            if gate.suspend(Timeout::from_millis(5)) {
                return Ok(());
            }
        }
    })
}

/// Output task polling its abort token until aborted
pub fn abortable_task(name: &str) -> impl Task {
    FnTask::output(name, |ctx: &TaskContext<'_>| {
        while !ctx.abort_token().sleep(Duration::from_millis(5)) {}
        Err(DeviceError::failure("Command aborted"))
    })
}
