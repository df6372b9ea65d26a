//! Commands: units of asynchronous work bound to a session
//!
//! A device class wraps the work of an asynchronous method in a [`Task`],
//! builds a [`Command`] for it and enqueues it. The dispatcher runs the task
//! on its worker thread (or a dedicated thread for concurrent tasks) and
//! turns the outcome into events.
//!
//! Cancellation is cooperative: [`Command::abort_command`] sets the
//! [`AbortToken`] handed to the running task and waits until the command's
//! completion has been processed.

use crate::error::{DeviceError, ErrorCode, Result};
use crate::session::Session;
use crate::types::{CommandKind, OutputId, SessionId};
use common::{SyncObject, Timeout, lock_unpoisoned};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error};

/// Abort request handed to a running task
#[derive(Debug, Default)]
pub struct AbortToken {
    requested: AtomicBool,
    wake: SyncObject,
}

impl AbortToken {
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Fail with an error if an abort has been requested
    pub fn check(&self) -> Result<()> {
        if self.is_requested() {
            Err(DeviceError::new(ErrorCode::Failure, "Command aborted"))
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early on abort
    ///
    /// Returns whether an abort has been requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_requested() {
            return true;
        }
        self.wake.suspend(Timeout::from_duration(duration));
        self.is_requested()
    }

    fn request(&self) {
        self.requested.store(true, Ordering::Release);
        self.wake.signal();
    }

    fn reset(&self) {
        self.requested.store(false, Ordering::Release);
        self.wake.drain();
    }
}

/// What a running task can see of its command
pub struct TaskContext<'a> {
    command: &'a Command,
}

impl TaskContext<'_> {
    pub fn abort_token(&self) -> &AbortToken {
        &self.command.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.command.abort.is_requested()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.command.session
    }

    pub fn session_id(&self) -> SessionId {
        self.command.session_id()
    }

    pub fn output_id(&self) -> Option<OutputId> {
        self.command.output_id()
    }

    /// Leave a result for the caller, see [`Command::take_payload`]
    pub fn set_payload(&self, payload: Box<dyn Any + Send>) {
        lock_unpoisoned(&self.command.state).payload = Some(payload);
    }
}

/// Work performed by a command
pub trait Task: Send + Sync + 'static {
    /// Run the work; a returned error is reported through the error path
    fn invoke(&self, ctx: &TaskContext<'_>) -> Result<()>;

    fn kind(&self) -> CommandKind {
        CommandKind::Output
    }

    /// Run on a dedicated thread instead of the serial worker
    fn concurrent(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "command"
    }
}

/// [`Task`] built from a closure
pub struct FnTask<F> {
    name: String,
    kind: CommandKind,
    concurrent: bool,
    f: F,
}

impl<F> FnTask<F>
where
    F: Fn(&TaskContext<'_>) -> Result<()> + Send + Sync + 'static,
{
    /// Output task: gets an output id and reports output errors
    pub fn output(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            kind: CommandKind::Output,
            concurrent: false,
            f,
        }
    }

    /// Input task: no output id, no completion event, input errors
    pub fn input(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            kind: CommandKind::Input,
            concurrent: false,
            f,
        }
    }

    /// Run on a dedicated thread
    pub fn concurrent(mut self) -> Self {
        self.concurrent = true;
        self
    }
}

impl<F> Task for FnTask<F>
where
    F: Fn(&TaskContext<'_>) -> Result<()> + Send + Sync + 'static,
{
    fn invoke(&self, ctx: &TaskContext<'_>) -> Result<()> {
        (self.f)(ctx)
    }

    fn kind(&self) -> CommandKind {
        self.kind
    }

    fn concurrent(&self) -> bool {
        self.concurrent
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Default)]
struct CommandState {
    output_id: Option<OutputId>,
    finished: bool,
    abort_waiters: Vec<Arc<SyncObject>>,
    end_sync: Option<Arc<SyncObject>>,
    error: Option<DeviceError>,
    suppress_events: bool,
    payload: Option<Box<dyn Any + Send>>,
}

impl CommandState {
    fn wake_abort_waiters(&mut self) {
        for waiter in self.abort_waiters.drain(..) {
            waiter.signal();
        }
    }
}

/// A unit of asynchronous work for one session
pub struct Command {
    session: Arc<Session>,
    task: Box<dyn Task>,
    kind: CommandKind,
    concurrent: bool,
    abort: AbortToken,
    state: Mutex<CommandState>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("session", &self.session.id())
            .field("task", &self.task.name())
            .field("kind", &self.kind)
            .field("concurrent", &self.concurrent)
            .field("output_id", &self.output_id())
            .finish()
    }
}

impl Command {
    pub fn new(session: &Arc<Session>, task: impl Task) -> Arc<Command> {
        let kind = task.kind();
        let concurrent = task.concurrent();
        Arc::new(Command {
            session: session.clone(),
            task: Box::new(task),
            kind,
            concurrent,
            abort: AbortToken::default(),
            state: Mutex::new(CommandState::default()),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn is_input(&self) -> bool {
        self.kind == CommandKind::Input
    }

    /// Eligible for a dedicated thread; synchronous commands never are
    pub fn is_concurrent(&self) -> bool {
        self.concurrent && !self.is_synchronous()
    }

    /// Output id assigned at enqueue, `None` for input commands
    pub fn output_id(&self) -> Option<OutputId> {
        lock_unpoisoned(&self.state).output_id
    }

    /// Queue for asynchronous execution
    pub fn enqueue(self: &Arc<Self>) -> Result<()> {
        self.session.dispatcher().enqueue(self)
    }

    /// Execute and wait for the outcome
    pub fn enqueue_synchronous(self: &Arc<Self>) -> Result<()> {
        self.session.dispatcher().enqueue_synchronous(self)
    }

    /// Request an abort and wait until the command has completed
    pub fn abort_command(&self) {
        self.abort_within(Timeout::INFINITE);
    }

    /// Like [`abort_command`](Self::abort_command) with a bounded wait
    ///
    /// Returns whether the command completed within `timeout`.
    pub fn abort_within(&self, timeout: Timeout) -> bool {
        match self.request_abort() {
            Some(waiter) => waiter.suspend(timeout),
            None => true,
        }
    }

    pub fn is_finished(&self) -> bool {
        lock_unpoisoned(&self.state).finished
    }

    /// Error captured by the last execution
    pub fn error(&self) -> Option<DeviceError> {
        lock_unpoisoned(&self.state).error.clone()
    }

    /// Result left by the task through [`TaskContext::set_payload`]
    pub fn take_payload(&self) -> Option<Box<dyn Any + Send>> {
        lock_unpoisoned(&self.state).payload.take()
    }

    pub(crate) fn set_output_id(&self, id: OutputId) {
        lock_unpoisoned(&self.state).output_id = Some(id);
    }

    pub(crate) fn is_synchronous(&self) -> bool {
        lock_unpoisoned(&self.state).end_sync.is_some()
    }

    pub(crate) fn set_end_sync(&self, end_sync: Arc<SyncObject>) {
        lock_unpoisoned(&self.state).end_sync = Some(end_sync);
    }

    pub(crate) fn end_sync(&self) -> Option<Arc<SyncObject>> {
        lock_unpoisoned(&self.state).end_sync.clone()
    }

    /// Set the abort token; returns a handle signalled on completion, or
    /// `None` if the command already completed
    pub(crate) fn request_abort(&self) -> Option<Arc<SyncObject>> {
        let waiter = {
            let mut state = lock_unpoisoned(&self.state);
            if state.finished {
                None
            } else {
                let waiter = Arc::new(SyncObject::new());
                state.abort_waiters.push(waiter.clone());
                Some(waiter)
            }
        };
        self.abort.request();
        waiter
    }

    /// Complete without any event
    pub(crate) fn suppress_events(&self) {
        lock_unpoisoned(&self.state).suppress_events = true;
    }

    pub(crate) fn events_suppressed(&self) -> bool {
        lock_unpoisoned(&self.state).suppress_events
    }

    /// Mark completion processing done and wake abort waiters
    pub(crate) fn finished(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.finished = true;
        state.wake_abort_waiters();
    }

    /// Prepare for another execution
    pub(crate) fn reset(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.wake_abort_waiters();
        state.finished = false;
        state.error = None;
        state.suppress_events = false;
        state.end_sync = None;
        self.abort.reset();
    }

    /// Record an error without running the task
    pub(crate) fn fail(&self, error: DeviceError) {
        lock_unpoisoned(&self.state).error = Some(error);
    }

    pub(crate) fn take_error(&self) -> Option<DeviceError> {
        lock_unpoisoned(&self.state).error.take()
    }

    /// Run the task, capturing its error or panic
    ///
    /// A command aborted while still queued is not run and fails as aborted.
    pub(crate) fn invoke(&self) {
        if self.abort.is_requested() {
            debug!("{}: {} aborted before start", self.session.logical_name(), self.name());
            lock_unpoisoned(&self.state).error = self.abort.check().err();
            return;
        }

        let ctx = TaskContext { command: self };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.task.invoke(&ctx)));

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                debug!("{}: {} failed: {}", self.session.logical_name(), self.name(), e);
                Some(e)
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(
                    "Panic in command {} of {}: {}",
                    self.name(),
                    self.session.logical_name(),
                    reason
                );
                Some(DeviceError::failure(format!("Command panicked: {}", reason)))
            }
        };

        lock_unpoisoned(&self.state).error = error;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
