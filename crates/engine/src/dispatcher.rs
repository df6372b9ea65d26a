//! Command dispatcher
//!
//! One dispatcher exists per driver. It owns the global pending queue, the
//! per-session state machines and suspension lists, and at most one worker
//! thread that runs queued commands strictly in FIFO order. Commands marked
//! concurrent get a dedicated thread instead.
//!
//! All state lives behind a single monitor. Nothing in this module calls into
//! an [`EventSink`](crate::sink::EventSink); events are appended to session
//! channels after the monitor has been released.

use crate::class::DeviceClass;
use crate::command::Command;
use crate::error::{DeviceError, Result};
use crate::event::{Event, StatusUpdateEvent};
use crate::types::{CommandKind, ErrorLocus, OutputId, SessionId, SessionState};
use common::{SyncObject, Timeout, lock_unpoisoned};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error, trace};

/// Which commands a clear operation removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Input,
    Output,
    All,
}

impl Scope {
    fn matches(self, command: &Command) -> bool {
        match self {
            Scope::Input => command.is_input(),
            Scope::Output => !command.is_input(),
            Scope::All => true,
        }
    }
}

/// Dispatcher view of one open session
#[derive(Debug)]
struct SessionQueue {
    logical_name: String,
    state: SessionState,
    last_output_id: OutputId,
    suspended: VecDeque<Arc<Command>>,
    suspended_concurrent: VecDeque<Arc<Command>>,
    flag_when_idle: bool,
}

impl SessionQueue {
    fn new(logical_name: String) -> Self {
        Self {
            logical_name,
            state: SessionState::Idle,
            last_output_id: OutputId(0),
            suspended: VecDeque::new(),
            suspended_concurrent: VecDeque::new(),
            flag_when_idle: false,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("{}: State {:?} -> {:?}", self.logical_name, self.state, state);
            self.state = state;
        }
    }
}

#[derive(Debug, Default)]
struct DispatchState {
    pending: VecDeque<Arc<Command>>,
    current: Option<Arc<Command>>,
    concurrent: Vec<Arc<Command>>,
    worker_running: bool,
    sessions: HashMap<SessionId, SessionQueue>,
}

impl DispatchState {
    /// Whether the session has queued or running commands
    fn active(&self, session: SessionId) -> bool {
        self.pending.iter().any(|c| c.session_id() == session)
            || self
                .current
                .as_ref()
                .is_some_and(|c| c.session_id() == session)
            || self.concurrent.iter().any(|c| c.session_id() == session)
    }

    fn remove_in_flight(&mut self, command: &Arc<Command>) {
        if self
            .current
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, command))
        {
            self.current = None;
        }
        self.concurrent.retain(|c| !Arc::ptr_eq(c, command));
    }

    /// Busy becomes Idle once nothing is queued or running for the session
    fn settle(&mut self, session: SessionId) {
        let active = self.active(session);
        if let Some(queue) = self.sessions.get_mut(&session) {
            if queue.state == SessionState::Busy && !active {
                queue.set_state(SessionState::Idle);
            }
        }
    }
}

/// Per-driver command dispatcher
pub struct Dispatcher {
    name: String,
    class: Arc<dyn DeviceClass>,
    state: Mutex<DispatchState>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("class", &self.class.name())
            .finish()
    }
}

impl Dispatcher {
    pub(crate) fn new(name: impl Into<String>, class: Arc<dyn DeviceClass>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            class,
            state: Mutex::new(DispatchState::default()),
        })
    }

    pub(crate) fn register(&self, session: SessionId, logical_name: &str) {
        let mut state = lock_unpoisoned(&self.state);
        state
            .sessions
            .insert(session, SessionQueue::new(logical_name.to_string()));
    }

    /// Drop every command of the session and forget it
    pub(crate) fn unregister(self: &Arc<Self>, session: SessionId) {
        self.clear(session, Scope::All);
        lock_unpoisoned(&self.state).sessions.remove(&session);
    }

    /// Current state of a session; Closed once unregistered
    pub fn state_of(&self, session: SessionId) -> SessionState {
        lock_unpoisoned(&self.state)
            .sessions
            .get(&session)
            .map(|q| q.state)
            .unwrap_or(SessionState::Closed)
    }

    /// Commands waiting on the global queue, across all sessions
    pub fn pending_len(&self) -> usize {
        lock_unpoisoned(&self.state).pending.len()
    }

    pub fn worker_running(&self) -> bool {
        lock_unpoisoned(&self.state).worker_running
    }

    /// Pending, running and suspended commands of a session
    pub fn count_commands(&self, session: SessionId) -> usize {
        let state = lock_unpoisoned(&self.state);
        let pending = state
            .pending
            .iter()
            .filter(|c| c.session_id() == session)
            .count();
        let current = state
            .current
            .iter()
            .filter(|c| c.session_id() == session)
            .count();
        let concurrent = state
            .concurrent
            .iter()
            .filter(|c| c.session_id() == session)
            .count();
        let suspended = state
            .sessions
            .get(&session)
            .map(|q| q.suspended.len() + q.suspended_concurrent.len())
            .unwrap_or(0);
        pending + current + concurrent + suspended
    }

    /// Snapshot of a session's serial suspension list, in retry order
    pub fn suspended(&self, session: SessionId) -> Vec<Arc<Command>> {
        lock_unpoisoned(&self.state)
            .sessions
            .get(&session)
            .map(|q| q.suspended.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the global pending queue
    pub fn pending(&self) -> Vec<Arc<Command>> {
        lock_unpoisoned(&self.state).pending.iter().cloned().collect()
    }

    pub(crate) fn flag_when_idle(&self, session: SessionId) -> bool {
        lock_unpoisoned(&self.state)
            .sessions
            .get(&session)
            .is_some_and(|q| q.flag_when_idle)
    }

    /// Queue a command for asynchronous execution
    pub(crate) fn enqueue(self: &Arc<Self>, command: &Arc<Command>) -> Result<()> {
        let session = command.session_id();
        let concurrent = command.is_concurrent();
        let mut guard = lock_unpoisoned(&self.state);
        let state = &mut *guard;

        let queue = state
            .sessions
            .get_mut(&session)
            .ok_or_else(|| DeviceError::closed("Device not opened"))?;

        if !command.is_input() {
            queue.last_output_id = queue.last_output_id.next();
            command.set_output_id(queue.last_output_id);
        }

        match queue.state {
            SessionState::Closed => return Err(DeviceError::closed("Device not opened")),
            SessionState::Error => {
                debug!(
                    "{}: {} suspended, device in error state",
                    queue.logical_name,
                    command.name()
                );
                if concurrent {
                    queue.suspended_concurrent.push_back(command.clone());
                } else {
                    queue.suspended.push_back(command.clone());
                }
                return Ok(());
            }
            SessionState::Idle => queue.set_state(SessionState::Busy),
            SessionState::Busy => {}
        }

        if concurrent {
            state.concurrent.push(command.clone());
            if let Err(e) = self.spawn_concurrent(command.clone()) {
                state.remove_in_flight(command);
                state.settle(session);
                return Err(e);
            }
        } else {
            state.pending.push_back(command.clone());
            if let Err(e) = self.start_worker(state) {
                state.pending.retain(|c| !Arc::ptr_eq(c, command));
                state.settle(session);
                return Err(e);
            }
        }

        trace!("{}: {} queued", self.name, command.name());
        Ok(())
    }

    /// Run a command on the worker and wait for it
    ///
    /// The captured error, if any, is returned to the caller after the
    /// session state has been reconciled.
    pub(crate) fn enqueue_synchronous(self: &Arc<Self>, command: &Arc<Command>) -> Result<()> {
        let end = Arc::new(SyncObject::new());
        command.set_end_sync(end.clone());

        if let Err(e) = self.enqueue(command) {
            command.reset();
            return Err(e);
        }
        end.suspend(Timeout::INFINITE);

        let error = command.take_error();
        {
            let mut guard = lock_unpoisoned(&self.state);
            let state = &mut *guard;
            let session = command.session_id();
            let active = state.active(session);
            if let Some(queue) = state.sessions.get_mut(&session) {
                if queue.state == SessionState::Busy && !active {
                    queue.set_state(if error.is_some() {
                        SessionState::Error
                    } else {
                        SessionState::Idle
                    });
                }
            }
        }
        command.reset();

        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn clear_input(self: &Arc<Self>, session: SessionId) {
        self.clear(session, Scope::Input);
    }

    pub(crate) fn clear_output(self: &Arc<Self>, session: SessionId) {
        self.clear(session, Scope::Output);
    }

    pub(crate) fn clear_all(self: &Arc<Self>, session: SessionId) {
        self.clear(session, Scope::All);
    }

    /// Remove matching commands and abort the running ones
    ///
    /// Blocks until every aborted command has completed. Aborted output
    /// commands complete without events.
    fn clear(self: &Arc<Self>, session: SessionId, scope: Scope) {
        let (removed, waiters) = {
            let mut guard = lock_unpoisoned(&self.state);
            let state = &mut *guard;
            let mut removed = Vec::new();

            let mut kept = VecDeque::with_capacity(state.pending.len());
            for command in state.pending.drain(..) {
                if command.session_id() == session && scope.matches(&command) {
                    removed.push(command);
                } else {
                    kept.push_back(command);
                }
            }
            state.pending = kept;

            if let Some(queue) = state.sessions.get_mut(&session) {
                for list in [&mut queue.suspended, &mut queue.suspended_concurrent] {
                    let (dropped, kept): (VecDeque<_>, VecDeque<_>) =
                        list.drain(..).partition(|c| scope.matches(c));
                    *list = kept;
                    removed.extend(dropped);
                }
            }

            let waiters: Vec<Arc<SyncObject>> = state
                .current
                .iter()
                .chain(state.concurrent.iter())
                .filter(|c| c.session_id() == session && scope.matches(c))
                .filter_map(|c| {
                    if !c.is_input() {
                        c.suppress_events();
                    }
                    c.request_abort()
                })
                .collect();

            (removed, waiters)
        };

        if !removed.is_empty() || !waiters.is_empty() {
            debug!(
                "{}: cleared {} queued, aborting {} running ({:?})",
                session,
                removed.len(),
                waiters.len(),
                scope
            );
        }

        // Synchronous callers blocked on a removed command get an error
        for command in removed {
            if let Some(end) = command.end_sync() {
                command.fail(DeviceError::failure("Command cleared"));
                end.signal();
            }
            command.finished();
        }

        for waiter in waiters {
            waiter.suspend(Timeout::INFINITE);
        }

        let mut guard = lock_unpoisoned(&self.state);
        let state = &mut *guard;
        let active = state.active(session);
        if let Some(queue) = state.sessions.get_mut(&session) {
            match queue.state {
                SessionState::Error if scope != Scope::All => queue.set_state(if active {
                    SessionState::Busy
                } else {
                    SessionState::Idle
                }),
                SessionState::Busy if !active => queue.set_state(SessionState::Idle),
                _ => {}
            }
        }
    }

    /// Re-queue the suspended commands of one partition
    pub(crate) fn retry(self: &Arc<Self>, session: SessionId, kind: CommandKind) {
        let mut guard = lock_unpoisoned(&self.state);
        let state = &mut *guard;

        let Some(queue) = state.sessions.get_mut(&session) else {
            return;
        };

        let (serial, rest): (VecDeque<_>, VecDeque<_>) =
            queue.suspended.drain(..).partition(|c| c.kind() == kind);
        queue.suspended = rest;
        let (concurrent, rest): (VecDeque<_>, VecDeque<_>) = queue
            .suspended_concurrent
            .drain(..)
            .partition(|c| c.kind() == kind);
        queue.suspended_concurrent = rest;

        let moved = serial.len() + concurrent.len();
        let was_error = queue.state == SessionState::Error;
        debug!(
            "{}: retrying {} {:?} commands",
            queue.logical_name, moved, kind
        );

        state.pending.extend(serial);

        for command in concurrent {
            state.concurrent.push(command.clone());
            if let Err(e) = self.spawn_concurrent(command.clone()) {
                error!("{}: {}", self.name, e);
                state.remove_in_flight(&command);
                if let Some(queue) = state.sessions.get_mut(&session) {
                    queue.suspended_concurrent.push_back(command);
                }
            }
        }

        if !state.pending.is_empty() {
            if let Err(e) = self.start_worker(state) {
                error!("{}: {}", self.name, e);
            }
        }

        if was_error || moved > 0 {
            let active = state.active(session);
            if let Some(queue) = state.sessions.get_mut(&session) {
                queue.set_state(if active {
                    SessionState::Busy
                } else {
                    SessionState::Idle
                });
            }
        }
    }

    /// Enter Error without a failing command, e.g. for a raised input error
    pub(crate) fn mark_error(&self, session: SessionId, locus: ErrorLocus) {
        let mut state = lock_unpoisoned(&self.state);
        if let Some(queue) = state.sessions.get_mut(&session) {
            debug!("{}: {:?} error raised", queue.logical_name, locus);
            queue.set_state(SessionState::Error);
        }
    }

    /// Back to Idle after release
    pub(crate) fn force_idle(&self, session: SessionId) {
        let mut state = lock_unpoisoned(&self.state);
        if let Some(queue) = state.sessions.get_mut(&session) {
            queue.set_state(SessionState::Idle);
            queue.flag_when_idle = false;
        }
    }

    /// Set the flag; returns the idle event to raise if already idle
    pub(crate) fn set_flag_when_idle(
        &self,
        session: SessionId,
        flag: bool,
    ) -> Option<StatusUpdateEvent> {
        {
            let mut state = lock_unpoisoned(&self.state);
            let queue = state.sessions.get_mut(&session)?;
            queue.flag_when_idle = flag;
        }
        self.idle_notification(session)
    }

    /// Consume a set flag if the session is idle
    pub(crate) fn idle_notification(&self, session: SessionId) -> Option<StatusUpdateEvent> {
        let mut state = lock_unpoisoned(&self.state);
        let queue = state.sessions.get_mut(&session)?;
        if queue.flag_when_idle && queue.state == SessionState::Idle {
            queue.flag_when_idle = false;
            Some(StatusUpdateEvent::new(session, self.class.idle_status()))
        } else {
            None
        }
    }

    fn start_worker(self: &Arc<Self>, state: &mut DispatchState) -> Result<()> {
        if state.worker_running {
            return Ok(());
        }

        let dispatcher = self.clone();
        thread::Builder::new()
            .name(format!("{} dispatcher", self.name))
            .spawn(move || dispatcher.run_worker())
            .map_err(|e| DeviceError::failure(format!("Cannot start dispatcher thread: {}", e)))?;

        state.worker_running = true;
        Ok(())
    }

    fn spawn_concurrent(self: &Arc<Self>, command: Arc<Command>) -> Result<()> {
        let dispatcher = self.clone();
        let name = format!("{} {}", command.session().logical_name(), command.name());
        thread::Builder::new()
            .name(name)
            .spawn(move || dispatcher.process(&command))
            .map(|_| ())
            .map_err(|e| DeviceError::failure(format!("Cannot start command thread: {}", e)))
    }

    /// Worker loop: run queued commands until the queue is empty
    fn run_worker(self: Arc<Self>) {
        trace!("{} dispatcher started", self.name);

        loop {
            let command = {
                let mut state = lock_unpoisoned(&self.state);
                match state.pending.pop_front() {
                    Some(command) => {
                        state.current = Some(command.clone());
                        command
                    }
                    None => {
                        state.current = None;
                        state.worker_running = false;
                        break;
                    }
                }
            };
            self.process(&command);
        }

        trace!("{} dispatcher stopped", self.name);
    }

    /// Invoke one command and handle its outcome
    fn process(&self, command: &Arc<Command>) {
        // Wrap in catch_unwind so a misbehaving device class hook cannot
        // take the worker down with a stale worker_running flag
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            command.invoke();
            match command.end_sync() {
                Some(end) => {
                    self.complete_synchronous(command);
                    end.signal();
                }
                None => self.complete(command),
            }
        }));

        if let Err(e) = outcome {
            error!("Panic while completing {}: {:?}", command.name(), e);
            self.abandon(command);
        }
    }

    fn complete_synchronous(&self, command: &Arc<Command>) {
        self.retire(command);
        if command.error().is_none() {
            self.transition_to_idle(command);
        }
    }

    /// Completion path of asynchronous commands
    fn complete(&self, command: &Arc<Command>) {
        let session = command.session().clone();

        if command.events_suppressed() {
            self.retire(command);
            self.transition_to_idle(command);
            return;
        }

        let Some(error) = command.error() else {
            let event = self.class.output_complete_event(command);
            self.retire(command);
            if let Some(event) = event {
                session.queue_outcome(Event::OutputComplete(event));
            }
            self.transition_to_idle(command);
            return;
        };

        match self.class.error_event(command, &error) {
            None => {
                debug!(
                    "{}: {} failed quietly: {}",
                    session.logical_name(),
                    command.name(),
                    error
                );
                {
                    let mut state = lock_unpoisoned(&self.state);
                    state.remove_in_flight(command);
                    command.finished();
                    if let Some(queue) = state.sessions.get_mut(&command.session_id()) {
                        queue.flag_when_idle = true;
                    }
                }
                self.transition_to_idle(command);
            }
            Some(event) => {
                if self.suspend(command) {
                    session.queue_outcome(Event::Error(event));
                } else {
                    self.transition_to_idle(command);
                }
            }
        }
    }

    /// Enter Error after a failed asynchronous command
    ///
    /// The failed command (reset for another pass) and then every pending
    /// command of the session are appended to the serial suspension list,
    /// behind commands suspended earlier. Concurrent commands of the session
    /// that are already running are left to finish; only later ones are
    /// suspended. Returns whether the error event should still be fired.
    fn suspend(&self, command: &Arc<Command>) -> bool {
        let session = command.session_id();
        let mut guard = lock_unpoisoned(&self.state);
        let state = &mut *guard;

        state.remove_in_flight(command);
        let suppressed = command.events_suppressed();
        command.finished();

        let DispatchState {
            pending, sessions, ..
        } = state;
        let Some(queue) = sessions.get_mut(&session) else {
            return false;
        };
        if suppressed {
            return false;
        }
        queue.set_state(SessionState::Error);

        if self.class.requeue_failed(command) {
            command.reset();
            if command.is_concurrent() {
                queue.suspended_concurrent.push_back(command.clone());
            } else {
                queue.suspended.push_back(command.clone());
            }
        }

        let mut kept = VecDeque::with_capacity(pending.len());
        for queued in pending.drain(..) {
            if queued.session_id() == session {
                queue.suspended.push_back(queued);
            } else {
                kept.push_back(queued);
            }
        }
        *pending = kept;

        debug!(
            "{}: {} commands suspended",
            queue.logical_name,
            queue.suspended.len() + queue.suspended_concurrent.len()
        );
        true
    }

    /// Mark a command done and drop it from the in-flight slots
    fn retire(&self, command: &Arc<Command>) {
        let mut state = lock_unpoisoned(&self.state);
        state.remove_in_flight(command);
        command.finished();
    }

    /// Recover from a panic during completion
    fn abandon(&self, command: &Arc<Command>) {
        {
            let mut state = lock_unpoisoned(&self.state);
            state.remove_in_flight(command);
            state.settle(command.session_id());
        }
        command.finished();
        if let Some(end) = command.end_sync() {
            end.signal();
        }
    }

    /// Busy becomes Idle when the session has nothing left to run; raises a
    /// pending idle notification
    fn transition_to_idle(&self, command: &Arc<Command>) {
        let session = command.session_id();
        let event = {
            let mut guard = lock_unpoisoned(&self.state);
            let state = &mut *guard;
            if state.active(session) {
                None
            } else {
                match state.sessions.get_mut(&session) {
                    Some(queue) => {
                        if queue.state == SessionState::Busy {
                            queue.set_state(SessionState::Idle);
                        }
                        if queue.flag_when_idle && queue.state == SessionState::Idle {
                            queue.flag_when_idle = false;
                            Some(StatusUpdateEvent::new(session, self.class.idle_status()))
                        } else {
                            None
                        }
                    }
                    None => None,
                }
            }
        };

        if let Some(event) = event {
            debug!("{}: idle, raising flagged status", session);
            command.session().raise_status_event(event);
        }
    }
}
