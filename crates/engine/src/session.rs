//! Device sessions
//!
//! A [`Session`] is one open instance of a device: its properties, its three
//! event channels with their drain threads, and its delayed-status slot. The
//! command state machine of a session lives in the driver's
//! [`Dispatcher`]; the session delegates command operations to it.
//!
//! # Lock order
//!
//! Dispatcher monitor, then the physical device's session list, then the
//! session properties, then the delay slot, then a channel monitor. No
//! callback into an [`EventSink`] happens while any of them is held.

use crate::channel::{ChannelKind, ChannelState, EventChannel, QueuedEvent};
use crate::class::{DeviceClass, power_status_of};
use crate::config::EngineConfig;
use crate::delay::{Admission, DelayBuffer};
use crate::device::PhysicalDevice;
use crate::dispatcher::Dispatcher;
use crate::error::{ErrorCode, Result, check};
use crate::event::{
    DataEvent, DirectIoEvent, ErrorEvent, Event, OutputCompleteEvent, StatusUpdateEvent,
    TransitionEvent,
};
use crate::sink::EventSink;
use crate::types::{
    CommandKind, DeviceIndex, ErrorLocus, ErrorResponse, Exclusivity, PowerState, SessionId,
    SessionState,
};
use common::{SyncObject, Timeout, lock_unpoisoned};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tracing::{debug, error, info, trace, warn};

/// Session properties maintained by the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionProps {
    pub open: bool,
    pub claimed: bool,
    pub device_enabled: bool,
    pub freeze_events: bool,
    pub data_event_enabled: bool,
    pub power_notify: bool,
    pub power_state: PowerState,
    pub auto_disable: bool,
    pub async_mode: bool,
    /// Data events buffered and not yet delivered
    pub data_count: u32,
    pub first_enable_done: bool,
}

/// Buffered event counts per channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueuedEvents {
    pub general: usize,
    pub data: usize,
    pub output: usize,
}

/// Named-field view of a session for logging
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub logical_name: String,
    pub device: DeviceIndex,
    pub state: SessionState,
    pub flag_when_idle: bool,
    #[serde(flatten)]
    pub props: SessionProps,
    pub queued_events: QueuedEvents,
    pub commands: usize,
}

/// One open instance of a device
pub struct Session {
    id: SessionId,
    logical_name: String,
    device: Arc<PhysicalDevice>,
    dispatcher: Arc<Dispatcher>,
    class: Arc<dyn DeviceClass>,
    config: Arc<EngineConfig>,
    sink: Arc<dyn EventSink>,
    props: Mutex<SessionProps>,
    // Gate mirrors of props, readable under a channel monitor
    open: AtomicBool,
    enabled: AtomicBool,
    frozen: AtomicBool,
    data_enabled: AtomicBool,
    channels: [EventChannel; 3],
    next_seq: AtomicU64,
    /// Sequence number of the oldest buffered data channel entry
    data_head: AtomicU64,
    delayed: DelayBuffer,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("logical_name", &self.logical_name)
            .field("device", &self.device.index())
            .finish()
    }
}

impl Session {
    pub(crate) fn open(
        id: SessionId,
        logical_name: String,
        device: Arc<PhysicalDevice>,
        dispatcher: Arc<Dispatcher>,
        class: Arc<dyn DeviceClass>,
        config: Arc<EngineConfig>,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Session> {
        let session = Arc::new(Session {
            id,
            logical_name,
            device,
            dispatcher,
            class,
            config,
            sink,
            props: Mutex::new(SessionProps {
                open: true,
                ..Default::default()
            }),
            open: AtomicBool::new(true),
            enabled: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            data_enabled: AtomicBool::new(false),
            channels: ChannelKind::ALL.map(EventChannel::new),
            next_seq: AtomicU64::new(0),
            data_head: AtomicU64::new(u64::MAX),
            delayed: DelayBuffer::new(),
        });

        session.dispatcher.register(id, &session.logical_name);
        session.device.attach(&session);
        info!(
            "{}: opened as {} on {} ({})",
            session.logical_name,
            id,
            session.device.index(),
            session.class.name()
        );
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    pub fn device(&self) -> &Arc<PhysicalDevice> {
        &self.device
    }

    pub fn class(&self) -> &Arc<dyn DeviceClass> {
        &self.class
    }

    pub fn state(&self) -> SessionState {
        self.dispatcher.state_of(self.id)
    }

    pub fn props(&self) -> SessionProps {
        self.lock_props().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_claimed(&self) -> bool {
        self.lock_props().claimed
    }

    pub fn data_count(&self) -> u32 {
        self.lock_props().data_count
    }

    pub fn flag_when_idle(&self) -> bool {
        self.dispatcher.flag_when_idle(self.id)
    }

    /// Events buffered on one channel
    pub fn queued_events(&self, kind: ChannelKind) -> usize {
        self.channel(kind).len()
    }

    pub fn count_commands(&self) -> usize {
        self.dispatcher.count_commands(self.id)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            logical_name: self.logical_name.clone(),
            device: self.device.index(),
            state: self.state(),
            flag_when_idle: self.flag_when_idle(),
            props: self.props(),
            queued_events: QueuedEvents {
                general: self.queued_events(ChannelKind::General),
                data: self.queued_events(ChannelKind::Data),
                output: self.queued_events(ChannelKind::Output),
            },
            commands: self.count_commands(),
        }
    }

    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub(crate) fn delay_buffer(&self) -> &DelayBuffer {
        &self.delayed
    }

    fn lock_props(&self) -> MutexGuard<'_, SessionProps> {
        lock_unpoisoned(&self.props)
    }

    fn channel(&self, kind: ChannelKind) -> &EventChannel {
        &self.channels[kind.index()]
    }

    fn exclusive(&self) -> bool {
        self.class.exclusivity() == Exclusivity::Exclusive
    }

    fn check_claim(&self, props: &SessionProps) -> Result<()> {
        check_open(props)?;
        if self.exclusive() {
            check(!props.claimed, ErrorCode::NotClaimed, "Device not claimed")?;
        }
        Ok(())
    }

    // ---- lifecycle ----

    /// Claim the physical device, waiting up to `timeout` for the holder
    ///
    /// Succeeds immediately if this session already holds the claim.
    pub fn claim(&self, timeout: Timeout) -> Result<()> {
        {
            let props = self.lock_props();
            check_open(&props)?;
            if props.claimed {
                return Ok(());
            }
            check(
                self.class.exclusivity() == Exclusivity::Shareable,
                ErrorCode::Illegal,
                "Device cannot be claimed",
            )?;
        }

        self.device.claim(self.id, timeout)?;

        let mut props = self.lock_props();
        props.claimed = true;
        self.class
            .property_changed(&self.logical_name, "Claimed", &true);
        Ok(())
    }

    /// Give up the claim
    ///
    /// Exclusive devices are disabled and lose their buffered events. All
    /// commands are cleared and the state returns to Idle.
    pub fn release(self: &Arc<Self>) -> Result<()> {
        {
            let mut props = self.lock_props();
            check_open(&props)?;
            check(!props.claimed, ErrorCode::NotClaimed, "Device not claimed")?;
            if self.exclusive() && props.device_enabled {
                self.apply_enabled(&mut props, false);
            }
        }

        self.dispatcher.clear_all(self.id);
        if self.exclusive() {
            self.clear_events();
            self.lock_props().data_count = 0;
        }
        self.dispatcher.force_idle(self.id);

        self.lock_props().claimed = false;
        self.class
            .property_changed(&self.logical_name, "Claimed", &false);
        self.device.release_claim(self.id);
        Ok(())
    }

    /// Enable or disable event delivery and device operation
    pub fn set_device_enabled(self: &Arc<Self>, enable: bool) -> Result<()> {
        let mut props = self.lock_props();
        self.check_claim(&props)?;
        if props.device_enabled == enable {
            return Ok(());
        }
        self.apply_enabled(&mut props, enable);
        Ok(())
    }

    fn apply_enabled(self: &Arc<Self>, props: &mut SessionProps, enable: bool) {
        if enable && !props.first_enable_done {
            props.first_enable_done = true;
            let stale = self.clear_events();
            if stale > 0 {
                debug!("{}: dropped {} stale events", self.logical_name, stale);
            }
            props.data_count = 0;
        }

        props.device_enabled = enable;
        self.enabled.store(enable, Ordering::SeqCst);
        self.class
            .property_changed(&self.logical_name, "DeviceEnabled", &enable);

        if enable {
            if props.power_notify {
                let state = self.device.power_state();
                props.power_state = state;
                if let Some(status) = power_status_of(state) {
                    self.append(Event::Status(StatusUpdateEvent::new(self.id, status)));
                }
            }
        } else {
            self.delayed.cancel_pending();
            if props.power_state != PowerState::Unknown {
                props.power_state = PowerState::Unknown;
                self.class
                    .property_changed(&self.logical_name, "PowerState", &PowerState::Unknown);
            }
        }
    }

    /// Hold back event delivery without blocking event buffering
    pub fn set_freeze_events(self: &Arc<Self>, freeze: bool) -> Result<()> {
        {
            let mut props = self.lock_props();
            check_open(&props)?;
            props.freeze_events = freeze;
            self.frozen.store(freeze, Ordering::SeqCst);
        }
        self.class
            .property_changed(&self.logical_name, "FreezeEvents", &freeze);
        if !freeze {
            self.kick_all();
        }
        Ok(())
    }

    /// Allow delivery of the next data event
    ///
    /// Delivering a data event disables data events again.
    pub fn set_data_event_enabled(self: &Arc<Self>, enable: bool) -> Result<()> {
        {
            let mut props = self.lock_props();
            check_open(&props)?;
            props.data_event_enabled = enable;
            self.data_enabled.store(enable, Ordering::SeqCst);
        }
        self.class
            .property_changed(&self.logical_name, "DataEventEnabled", &enable);
        if enable {
            self.kick_all();
        }
        Ok(())
    }

    /// Power notification can only change while disabled
    pub fn set_power_notify(&self, notify: bool) -> Result<()> {
        let mut props = self.lock_props();
        check_open(&props)?;
        check(props.device_enabled, ErrorCode::Illegal, "Device enabled")?;
        props.power_notify = notify;
        self.class
            .property_changed(&self.logical_name, "PowerNotify", &notify);
        Ok(())
    }

    /// Disable the session as soon as a data event is buffered
    pub fn set_auto_disable(&self, auto_disable: bool) -> Result<()> {
        let mut props = self.lock_props();
        check_open(&props)?;
        props.auto_disable = auto_disable;
        self.class
            .property_changed(&self.logical_name, "AutoDisable", &auto_disable);
        Ok(())
    }

    pub fn set_async_mode(&self, async_mode: bool) -> Result<()> {
        let mut props = self.lock_props();
        check_open(&props)?;
        props.async_mode = async_mode;
        self.class
            .property_changed(&self.logical_name, "AsyncMode", &async_mode);
        Ok(())
    }

    /// Request a status event once the session is idle; fires at once if it
    /// already is
    pub fn set_flag_when_idle(self: &Arc<Self>, flag: bool) -> Result<()> {
        check_open(&self.lock_props())?;
        self.class
            .property_changed(&self.logical_name, "FlagWhenIdle", &flag);
        if let Some(event) = self.dispatcher.set_flag_when_idle(self.id, flag) {
            self.raise_status_event(event);
        }
        Ok(())
    }

    /// Disable, release and forget the session
    pub fn close(self: &Arc<Self>) -> Result<()> {
        let claimed = {
            let mut props = self.lock_props();
            check_open(&props)?;
            if props.device_enabled {
                self.apply_enabled(&mut props, false);
            }
            props.claimed
        };
        if claimed {
            self.release()?;
        }

        self.open.store(false, Ordering::SeqCst);
        self.dispatcher.unregister(self.id);
        self.delayed.cancel_pending();
        self.clear_events();
        *self.lock_props() = SessionProps::default();
        self.device.detach(self.id);

        info!("{}: closed", self.logical_name);
        Ok(())
    }

    // ---- command partitions ----

    /// Drop queued input commands, buffered data and input errors
    ///
    /// Waits for a running input command to acknowledge its abort, so it must
    /// not be called from inside a task of this session.
    pub fn clear_input(self: &Arc<Self>) -> Result<()> {
        self.check_claim(&self.lock_props())?;

        self.dispatcher.clear_input(self.id);
        let removed = self.channel(ChannelKind::Data).remove_where(|e| {
            matches!(e, Event::Data(_))
                || matches!(e, Event::Error(err) if !err.locus.is_output())
        });
        self.lock_props().data_count = 0;
        if removed > 0 {
            debug!("{}: cleared {} input events", self.logical_name, removed);
        }
        self.refresh_data_head();
        self.kick_all();
        Ok(())
    }

    /// Drop queued output commands and output errors
    ///
    /// Must not be called from inside a task of this session; see
    /// [`Session::clear_input`].
    pub fn clear_output(self: &Arc<Self>) -> Result<()> {
        self.check_claim(&self.lock_props())?;

        self.dispatcher.clear_output(self.id);
        let removed = self
            .channel(ChannelKind::Output)
            .remove_where(|e| matches!(e, Event::Error(err) if err.locus.is_output()));
        if removed > 0 {
            debug!("{}: cleared {} output errors", self.logical_name, removed);
        }
        if let Some(event) = self.dispatcher.idle_notification(self.id) {
            self.raise_status_event(event);
        }
        self.kick_all();
        Ok(())
    }

    /// Re-queue suspended input commands
    pub fn retry_input(self: &Arc<Self>) -> Result<()> {
        self.check_claim(&self.lock_props())?;
        check(
            !self.class.allows_input_retry(),
            ErrorCode::Illegal,
            "Input retry not supported",
        )?;
        self.dispatcher.retry(self.id, CommandKind::Input);
        Ok(())
    }

    /// Re-queue suspended output commands
    pub fn retry_output(self: &Arc<Self>) -> Result<()> {
        self.check_claim(&self.lock_props())?;
        self.dispatcher.retry(self.id, CommandKind::Output);
        Ok(())
    }

    // ---- raising events ----

    /// Buffer a data event; ignored while disabled
    pub fn raise_data_event(self: &Arc<Self>, event: DataEvent) {
        let mut props = self.lock_props();
        if !props.device_enabled {
            debug!("{}: DataEvent dropped, device disabled", self.logical_name);
            return;
        }
        props.data_count += 1;
        self.append(Event::Data(event));
        if props.auto_disable {
            self.apply_enabled(&mut props, false);
        }
    }

    /// Buffer an error detected outside of a command, entering Error
    pub fn raise_error_event(self: &Arc<Self>, event: ErrorEvent) {
        if !self.is_enabled() {
            debug!("{}: ErrorEvent dropped, device disabled", self.logical_name);
            return;
        }
        self.dispatcher.mark_error(self.id, event.locus);
        self.queue_error(event);
    }

    /// Broadcast a status event to every session sharing the device
    pub fn raise_status_event(self: &Arc<Self>, event: StatusUpdateEvent) {
        self.device.broadcast_status(self.id, event);
    }

    pub fn raise_output_complete_event(self: &Arc<Self>, event: OutputCompleteEvent) {
        if self.is_enabled() {
            self.append(Event::OutputComplete(event));
        }
    }

    pub fn raise_direct_io_event(self: &Arc<Self>, event: DirectIoEvent) {
        if self.is_enabled() {
            self.append(Event::DirectIo(event));
        }
    }

    /// Buffer a direct IO event and wait until the application handled it
    ///
    /// Must not be called from a callback of this session's general channel.
    pub fn raise_direct_io_event_and_wait(
        self: &Arc<Self>,
        mut event: DirectIoEvent,
        timeout: Timeout,
    ) -> Result<DirectIoEvent> {
        check(!self.is_enabled(), ErrorCode::Disabled, "Device not enabled")?;
        let reply = event.attach_reply();
        self.append(Event::DirectIo(event));
        reply.wait(timeout, "DirectIO")
    }

    pub fn raise_transition_event(self: &Arc<Self>, event: TransitionEvent) {
        if self.is_enabled() {
            self.append(Event::Transition(event));
        }
    }

    /// Buffer a transition event and wait until the application handled it
    pub fn raise_transition_event_and_wait(
        self: &Arc<Self>,
        mut event: TransitionEvent,
        timeout: Timeout,
    ) -> Result<TransitionEvent> {
        check(!self.is_enabled(), ErrorCode::Disabled, "Device not enabled")?;
        let reply = event.attach_reply();
        self.append(Event::Transition(event));
        reply.wait(timeout, "Transition")
    }

    /// Buffer the outcome event of a command, regardless of enable state
    pub(crate) fn queue_outcome(self: &Arc<Self>, event: Event) {
        match event {
            Event::Error(error) => self.queue_error(error),
            other => self.append(other),
        }
    }

    /// Buffer an error event; an input error arriving while data events are
    /// buffered is additionally reported ahead of the first of them with the
    /// input-data locus
    fn queue_error(self: &Arc<Self>, event: ErrorEvent) {
        if event.locus == ErrorLocus::Input {
            let mut state = self.channel(ChannelKind::Data).lock();
            let first_data = state
                .queue
                .iter()
                .position(|e| matches!(e.event, Event::Data(_)));
            if let Some(position) = first_data {
                let seq = state.queue[position].seq;
                state.queue.insert(
                    position,
                    QueuedEvent {
                        seq,
                        event: Event::Error(event.input_data_copy()),
                    },
                );
                debug!("{}: input data error buffered", self.logical_name);
            }
        }
        self.append(Event::Error(event));
    }

    // ---- status processing ----

    /// Process this session's copy of a broadcast status event
    pub(crate) fn accept_status(self: &Arc<Self>, event: StatusUpdateEvent) {
        let delay = {
            let props = self.lock_props();
            if !props.open {
                return;
            }
            if self.class.block(&props, &event) {
                trace!("{}: status {} blocked", self.logical_name, event.status);
                return;
            }
            self.class.status_delay(&props, &event)
        };

        match self.delayed.admit(self, event, delay) {
            Admission::Fire(event) => self.fire_status(event),
            Admission::Buffered => {}
            Admission::Dropped(event) => {
                let mut props = self.lock_props();
                self.apply_status(&mut props, &event);
            }
        }
    }

    /// Apply property changes of a status event and buffer it
    pub(crate) fn fire_status(self: &Arc<Self>, event: StatusUpdateEvent) {
        let mut props = self.lock_props();
        let changed = self.apply_status(&mut props, &event);
        if !changed && self.class.drops_duplicate_status() {
            trace!(
                "{}: status {} changes nothing, dropped",
                self.logical_name, event.status
            );
            return;
        }
        if props.device_enabled {
            self.append(Event::Status(event));
        }
    }

    /// Returns whether anything observable changed
    fn apply_status(&self, props: &mut SessionProps, event: &StatusUpdateEvent) -> bool {
        let delta = self.class.status_delta(props, event.status);
        let mut changed = delta.observable;
        if let Some(state) = delta.power_state {
            if props.power_state != state {
                props.power_state = state;
                self.class
                    .property_changed(&self.logical_name, "PowerState", &state);
                changed = true;
            }
        }
        changed
    }

    // ---- channels ----

    fn append(self: &Arc<Self>, event: Event) {
        if !self.open.load(Ordering::SeqCst) {
            debug!("{}: {} dropped, session closed", self.logical_name, event.name());
            return;
        }

        let kind = event.channel();
        let mut state = self.channel(kind).lock();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        debug!("{}: {} buffered", self.logical_name, event.name());
        state.queue.push_back(QueuedEvent { seq, event });
        if kind == ChannelKind::Data {
            self.data_head.store(state.head_seq(), Ordering::SeqCst);
        }
        self.start_drain(kind, &mut state);
    }

    fn gate_open(&self, kind: ChannelKind, seq: u64) -> bool {
        if self.frozen.load(Ordering::SeqCst) {
            return false;
        }
        let data_enabled = self.data_enabled.load(Ordering::SeqCst);
        match kind {
            ChannelKind::Data => data_enabled,
            _ => {
                !self.config.strict_fifo
                    || data_enabled
                    || seq < self.data_head.load(Ordering::SeqCst)
            }
        }
    }

    /// Start a drain thread unless one is live or the head entry is gated
    fn start_drain(self: &Arc<Self>, kind: ChannelKind, state: &mut ChannelState) {
        if state.draining {
            return;
        }
        match state.queue.front() {
            Some(front) if self.gate_open(kind, front.seq) => {}
            _ => return,
        }

        state.draining = true;
        let session = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("{} {} events", self.logical_name, kind))
            .spawn(move || session.drain(kind));
        if let Err(e) = spawned {
            state.draining = false;
            error!(
                "{}: cannot start {} event thread: {}",
                self.logical_name, kind, e
            );
        }
    }

    fn kick(self: &Arc<Self>, kind: ChannelKind) {
        let mut state = self.channel(kind).lock();
        self.start_drain(kind, &mut state);
    }

    fn kick_all(self: &Arc<Self>) {
        for kind in ChannelKind::ALL {
            self.kick(kind);
        }
    }

    fn refresh_data_head(&self) {
        let state = self.channel(ChannelKind::Data).lock();
        self.data_head.store(state.head_seq(), Ordering::SeqCst);
    }

    /// Drop every buffered event; returns how many were dropped
    fn clear_events(&self) -> usize {
        let removed = ChannelKind::ALL
            .iter()
            .map(|kind| self.channel(*kind).remove_where(|_| true))
            .sum();
        self.refresh_data_head();
        removed
    }

    /// Drain loop of one channel
    fn drain(self: Arc<Self>, kind: ChannelKind) {
        trace!("{}: {} event thread started", self.logical_name, kind);
        let strict = self.config.strict_fifo;

        loop {
            let next = {
                let mut state = self.channel(kind).lock();
                let ready = state
                    .queue
                    .front()
                    .is_some_and(|front| self.gate_open(kind, front.seq));
                let next = if ready { state.queue.pop_front() } else { None };
                if next.is_none() {
                    state.draining = false;
                }
                if kind == ChannelKind::Data {
                    self.data_head.store(state.head_seq(), Ordering::SeqCst);
                }
                next
            };

            let Some(entry) = next else {
                break;
            };
            if strict && kind == ChannelKind::Data {
                self.kick(ChannelKind::General);
                self.kick(ChannelKind::Output);
            }
            self.deliver(entry.event);
        }

        trace!("{}: {} event thread stopped", self.logical_name, kind);
    }

    fn deliver(self: &Arc<Self>, event: Event) {
        trace!("{}: delivering {}", self.logical_name, event.name());
        match event {
            Event::Data(data) => {
                {
                    let mut props = self.lock_props();
                    props.data_count = props.data_count.saturating_sub(1);
                    props.data_event_enabled = false;
                    self.data_enabled.store(false, Ordering::SeqCst);
                }
                self.run_callback("DataEvent", move |session| {
                    session.sink.deliver_data(&data)
                });
            }
            Event::Error(mut error) => {
                self.run_callback("ErrorEvent", move |session| {
                    session.sink.deliver_error(&mut error);
                    session.after_error(&error);
                });
            }
            Event::Status(status) => {
                self.run_callback("StatusUpdateEvent", move |session| {
                    session.sink.deliver_status(&status)
                });
            }
            Event::OutputComplete(complete) => {
                self.run_callback("OutputCompleteEvent", move |session| {
                    session.sink.deliver_output_complete(&complete)
                });
            }
            Event::DirectIo(mut direct_io) => {
                self.run_callback("DirectIOEvent", move |session| {
                    session.sink.deliver_direct_io(&mut direct_io);
                    direct_io.finish_delivery();
                });
            }
            Event::Transition(mut transition) => {
                self.run_callback("TransitionEvent", move |session| {
                    session.sink.deliver_transition(&mut transition);
                    transition.finish_delivery();
                });
            }
        }
    }

    /// Clear or retry after an error event, as the application decided
    fn after_error(self: &Arc<Self>, event: &ErrorEvent) {
        let response = event.effective_response(self.class.allows_input_retry());
        let output = event.locus.is_output();
        let result = match response {
            ErrorResponse::Clear if output => self.clear_output(),
            ErrorResponse::Clear => self.clear_input(),
            ErrorResponse::Retry if output => self.retry_output(),
            ErrorResponse::Retry => self.retry_input(),
            ErrorResponse::ContinueInput => Ok(()),
        };
        if let Err(e) = result {
            warn!(
                "{}: {:?} after error event failed: {}",
                self.logical_name, response, e
            );
        }
    }

    /// Run a sink callback, bounded by the configured callback wait
    fn run_callback<F>(self: &Arc<Self>, what: &'static str, callback: F)
    where
        F: FnOnce(&Arc<Session>) + Send + 'static,
    {
        let wait = self.config.callback_wait();
        if wait.is_infinite() {
            self.guarded(what, callback);
            return;
        }

        let done = Arc::new(SyncObject::new());
        let session = self.clone();
        let signal = done.clone();
        let spawned = thread::Builder::new()
            .name(format!("{} callback", self.logical_name))
            .spawn(move || {
                session.guarded(what, callback);
                signal.signal();
            });

        match spawned {
            Ok(_) => {
                if !done.suspend(wait) {
                    warn!(
                        "{}: {} callback still running after {}, continuing; sink is non-conformant",
                        self.logical_name, what, wait
                    );
                }
            }
            Err(e) => error!(
                "{}: cannot start callback thread, {} lost: {}",
                self.logical_name, what, e
            ),
        }
    }

    fn guarded<F>(self: &Arc<Self>, what: &'static str, callback: F)
    where
        F: FnOnce(&Arc<Session>),
    {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(self)));
        if let Err(e) = outcome {
            error!("Panic in {} callback of {}: {:?}", what, self.logical_name, e);
        }
    }
}

fn check_open(props: &SessionProps) -> Result<()> {
    check(!props.open, ErrorCode::Closed, "Device not opened")
}
