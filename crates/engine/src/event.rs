//! Event types delivered to sessions
//!
//! Six event kinds exist. Each carries the [`SessionId`] of the session it is
//! delivered to. [`Event`] is the closed union the drain threads match on.

use crate::channel::ChannelKind;
use crate::delay::Delay;
use crate::error::{DeviceError, ErrorCode, Result};
use crate::types::{ErrorLocus, ErrorResponse, OutputId, SessionId};
use common::{SyncObject, Timeout, lock_unpoisoned};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Input data is available
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataEvent {
    pub source: SessionId,
    pub status: i32,
    pub payload: Vec<u8>,
}

impl DataEvent {
    pub fn new(source: SessionId, status: i32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            source,
            status,
            payload: payload.into(),
        }
    }
}

/// An input or output operation failed
///
/// The application may change [`response`](Self::response) while handling
/// the event; the engine then clears or retries the failed partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEvent {
    pub source: SessionId,
    pub code: ErrorCode,
    pub extended: i32,
    pub locus: ErrorLocus,
    pub response: ErrorResponse,
    pub message: String,
}

impl ErrorEvent {
    /// Error event for `error`, with the default response of `locus`
    pub fn new(source: SessionId, error: &DeviceError, locus: ErrorLocus) -> Self {
        Self {
            source,
            code: error.code,
            extended: error.extended,
            locus,
            response: locus.default_response(),
            message: error.message.clone(),
        }
    }

    pub fn set_response(&mut self, response: ErrorResponse) {
        self.response = response;
    }

    /// The response to act on after delivery
    ///
    /// ContinueInput is only meaningful for the input-data locus, and Retry
    /// on input errors only where the device class supports it. Anything
    /// else falls back to the locus default.
    pub fn effective_response(&self, allow_input_retry: bool) -> ErrorResponse {
        let valid = match (self.locus, self.response) {
            (_, ErrorResponse::Clear) => true,
            (ErrorLocus::Output, ErrorResponse::Retry) => true,
            (ErrorLocus::Output, ErrorResponse::ContinueInput) => false,
            (_, ErrorResponse::Retry) => allow_input_retry,
            (ErrorLocus::InputData, ErrorResponse::ContinueInput) => true,
            (ErrorLocus::Input, ErrorResponse::ContinueInput) => false,
        };

        if valid {
            self.response
        } else {
            let fallback = self.locus.default_response();
            warn!(
                "{}: invalid error response {:?} for locus {:?}, using {:?}",
                self.source, self.response, self.locus, fallback
            );
            fallback
        }
    }

    /// Copy reporting the error while input data is still buffered
    pub(crate) fn input_data_copy(&self) -> ErrorEvent {
        ErrorEvent {
            locus: ErrorLocus::InputData,
            response: ErrorLocus::InputData.default_response(),
            ..self.clone()
        }
    }

    fn channel(&self) -> ChannelKind {
        if self.locus.is_output() {
            ChannelKind::Output
        } else {
            ChannelKind::Data
        }
    }
}

/// Device status changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdateEvent {
    pub source: SessionId,
    pub status: i32,
    #[serde(skip)]
    delay: Option<Delay>,
}

impl StatusUpdateEvent {
    pub fn new(source: SessionId, status: i32) -> Self {
        Self {
            source,
            status,
            delay: None,
        }
    }

    /// Request delayed or coalesced firing, see [`Delay`]
    pub fn with_delay(mut self, delay: Delay) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Delay requested by the raiser, if any
    pub fn delay(&self) -> Option<Delay> {
        self.delay
    }

    /// Independent copy addressed to another session sharing the device
    pub fn copy_for(&self, target: SessionId) -> StatusUpdateEvent {
        StatusUpdateEvent {
            source: target,
            status: self.status,
            delay: self.delay,
        }
    }
}

/// An asynchronous output command completed successfully
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputCompleteEvent {
    pub source: SessionId,
    pub output_id: OutputId,
}

impl OutputCompleteEvent {
    pub fn new(source: SessionId, output_id: OutputId) -> Self {
        Self { source, output_id }
    }
}

/// Hand-off slot a raiser can wait on until the event has been delivered
#[derive(Debug)]
pub(crate) struct Reply<T> {
    slot: Mutex<Option<T>>,
    done: SyncObject,
}

impl<T> Default for Reply<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
            done: SyncObject::new(),
        }
    }
}

impl<T> Reply<T> {
    fn complete(&self, value: T) {
        *lock_unpoisoned(&self.slot) = Some(value);
        self.done.signal();
    }

    /// Wake the raiser with an empty slot
    fn discard(&self) {
        self.done.signal();
    }

    /// Wait until the delivered event comes back, at most `timeout`
    ///
    /// Fails with Timeout when the wait expires, and with Failure when the
    /// event was dropped without being delivered.
    pub(crate) fn wait(&self, timeout: Timeout, what: &str) -> Result<T> {
        if !self.done.suspend(timeout) {
            return Err(DeviceError::timeout(format!(
                "{} event not delivered in time",
                what
            )));
        }
        lock_unpoisoned(&self.slot).take().ok_or_else(|| {
            DeviceError::failure(format!("{} event discarded before delivery", what))
        })
    }
}

/// Event side of a [`Reply`]
///
/// Dropping an event that still holds its reply (cleared from a channel,
/// or lost in a panicking callback) wakes the raiser. Copies of the event
/// never carry the reply.
#[derive(Debug)]
struct ReplyTo<T>(Option<Arc<Reply<T>>>);

impl<T> ReplyTo<T> {
    fn none() -> Self {
        Self(None)
    }

    fn attach(&mut self) -> Arc<Reply<T>> {
        let reply = Arc::new(Reply::default());
        self.0 = Some(reply.clone());
        reply
    }

    fn complete(mut self, value: T) {
        if let Some(reply) = self.0.take() {
            reply.complete(value);
        }
    }
}

impl<T> Clone for ReplyTo<T> {
    fn clone(&self) -> Self {
        Self::none()
    }
}

impl<T> Drop for ReplyTo<T> {
    fn drop(&mut self) {
        if let Some(reply) = self.0.take() {
            reply.discard();
        }
    }
}

/// Vendor specific notification
///
/// `data` and `payload` may be changed by the application during delivery;
/// afterwards the event is write protected.
#[derive(Debug, Clone, Serialize)]
pub struct DirectIoEvent {
    pub source: SessionId,
    pub command: i32,
    data: i32,
    payload: Vec<u8>,
    #[serde(skip)]
    write_protected: bool,
    #[serde(skip)]
    reply: ReplyTo<DirectIoEvent>,
}

impl DirectIoEvent {
    pub fn new(source: SessionId, command: i32, data: i32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            source,
            command,
            data,
            payload: payload.into(),
            write_protected: false,
            reply: ReplyTo::none(),
        }
    }

    pub fn data(&self) -> i32 {
        self.data
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_data(&mut self, data: i32) -> Result<()> {
        self.ensure_writable()?;
        self.data = data;
        Ok(())
    }

    pub fn set_payload(&mut self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.ensure_writable()?;
        self.payload = payload.into();
        Ok(())
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.write_protected {
            Err(DeviceError::illegal("Event already delivered"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn attach_reply(&mut self) -> Arc<Reply<DirectIoEvent>> {
        self.reply.attach()
    }

    /// Write protect and hand the event back to a waiting raiser
    pub(crate) fn finish_delivery(mut self) {
        self.write_protected = true;
        let reply = std::mem::replace(&mut self.reply, ReplyTo::none());
        reply.complete(self);
    }
}

/// State transition notification, e.g. a PIN pad prompt change
///
/// Like [`DirectIoEvent`], `data` and `text` are writable during delivery only.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionEvent {
    pub source: SessionId,
    pub transition: i32,
    data: i32,
    text: String,
    #[serde(skip)]
    write_protected: bool,
    #[serde(skip)]
    reply: ReplyTo<TransitionEvent>,
}

impl TransitionEvent {
    pub fn new(source: SessionId, transition: i32, data: i32, text: impl Into<String>) -> Self {
        Self {
            source,
            transition,
            data,
            text: text.into(),
            write_protected: false,
            reply: ReplyTo::none(),
        }
    }

    pub fn data(&self) -> i32 {
        self.data
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_data(&mut self, data: i32) -> Result<()> {
        self.ensure_writable()?;
        self.data = data;
        Ok(())
    }

    pub fn set_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.ensure_writable()?;
        self.text = text.into();
        Ok(())
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.write_protected {
            Err(DeviceError::illegal("Event already delivered"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn attach_reply(&mut self) -> Arc<Reply<TransitionEvent>> {
        self.reply.attach()
    }

    pub(crate) fn finish_delivery(mut self) {
        self.write_protected = true;
        let reply = std::mem::replace(&mut self.reply, ReplyTo::none());
        reply.complete(self);
    }
}

/// Any event a session can receive
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Data(DataEvent),
    Error(ErrorEvent),
    Status(StatusUpdateEvent),
    OutputComplete(OutputCompleteEvent),
    DirectIo(DirectIoEvent),
    Transition(TransitionEvent),
}

impl Event {
    pub fn source(&self) -> SessionId {
        match self {
            Event::Data(e) => e.source,
            Event::Error(e) => e.source,
            Event::Status(e) => e.source,
            Event::OutputComplete(e) => e.source,
            Event::DirectIo(e) => e.source,
            Event::Transition(e) => e.source,
        }
    }

    /// Channel this event is queued on
    pub fn channel(&self) -> ChannelKind {
        match self {
            Event::Data(_) => ChannelKind::Data,
            Event::Error(e) => e.channel(),
            Event::OutputComplete(_) => ChannelKind::Output,
            Event::Status(_) | Event::DirectIo(_) | Event::Transition(_) => ChannelKind::General,
        }
    }

    /// Short name for log lines
    pub fn name(&self) -> &'static str {
        match self {
            Event::Data(_) => "DataEvent",
            Event::Error(_) => "ErrorEvent",
            Event::Status(_) => "StatusUpdateEvent",
            Event::OutputComplete(_) => "OutputCompleteEvent",
            Event::DirectIo(_) => "DirectIOEvent",
            Event::Transition(_) => "TransitionEvent",
        }
    }
}
