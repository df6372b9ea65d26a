//! Async channel bridge between drain threads and a Tokio runtime
//!
//! [`BridgeSink`] is an [`EventSink`] that forwards every delivered event
//! into a bounded `async-channel`; [`EventBridge`] is the receiving half used
//! from async code. Because the channel is bounded, a slow consumer blocks
//! the drain threads, exactly like a slow callback would.

use crate::event::{
    DataEvent, DirectIoEvent, ErrorEvent, Event, OutputCompleteEvent, StatusUpdateEvent,
    TransitionEvent,
};
use crate::sink::EventSink;
use crate::types::ErrorResponse;
use async_channel::{Receiver, Sender, bounded};
use tracing::warn;

/// Chooses the response to an error event before it is forwarded
pub type ErrorResponder = Box<dyn Fn(&ErrorEvent) -> Option<ErrorResponse> + Send + Sync>;

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct EventBridge {
    event_rx: Receiver<Event>,
}

impl EventBridge {
    /// Receive the next delivered event
    pub async fn recv_event(&self) -> common::Result<Event> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| common::Error::Channel(e.to_string()))
    }

    /// Receive an event from a plain thread (blocking)
    pub fn recv_blocking(&self) -> common::Result<Event> {
        self.event_rx
            .recv_blocking()
            .map_err(|e| common::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without blocking
    pub fn try_recv_event(&self) -> Option<Event> {
        self.event_rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.event_rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.event_rx.is_empty()
    }
}

/// Sink half, handed to [`Driver::open_session`](crate::Driver::open_session)
pub struct BridgeSink {
    event_tx: Sender<Event>,
    responder: Option<ErrorResponder>,
}

impl BridgeSink {
    /// Decide error responses on the drain thread
    ///
    /// The async side only sees events after the fact, so the retry or clear
    /// decision has to be made here. Returning `None` keeps the default.
    pub fn with_error_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&ErrorEvent) -> Option<ErrorResponse> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    fn forward(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.event_tx.send_blocking(event) {
            warn!("{} not forwarded: {}", name, e);
        }
    }
}

impl EventSink for BridgeSink {
    fn deliver_data(&self, event: &DataEvent) {
        self.forward(Event::Data(event.clone()));
    }

    fn deliver_error(&self, event: &mut ErrorEvent) {
        if let Some(response) = self.responder.as_ref().and_then(|r| r(event)) {
            event.set_response(response);
        }
        self.forward(Event::Error(event.clone()));
    }

    fn deliver_status(&self, event: &StatusUpdateEvent) {
        self.forward(Event::Status(event.clone()));
    }

    fn deliver_output_complete(&self, event: &OutputCompleteEvent) {
        self.forward(Event::OutputComplete(event.clone()));
    }

    fn deliver_direct_io(&self, event: &mut DirectIoEvent) {
        self.forward(Event::DirectIo(event.clone()));
    }

    fn deliver_transition(&self, event: &mut TransitionEvent) {
        self.forward(Event::Transition(event.clone()));
    }
}

/// Create the channel bridge between drain threads and Tokio
///
/// Returns (EventBridge for Tokio, BridgeSink for the session)
pub fn create_event_bridge(capacity: usize) -> (EventBridge, BridgeSink) {
    let (event_tx, event_rx) = bounded(capacity.max(1));

    (
        EventBridge { event_rx },
        BridgeSink {
            event_tx,
            responder: None,
        },
    )
}
