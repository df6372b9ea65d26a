//! Application callback interface

use crate::event::{
    DataEvent, DirectIoEvent, ErrorEvent, OutputCompleteEvent, StatusUpdateEvent, TransitionEvent,
};
use tracing::debug;

/// Receiver of the events delivered to one session
///
/// Methods are only ever called from the session's drain threads, one at a
/// time per channel. Callbacks of different channels may run concurrently.
/// A callback may call back into the session, including blocking operations
/// such as `clear_output` or synchronous commands.
pub trait EventSink: Send + Sync + 'static {
    fn deliver_data(&self, event: &DataEvent);

    /// The sink may change the response before returning
    fn deliver_error(&self, event: &mut ErrorEvent);

    fn deliver_status(&self, event: &StatusUpdateEvent);

    fn deliver_output_complete(&self, event: &OutputCompleteEvent);

    /// The sink may update data and payload before returning
    fn deliver_direct_io(&self, event: &mut DirectIoEvent);

    fn deliver_transition(&self, event: &mut TransitionEvent) {
        debug!(
            "{}: transition {} ignored by sink",
            event.source, event.transition
        );
    }
}
