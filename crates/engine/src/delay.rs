//! Delayed and coalesced status events
//!
//! A status event may ask to be fired later, or to cancel a previously
//! delayed one. Each session buffers at most one delayed event; buffering
//! another replaces it. The buffered event fires from its own timer thread
//! unless it is superseded first.

use crate::event::StatusUpdateEvent;
use crate::session::Session;
use common::{SyncObject, Timeout, lock_unpoisoned};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, trace};

/// Firing policy of a status event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delay {
    /// Fire now
    #[default]
    Immediate,
    /// Buffer and fire after the given time unless superseded
    After(Duration),
    /// If an event is buffered, drop it together with this one; otherwise
    /// fire this one now
    CancelOnly,
    /// Drop any buffered event and fire this one now
    CancelFire,
}

impl Delay {
    /// Raw value meaning [`Delay::CancelOnly`]
    pub const CANCEL_ONLY: i64 = -1;
    /// Raw value meaning [`Delay::CancelFire`]
    pub const CANCEL_FIRE: i64 = -2;

    /// Decode the integer convention used by device classes
    ///
    /// Zero and unknown negative values fire immediately, positive values are
    /// milliseconds.
    pub fn from_millis(value: i64) -> Delay {
        match value {
            Self::CANCEL_ONLY => Delay::CancelOnly,
            Self::CANCEL_FIRE => Delay::CancelFire,
            v if v > 0 => Delay::After(Duration::from_millis(v as u64)),
            _ => Delay::Immediate,
        }
    }
}

/// Outcome of offering a status event to the delay buffer
#[derive(Debug)]
pub(crate) enum Admission {
    /// Deliver now
    Fire(StatusUpdateEvent),
    /// Held back; its timer thread fires it later
    Buffered,
    /// Dropped together with the buffered event; property updates still apply
    Dropped(StatusUpdateEvent),
}

#[derive(Debug)]
struct Pending {
    generation: u64,
    cancel: Arc<SyncObject>,
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<Pending>,
    generation: u64,
}

/// Per-session single-slot buffer of delayed status events
#[derive(Debug, Default)]
pub(crate) struct DelayBuffer {
    slot: Mutex<Slot>,
}

impl DelayBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Apply `delay` to `event`
    pub(crate) fn admit(
        &self,
        session: &Arc<Session>,
        event: StatusUpdateEvent,
        delay: Delay,
    ) -> Admission {
        match delay {
            Delay::Immediate => Admission::Fire(event),
            Delay::CancelOnly => {
                if self.cancel_pending() {
                    debug!(
                        "{}: status {} cancelled buffered event, both dropped",
                        session.logical_name(),
                        event.status
                    );
                    Admission::Dropped(event)
                } else {
                    Admission::Fire(event)
                }
            }
            Delay::CancelFire => {
                self.cancel_pending();
                Admission::Fire(event)
            }
            Delay::After(after) => {
                let mut slot = lock_unpoisoned(&self.slot);
                if let Some(previous) = slot.pending.take() {
                    previous.cancel.signal();
                }
                slot.generation += 1;
                let generation = slot.generation;
                let cancel = Arc::new(SyncObject::new());

                let timer_session = session.clone();
                let timer_cancel = cancel.clone();
                let status = event.status;
                let spawned = thread::Builder::new()
                    .name(format!("{} delayed status", session.logical_name()))
                    .spawn(move || {
                        run_timer(timer_session, event, after, generation, timer_cancel)
                    });

                match spawned {
                    Ok(_) => {
                        debug!(
                            "{}: status {} buffered for {:?}",
                            session.logical_name(),
                            status,
                            after
                        );
                        slot.pending = Some(Pending { generation, cancel });
                        Admission::Buffered
                    }
                    Err(e) => {
                        // The event moved into the failed closure; report it
                        // as fired immediately instead.
                        error!(
                            "{}: cannot start delay timer: {}",
                            session.logical_name(),
                            e
                        );
                        Admission::Fire(StatusUpdateEvent::new(session.id(), status))
                    }
                }
            }
        }
    }

    /// Drop the buffered event, if any. Returns whether one was buffered.
    pub(crate) fn cancel_pending(&self) -> bool {
        let mut slot = lock_unpoisoned(&self.slot);
        match slot.pending.take() {
            Some(pending) => {
                pending.cancel.signal();
                true
            }
            None => false,
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        lock_unpoisoned(&self.slot).pending.is_some()
    }

    /// Claim the slot for a timer whose delay elapsed
    fn take_if_current(&self, generation: u64) -> bool {
        let mut slot = lock_unpoisoned(&self.slot);
        match &slot.pending {
            Some(pending) if pending.generation == generation => {
                slot.pending = None;
                true
            }
            _ => false,
        }
    }
}

fn run_timer(
    session: Arc<Session>,
    event: StatusUpdateEvent,
    after: Duration,
    generation: u64,
    cancel: Arc<SyncObject>,
) {
    trace!("{}: delay timer started", session.logical_name());

    if cancel.suspend(Timeout::from_duration(after)) {
        trace!("{}: delayed status {} superseded", session.logical_name(), event.status);
        return;
    }
    if !session.delay_buffer().take_if_current(generation) {
        return;
    }

    debug!("{}: delayed status {} firing", session.logical_name(), event.status);
    session.fire_status(event);
}
