//! Physical devices shared by sessions
//!
//! Several sessions may be open on one physical device. The device keeps
//! the list of those sessions for status broadcast, arbitrates the exclusive
//! claim, and remembers the last power state it reported.

use crate::class::power_status_delta;
use crate::error::{DeviceError, Result};
use crate::event::StatusUpdateEvent;
use crate::session::Session;
use crate::types::{DeviceIndex, PowerState, SessionId};
use common::{SyncObject, Timeout, lock_unpoisoned};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct ClaimState {
    holder: Option<SessionId>,
    waiters: Vec<Arc<SyncObject>>,
}

/// One physical device and the sessions sharing it
#[derive(Debug)]
pub struct PhysicalDevice {
    index: DeviceIndex,
    sessions: Mutex<Vec<Weak<Session>>>,
    claim: Mutex<ClaimState>,
    power_state: Mutex<PowerState>,
}

impl PhysicalDevice {
    pub(crate) fn new(index: DeviceIndex) -> Self {
        Self {
            index,
            sessions: Mutex::new(Vec::new()),
            claim: Mutex::new(ClaimState::default()),
            power_state: Mutex::new(PowerState::Unknown),
        }
    }

    pub fn index(&self) -> DeviceIndex {
        self.index
    }

    pub(crate) fn attach(&self, session: &Arc<Session>) {
        let mut sessions = lock_unpoisoned(&self.sessions);
        sessions.retain(|s| s.strong_count() > 0);
        sessions.push(Arc::downgrade(session));
    }

    pub(crate) fn detach(&self, session: SessionId) {
        let mut sessions = lock_unpoisoned(&self.sessions);
        sessions.retain(|s| s.upgrade().is_some_and(|s| s.id() != session));
    }

    /// Sessions currently open on this device
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        lock_unpoisoned(&self.sessions)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Session holding the claim, if any
    pub fn claimed_by(&self) -> Option<SessionId> {
        lock_unpoisoned(&self.claim).holder
    }

    /// Last power state reported through a status broadcast
    pub fn power_state(&self) -> PowerState {
        *lock_unpoisoned(&self.power_state)
    }

    pub(crate) fn set_power_state(&self, state: PowerState) {
        *lock_unpoisoned(&self.power_state) = state;
    }

    /// Claim the device for `session`, waiting for the holder's release
    pub(crate) fn claim(&self, session: SessionId, timeout: Timeout) -> Result<()> {
        let start = Instant::now();

        loop {
            let waiter = {
                let mut claim = lock_unpoisoned(&self.claim);
                match claim.holder {
                    None => {
                        claim.holder = Some(session);
                        debug!("{} claimed by {}", self.index, session);
                        return Ok(());
                    }
                    Some(holder) if holder == session => return Ok(()),
                    Some(holder) => {
                        trace!("{} waits for {} to release {}", session, holder, self.index);
                        let waiter = Arc::new(SyncObject::new());
                        claim.waiters.push(waiter.clone());
                        waiter
                    }
                }
            };

            let remaining = match timeout.as_duration() {
                None => Timeout::INFINITE,
                Some(limit) => {
                    let elapsed = start.elapsed();
                    if elapsed >= limit {
                        return Err(DeviceError::timeout(format!(
                            "{} claimed by another session",
                            self.index
                        )));
                    }
                    Timeout::from_duration(limit - elapsed)
                }
            };
            waiter.suspend(remaining);
        }
    }

    /// Give up the claim and wake every waiter
    pub(crate) fn release_claim(&self, session: SessionId) {
        let mut claim = lock_unpoisoned(&self.claim);
        if claim.holder == Some(session) {
            claim.holder = None;
            for waiter in claim.waiters.drain(..) {
                waiter.signal();
            }
            debug!("{} released by {}", self.index, session);
        }
    }

    /// Deliver a status event to every enabled session on this device
    ///
    /// The originating session gets `event` itself, every other session an
    /// independent copy. Each recipient filters and processes its copy on its
    /// own.
    pub(crate) fn broadcast_status(&self, origin: SessionId, event: StatusUpdateEvent) {
        if let Some(state) = power_status_delta(event.status).power_state {
            self.set_power_state(state);
        }

        let sessions = lock_unpoisoned(&self.sessions);
        let template = event.clone();
        let mut original = Some(event);

        for session in sessions.iter().filter_map(Weak::upgrade) {
            if !session.is_enabled() {
                continue;
            }
            let event = if session.id() == origin {
                original.take()
            } else {
                Some(template.copy_for(session.id()))
            };
            if let Some(event) = event {
                session.accept_status(event);
            }
        }
    }
}
