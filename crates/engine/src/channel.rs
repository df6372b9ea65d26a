//! Per-session event channels
//!
//! Every session owns three ordered event lists. Each is guarded by its own
//! monitor and drained by at most one thread at a time; the drain logic
//! itself lives with the session, which knows the gates and the sink.

use crate::event::Event;
use common::lock_unpoisoned;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// The three event lists of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Status, direct IO and transition events
    General,
    /// Data events and input errors
    Data,
    /// Output complete events and output errors
    Output,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::General, ChannelKind::Data, ChannelKind::Output];

    pub(crate) fn index(self) -> usize {
        match self {
            ChannelKind::General => 0,
            ChannelKind::Data => 1,
            ChannelKind::Output => 2,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::General => "general",
            ChannelKind::Data => "data",
            ChannelKind::Output => "output",
        };
        f.write_str(name)
    }
}

/// Buffered event with its session-wide append sequence number
#[derive(Debug)]
pub(crate) struct QueuedEvent {
    pub seq: u64,
    pub event: Event,
}

#[derive(Debug, Default)]
pub(crate) struct ChannelState {
    pub queue: VecDeque<QueuedEvent>,
    /// A drain thread is live for this channel
    pub draining: bool,
}

impl ChannelState {
    /// Sequence number of the oldest entry, `u64::MAX` when empty
    pub fn head_seq(&self) -> u64 {
        self.queue.front().map(|e| e.seq).unwrap_or(u64::MAX)
    }
}

#[derive(Debug)]
pub(crate) struct EventChannel {
    kind: ChannelKind,
    state: Mutex<ChannelState>,
}

impl EventChannel {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            state: Mutex::new(ChannelState::default()),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn lock(&self) -> MutexGuard<'_, ChannelState> {
        lock_unpoisoned(&self.state)
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Drop buffered events matching `drop`; returns how many were removed
    pub fn remove_where<F>(&self, mut drop: F) -> usize
    where
        F: FnMut(&Event) -> bool,
    {
        let mut state = self.lock();
        let before = state.queue.len();
        state.queue.retain(|e| !drop(&e.event));
        before - state.queue.len()
    }
}
