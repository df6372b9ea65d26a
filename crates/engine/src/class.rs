//! Device-class hooks
//!
//! A [`DeviceClass`] describes the class specific behaviour the engine needs
//! while processing commands and events: which status events a session wants,
//! how a status maps onto session properties, how failures are reported.
//! Every hook has a default matching the common behaviour of all classes.

use crate::command::Command;
use crate::delay::Delay;
use crate::error::DeviceError;
use crate::event::{ErrorEvent, OutputCompleteEvent, StatusUpdateEvent};
use crate::session::SessionProps;
use crate::types::{Exclusivity, PowerState, status};
use std::fmt;
use tracing::debug;

/// Property changes implied by a status value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusDelta {
    /// New power state, if the status reports one
    pub power_state: Option<PowerState>,
    /// The status is meaningful even if no property changes
    pub observable: bool,
}

/// Class specific behaviour plugged into the engine
pub trait DeviceClass: Send + Sync + 'static {
    /// Class name used in log lines
    fn name(&self) -> &str;

    fn exclusivity(&self) -> Exclusivity {
        Exclusivity::Exclusive
    }

    /// Whether a session suppresses `event` before any other processing
    ///
    /// The default suppresses power statuses unless power notification is on.
    fn block(&self, props: &SessionProps, event: &StatusUpdateEvent) -> bool {
        block_power_status(props, event)
    }

    /// Pure mapping from a status value to property changes
    fn status_delta(&self, _props: &SessionProps, status: i32) -> StatusDelta {
        power_status_delta(status)
    }

    /// Drop status events that change nothing
    fn drops_duplicate_status(&self) -> bool {
        false
    }

    /// Firing policy of `event`; defaults to what the raiser asked for
    fn status_delay(&self, _props: &SessionProps, event: &StatusUpdateEvent) -> Delay {
        event.delay().unwrap_or_default()
    }

    /// Error event for a failed asynchronous command
    ///
    /// Returning `None` completes the command quietly: no error event, no
    /// Error state, and an idle status event once the session becomes idle.
    fn error_event(&self, command: &Command, error: &DeviceError) -> Option<ErrorEvent> {
        Some(ErrorEvent::new(
            command.session_id(),
            error,
            command.kind().error_locus(),
        ))
    }

    /// Completion event for a successful asynchronous command
    fn output_complete_event(&self, command: &Command) -> Option<OutputCompleteEvent> {
        command
            .output_id()
            .map(|id| OutputCompleteEvent::new(command.session_id(), id))
    }

    /// Status value of the event raised when a flagged session becomes idle
    fn idle_status(&self) -> i32 {
        0
    }

    /// Whether Retry is an acceptable response to input locus errors
    fn allows_input_retry(&self) -> bool {
        false
    }

    /// Whether a failed asynchronous command is kept for a later retry
    fn requeue_failed(&self, _command: &Command) -> bool {
        true
    }

    /// Called whenever the engine changes a session property
    fn property_changed(&self, logical_name: &str, property: &str, value: &dyn fmt::Debug) {
        debug!("{}: {} <- {:?}", logical_name, property, value);
    }
}

/// Suppress power statuses for sessions without power notification
pub fn block_power_status(props: &SessionProps, event: &StatusUpdateEvent) -> bool {
    status::is_power(event.status) && !props.power_notify
}

/// Default status mapping: power statuses set the power state, firmware
/// update statuses are observable, everything else is unknown
pub fn power_status_delta(value: i32) -> StatusDelta {
    let power_state = match value {
        status::POWER_ONLINE => Some(PowerState::Online),
        status::POWER_OFF => Some(PowerState::Off),
        status::POWER_OFFLINE => Some(PowerState::Offline),
        status::POWER_OFF_OFFLINE => Some(PowerState::OffOffline),
        _ => None,
    };

    StatusDelta {
        power_state,
        observable: status::is_firmware(value),
    }
}

/// Status value reporting `state`, if there is one
pub fn power_status_of(state: PowerState) -> Option<i32> {
    match state {
        PowerState::Online => Some(status::POWER_ONLINE),
        PowerState::Off => Some(status::POWER_OFF),
        PowerState::Offline => Some(status::POWER_OFFLINE),
        PowerState::OffOffline => Some(status::POWER_OFF_OFFLINE),
        PowerState::Unknown => None,
    }
}

/// Device class using every default hook
#[derive(Debug, Clone)]
pub struct GenericClass {
    name: String,
    exclusivity: Exclusivity,
}

impl GenericClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exclusivity: Exclusivity::Exclusive,
        }
    }

    pub fn with_exclusivity(mut self, exclusivity: Exclusivity) -> Self {
        self.exclusivity = exclusivity;
        self
    }
}

impl DeviceClass for GenericClass {
    fn name(&self) -> &str {
        &self.name
    }

    fn exclusivity(&self) -> Exclusivity {
        self.exclusivity
    }
}
