//! POS peripheral runtime engine
//!
//! Turns synchronous device-class calls into serialized asynchronous command
//! execution, and delivers the resulting events to one or more sessions over
//! three independently draining channels.
//!
//! # Example
//!
//! ```no_run
//! use engine::{Command, DeviceIndex, Driver, EngineConfig, FnTask, GenericClass};
//! use engine::create_event_bridge;
//! use common::Timeout;
//! use std::sync::Arc;
//!
//! let driver = Driver::new("printer", Arc::new(GenericClass::new("POSPrinter")), EngineConfig::default());
//! let (_events, sink) = create_event_bridge(64);
//! let session = driver.open_session(DeviceIndex(0), "receipt", Arc::new(sink));
//! session.claim(Timeout::INFINITE).unwrap();
//! session.set_device_enabled(true).unwrap();
//!
//! let command = Command::new(&session, FnTask::output("print", |_ctx| Ok(())));
//! command.enqueue().unwrap();
//! ```

pub mod bridge;
pub mod channel;
pub mod class;
pub mod command;
pub mod config;
pub mod delay;
pub mod device;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod event;
pub mod session;
pub mod sink;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;

pub use bridge::{BridgeSink, EventBridge, create_event_bridge};
pub use channel::ChannelKind;
pub use class::{DeviceClass, GenericClass, StatusDelta};
pub use command::{AbortToken, Command, FnTask, Task, TaskContext};
pub use config::EngineConfig;
pub use delay::Delay;
pub use device::PhysicalDevice;
pub use dispatcher::Dispatcher;
pub use driver::Driver;
pub use error::{DeviceError, ErrorCode, Result};
pub use event::{
    DataEvent, DirectIoEvent, ErrorEvent, Event, OutputCompleteEvent, StatusUpdateEvent,
    TransitionEvent,
};
pub use session::{Session, SessionProps, SessionSnapshot};
pub use sink::EventSink;
pub use types::{
    CommandKind, DeviceIndex, ErrorLocus, ErrorResponse, Exclusivity, OutputId, PowerState,
    SessionId, SessionState, status,
};
