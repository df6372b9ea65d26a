//! POS runtime simulator
//!
//! A receipt printer driven through the engine over an in-memory loopback
//! transport. Used for manual end-to-end runs of the dispatcher and the
//! event channels.

pub mod config;
pub mod printer;
pub mod scenario;

pub use config::SimulatorConfig;
pub use printer::{Mechanism, PrinterClass};
