//! Connection layer boundary
//!
//! This module defines:
//! - The `DeviceConnection` trait the invocation engine talks to
//! - Notification attributes and sinks for handshake change delivery
//! - `SimulatedPlc`, an in-process controller used for development and tests

mod simulated;
mod traits;

pub use simulated::{CommandBehaviour, FlagWrite, SimulatedPlc, SimulatedPlcConfig};
pub use traits::{
    ConnectionError, DeviceConnection, NotificationAttributes, NotificationHandle,
    NotificationSink, TransmissionMode,
};
