//! PLC command invocation
//!
//! Runs controller-side commands over their handshake structure: arm the
//! execute flag, follow progress through change notifications and turn the
//! final result code into a typed outcome.

pub mod arguments;
pub mod command;
pub mod connection;

pub use arguments::{ArgumentHandler, ArgumentValue, CommandArguments, SymbolArgumentHandler};
pub use command::{
    AdmissionPolicy, CommandError, CommandInvoker, CommandStateChanged, InvocationConfig,
    InvocationError, InvocationLockRegistry,
};
pub use connection::{DeviceConnection, SimulatedPlc};
pub use plc_command_shared::{HandshakeSnapshot, ResultCode, ResultCodeTranslator};
