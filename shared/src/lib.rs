//! PLC Command Shared Types
//!
//! This crate provides the handshake layout, codec and result-code vocabulary
//! shared between the command invocation engine, controller simulators and
//! tooling that talks to PLC-side commands.

pub mod handshake;
pub mod result_code;
pub mod state_machine;

use chrono::{DateTime, Utc};

// Re-export commonly used types at crate root
pub use handshake::{CodecError, CommandChangeEvent, HandshakeSnapshot};
pub use result_code::{ResultCode, ResultCodeTranslator, TranslatorError};
pub use state_machine::{InvocationEvent, InvocationState, InvocationStateMachine, TransitionResult};

/// Get the current wall-clock time
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Default parameters for command invocation
pub mod defaults {
    use std::time::Duration;

    /// Time allowed between arming a command and its terminal handshake
    pub const INVOCATION_TIMEOUT: Duration = Duration::from_secs(5);

    /// Notification cycle time for the handshake structure
    pub const ON_CHANGE_CYCLE_TIME: Duration = Duration::from_millis(50);

    /// Maximum delay before a pending notification is delivered
    pub const ON_CHANGE_MAX_DELAY: Duration = Duration::ZERO;

    /// How long to wait for the first on-change notification after registering
    pub const MAX_WAIT_FOR_INITIAL_EVENT: Duration = Duration::from_secs(1);

    /// How often a registration is retried when the first notification never arrives
    pub const MAX_RETRIES_FOR_INITIAL_EVENT: u32 = 3;
}

/// Symbol names of the controller-side command structure
pub mod symbols {
    /// Handshake structure of a command
    pub fn handshake(command_path: &str) -> String {
        format!("{command_path}.stHandshake")
    }

    /// Execute flag inside the handshake, used to arm and reset a command
    pub fn execute_flag(command_path: &str) -> String {
        format!("{command_path}.stHandshake.bExecute")
    }

    /// Input argument of a command
    pub fn input(command_path: &str, name: &str) -> String {
        format!("{command_path}.stInput.{name}")
    }

    /// Output argument of a command
    pub fn output(command_path: &str, name: &str) -> String {
        format!("{command_path}.stOutput.{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_names() {
        assert_eq!(symbols::handshake("MAIN.fbHome"), "MAIN.fbHome.stHandshake");
        assert_eq!(
            symbols::execute_flag("MAIN.fbHome"),
            "MAIN.fbHome.stHandshake.bExecute"
        );
        assert_eq!(symbols::input("MAIN.fbMove", "fTarget"), "MAIN.fbMove.stInput.fTarget");
        assert_eq!(symbols::output("MAIN.fbMove", "fActual"), "MAIN.fbMove.stOutput.fActual");
    }

    #[test]
    fn test_defaults() {
        assert_eq!(defaults::INVOCATION_TIMEOUT.as_secs(), 5);
        assert_eq!(defaults::ON_CHANGE_CYCLE_TIME.as_millis(), 50);
        assert_eq!(defaults::MAX_RETRIES_FOR_INITIAL_EVENT, 3);
    }
}
