//! Errors of a command invocation

use crate::arguments::ArgumentError;
use crate::connection::ConnectionError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why an invocation failed; every variant names the command
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("Device {device} is not connected (command {path})")]
    NotConnected { path: String, device: String },

    #[error("Command {path} not found on the controller")]
    CommandNotFound {
        path: String,
        #[source]
        source: ConnectionError,
    },

    #[error("Registering the handshake notification of {path} failed {attempts} times")]
    RegistrationFailed { path: String, attempts: u32 },

    #[error("Command {path} timed out after {timeout:?}")]
    Timeout { path: String, timeout: Duration },

    #[error("Command {path} failed with result code {code}: {message}")]
    ControllerReportedError {
        path: String,
        code: u16,
        message: String,
    },

    #[error("Command {path} is already executing on {device}")]
    LockContention { path: String, device: String },

    #[error("Command {path} was cancelled")]
    Cancelled { path: String },

    #[error("Connection error in command {path}: {source}")]
    Connection {
        path: String,
        #[source]
        source: ConnectionError,
    },

    #[error("Argument error in command {path}: {source}")]
    Argument {
        path: String,
        #[source]
        source: ArgumentError,
    },
}

impl CommandError {
    /// Path of the command that failed
    pub fn path(&self) -> &str {
        match self {
            CommandError::NotConnected { path, .. }
            | CommandError::CommandNotFound { path, .. }
            | CommandError::RegistrationFailed { path, .. }
            | CommandError::Timeout { path, .. }
            | CommandError::ControllerReportedError { path, .. }
            | CommandError::LockContention { path, .. }
            | CommandError::Cancelled { path }
            | CommandError::Connection { path, .. }
            | CommandError::Argument { path, .. } => path,
        }
    }

    /// Result code reported by the controller, if any
    pub fn result_code(&self) -> Option<u16> {
        match self {
            CommandError::ControllerReportedError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Error returned by an invocation
///
/// Carries the primary error and, when resetting the execute flag during
/// cleanup failed as well, that secondary failure. The reset failure never
/// replaces the primary error.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationError {
    error: CommandError,
    reset_failure: Option<ConnectionError>,
}

impl InvocationError {
    pub fn new(error: CommandError) -> Self {
        Self {
            error,
            reset_failure: None,
        }
    }

    pub(crate) fn with_reset_failure(mut self, failure: Option<ConnectionError>) -> Self {
        self.reset_failure = failure;
        self
    }

    pub fn error(&self) -> &CommandError {
        &self.error
    }

    pub fn into_error(self) -> CommandError {
        self.error
    }

    /// Failure of the best-effort execute flag reset, if it failed
    pub fn reset_failure(&self) -> Option<&ConnectionError> {
        self.reset_failure.as_ref()
    }

    pub fn command_path(&self) -> &str {
        self.error.path()
    }
}

impl From<CommandError> for InvocationError {
    fn from(error: CommandError) -> Self {
        Self::new(error)
    }
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(reset) = &self.reset_failure {
            write!(f, " (resetting the execute flag failed as well: {reset})")?;
        }
        Ok(())
    }
}

impl std::error::Error for InvocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_command() {
        let err = CommandError::ControllerReportedError {
            path: "MAIN.fbHome".into(),
            code: 101,
            message: "Axis not homed".into(),
        };
        assert_eq!(
            err.to_string(),
            "Command MAIN.fbHome failed with result code 101: Axis not homed"
        );
        assert_eq!(err.path(), "MAIN.fbHome");
        assert_eq!(err.result_code(), Some(101));

        let err = CommandError::RegistrationFailed {
            path: "MAIN.fbHome".into(),
            attempts: 3,
        };
        assert!(err.to_string().contains("failed 3 times"));
    }

    #[test]
    fn test_reset_failure_is_auxiliary() {
        let err = InvocationError::new(CommandError::Timeout {
            path: "MAIN.fbHome".into(),
            timeout: Duration::from_secs(5),
        })
        .with_reset_failure(Some(ConnectionError::NotConnected("plc".into())));

        assert!(matches!(err.error(), CommandError::Timeout { .. }));
        assert_eq!(
            err.reset_failure(),
            Some(&ConnectionError::NotConnected("plc".into()))
        );
        assert!(err.to_string().starts_with("Command MAIN.fbHome timed out"));
        assert!(err.to_string().contains("resetting the execute flag failed"));
        assert_eq!(err.command_path(), "MAIN.fbHome");
    }
}
