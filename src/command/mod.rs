//! Command invocation on the controller
//!
//! This module handles:
//! - Serializing invocations per command path and device
//! - Arming a command through its execute flag
//! - Waiting on handshake notifications until the controller answers
//! - Translating result codes into typed errors

mod config;
mod error;
mod executor;
mod lock;
mod mailbox;


pub use config::InvocationConfig;
pub use error::{CommandError, InvocationError};
pub use executor::{CommandCompletion, CommandInvoker, CommandStateChanged};
pub use lock::{AdmissionPolicy, InvocationLockRegistry, InvocationPermit, LockError, LockKey};
pub use mailbox::{MailboxTimeout, NotificationMailbox};
