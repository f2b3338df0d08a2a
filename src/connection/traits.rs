//! Device connection abstraction for pluggable controller backends

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Handle of a registered notification; used to delete it later
pub type NotificationHandle = u32;

/// Errors reported by the connection layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Device {0} is not connected")]
    NotConnected(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Invalid notification handle: {0}")]
    InvalidHandle(NotificationHandle),

    #[error("Size mismatch for {symbol}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        symbol: String,
        expected: usize,
        actual: usize,
    },

    #[error("Device error {code}: {message}")]
    Device { code: u32, message: String },
}

/// When notifications should be generated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionMode {
    /// Deliver a snapshot every cycle, changed or not
    Cyclic,
    /// Deliver only when the watched bytes differ from the last snapshot
    OnChange,
}

/// Attributes for creating a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationAttributes {
    pub length: usize,
    pub mode: TransmissionMode,
    pub max_delay: Duration,
    pub cycle_time: Duration,
}

impl NotificationAttributes {
    pub fn new(length: usize, mode: TransmissionMode, max_delay: Duration, cycle_time: Duration) -> Self {
        Self {
            length,
            mode,
            max_delay,
            cycle_time,
        }
    }
}

/// Receiver of notification payloads
///
/// Called on whatever thread the connection layer delivers notifications
/// on, so implementations must not block.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, timestamp: DateTime<Utc>, raw: &[u8]);
}

/// A connection to one controller
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Address of the device, used to tell devices apart
    fn address(&self) -> String;

    async fn read_flag(&self, symbol: &str) -> Result<bool, ConnectionError>;

    async fn write_flag(&self, symbol: &str, value: bool) -> Result<(), ConnectionError>;

    async fn read_value(&self, symbol: &str) -> Result<Bytes, ConnectionError>;

    async fn write_value(&self, symbol: &str, data: Bytes) -> Result<(), ConnectionError>;

    async fn register_notification(
        &self,
        symbol: &str,
        attributes: NotificationAttributes,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<NotificationHandle, ConnectionError>;

    async fn unregister_notification(&self, handle: NotificationHandle) -> Result<(), ConnectionError>;
}
