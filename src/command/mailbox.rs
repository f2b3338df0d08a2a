//! Single-slot handoff of handshake changes from the notification thread
//! to the waiting invocation
//!
//! Values are never queued: a new event overwrites an unconsumed one, so
//! the waiter always sees the controller's latest state.

use crate::connection::NotificationSink;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use plc_command_shared::CommandChangeEvent;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::warn;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("No notification within {0:?}")]
pub struct MailboxTimeout(pub Duration);

/// Latest-value-wins mailbox for [`CommandChangeEvent`]s
#[derive(Debug, Default)]
pub struct NotificationMailbox {
    slot: Mutex<Option<CommandChangeEvent>>,
    available: Notify,
}

impl NotificationMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `event`, replacing any unconsumed one, and wake the waiter
    pub fn set(&self, event: CommandChangeEvent) {
        *self.slot.lock() = Some(event);
        self.available.notify_one();
    }

    /// Consume the pending event without waiting
    pub fn try_take(&self) -> Option<CommandChangeEvent> {
        self.slot.lock().take()
    }

    pub fn has_value(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Wait for an event and consume it
    pub async fn get_or_wait(&self, timeout: Duration) -> Result<CommandChangeEvent, MailboxTimeout> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.try_take() {
                return Ok(event);
            }
            // notify_one leaves a permit behind when nobody waits yet,
            // so a set() between the check and here is not lost
            if timeout_at(deadline, self.available.notified()).await.is_err() {
                return self.try_take().ok_or(MailboxTimeout(timeout));
            }
        }
    }

    /// Wait until an event is available without consuming it
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.has_value() {
                return true;
            }
            if timeout_at(deadline, self.available.notified()).await.is_err() {
                return self.has_value();
            }
        }
    }
}

/// Notification sink decoding handshake payloads into a mailbox
pub(crate) struct HandshakeSink {
    command_path: String,
    mailbox: Arc<NotificationMailbox>,
}

impl HandshakeSink {
    pub(crate) fn new(command_path: impl Into<String>, mailbox: Arc<NotificationMailbox>) -> Self {
        Self {
            command_path: command_path.into(),
            mailbox,
        }
    }
}

impl NotificationSink for HandshakeSink {
    fn deliver(&self, timestamp: DateTime<Utc>, raw: &[u8]) {
        match CommandChangeEvent::from_raw(timestamp, raw) {
            Ok(event) => self.mailbox.set(event),
            Err(e) => warn!(
                "[CMD] Dropping undecodable handshake of {}: {}",
                self.command_path, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plc_command_shared::{now, HandshakeSnapshot};

    fn event(progress: u8) -> CommandChangeEvent {
        CommandChangeEvent::new(now(), HandshakeSnapshot::running(progress))
    }

    #[tokio::test]
    async fn test_value_set_before_wait() {
        let mailbox = NotificationMailbox::new();
        mailbox.set(event(10));

        let received = mailbox.get_or_wait(Duration::from_millis(10)).await.unwrap();
        assert_eq!(received.handshake.progress, 10);
        assert!(!mailbox.has_value());
    }

    #[tokio::test]
    async fn test_latest_value_wins() {
        let mailbox = NotificationMailbox::new();
        mailbox.set(event(10));
        mailbox.set(event(20));
        mailbox.set(event(30));

        let received = mailbox.get_or_wait(Duration::from_millis(10)).await.unwrap();
        assert_eq!(received.handshake.progress, 30);

        // Nothing queued behind it
        let next = mailbox.get_or_wait(Duration::from_millis(10)).await;
        assert_eq!(next, Err(MailboxTimeout(Duration::from_millis(10))));
    }

    #[tokio::test]
    async fn test_wakes_waiter() {
        let mailbox = Arc::new(NotificationMailbox::new());

        let producer = {
            let mailbox = mailbox.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                mailbox.set(event(55));
            })
        };

        let received = mailbox.get_or_wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(received.handshake.progress, 55);
        producer.join().unwrap();
    }

    #[tokio::test]
    async fn test_wait_does_not_consume() {
        let mailbox = NotificationMailbox::new();
        assert!(!mailbox.wait(Duration::from_millis(10)).await);

        mailbox.set(event(1));
        assert!(mailbox.wait(Duration::from_millis(10)).await);
        assert!(mailbox.has_value());
        assert!(mailbox.try_take().is_some());
    }

    #[test]
    fn test_sink_decodes_payload() {
        let mailbox = Arc::new(NotificationMailbox::new());
        let sink = HandshakeSink::new("MAIN.fbHome", mailbox.clone());

        sink.deliver(now(), &[0, 0, 2, 0, 100, 0, 0, 0]);
        let event = mailbox.try_take().unwrap();
        assert!(event.handshake.is_finished());
        assert_eq!(event.handshake.result_code, 2);

        // Short payloads are dropped
        sink.deliver(now(), &[1]);
        assert!(mailbox.try_take().is_none());
    }
}
