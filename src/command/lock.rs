//! Mutual exclusion of invocations per command and device
//!
//! At most one invocation of a command path may be in flight on a given
//! device. Waiters under [`AdmissionPolicy::Lock`] are all woken when a key
//! is released and contend again, so admission order is not FIFO.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// What to do when a key is already held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionPolicy {
    /// Wait until the running invocation releases the key
    #[default]
    Lock,
    /// Fail immediately with a lock error
    FailFast,
}

/// Identifies one command on one device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub command_path: String,
    pub device: String,
}

impl LockKey {
    pub fn new(command_path: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            command_path: command_path.into(),
            device: device.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.command_path, self.device)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("{0} is already held")]
    Contended(LockKey),

    #[error("Gave up waiting for {key} after {waited:?}")]
    WaitTimedOut { key: LockKey, waited: Duration },
}

/// Registry of keys currently held by running invocations
#[derive(Debug, Default)]
pub struct InvocationLockRegistry {
    held: Mutex<HashSet<LockKey>>,
    released: Notify,
}

impl InvocationLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` according to `policy`
    ///
    /// `wait_timeout` bounds the wait under `AdmissionPolicy::Lock`; `None`
    /// waits until the key is free.
    pub async fn acquire(
        self: &Arc<Self>,
        key: LockKey,
        policy: AdmissionPolicy,
        wait_timeout: Option<Duration>,
    ) -> Result<InvocationPermit, LockError> {
        let deadline = wait_timeout.map(|t| Instant::now() + t);

        loop {
            // Register for the wake-up before looking, so a release in
            // between is not missed
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(permit) = self.try_acquire(&key) {
                return Ok(permit);
            }

            if policy == AdmissionPolicy::FailFast {
                return Err(LockError::Contended(key));
            }

            debug!("[LOCK] Waiting for {}", key);
            match deadline {
                Some(deadline) => {
                    if timeout_at(deadline, released).await.is_err() {
                        return Err(LockError::WaitTimedOut {
                            key,
                            waited: wait_timeout.unwrap_or_default(),
                        });
                    }
                }
                None => released.await,
            }
        }
    }

    /// Claim `key` if it is free
    pub fn try_acquire(self: &Arc<Self>, key: &LockKey) -> Option<InvocationPermit> {
        let mut held = self.held.lock();
        if !held.insert(key.clone()) {
            return None;
        }
        debug!("[LOCK] Acquired {}", key);
        Some(InvocationPermit {
            registry: self.clone(),
            key: key.clone(),
        })
    }

    pub fn is_held(&self, key: &LockKey) -> bool {
        self.held.lock().contains(key)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    fn release(&self, key: &LockKey) {
        let mut held = self.held.lock();
        held.remove(key);
        // Wake while still holding the set so the removal and the wake-up
        // are observed together
        self.released.notify_waiters();
        debug!("[LOCK] Released {}", key);
    }
}

/// Proof of holding a key; releases it when dropped
#[derive(Debug)]
pub struct InvocationPermit {
    registry: Arc<InvocationLockRegistry>,
    key: LockKey,
}

impl InvocationPermit {
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for InvocationPermit {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}
