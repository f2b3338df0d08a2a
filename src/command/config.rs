//! Invocation configuration

use super::lock::AdmissionPolicy;
use plc_command_shared::defaults;
use std::time::Duration;

/// Configuration of a command invoker
///
/// Owned by the invoker for its whole lifetime. Changing it requires
/// `&mut CommandInvoker`, so it cannot change while an invocation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationConfig {
    /// Time allowed between arming the command and its terminal handshake
    pub timeout: Duration,
    /// What to do when the same command is already running on the device
    pub admission_policy: AdmissionPolicy,
    /// Upper bound for waiting on the invocation lock (`Lock` policy only)
    pub lock_wait_timeout: Option<Duration>,
    /// Deliver handshake snapshots every cycle instead of on change
    pub use_cyclic_notifications: bool,
    /// Notification cycle time
    pub on_change_cycle_time: Duration,
    /// Maximum delay before a notification is delivered
    pub on_change_max_delay: Duration,
    /// How long to wait for the first on-change notification
    pub max_wait_for_initial_event: Duration,
    /// Registrations attempted before giving up on the first notification;
    /// 0 is treated as 1
    pub max_retries_for_initial_event: u32,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            timeout: defaults::INVOCATION_TIMEOUT,
            admission_policy: AdmissionPolicy::default(),
            lock_wait_timeout: None,
            use_cyclic_notifications: false,
            on_change_cycle_time: defaults::ON_CHANGE_CYCLE_TIME,
            on_change_max_delay: defaults::ON_CHANGE_MAX_DELAY,
            max_wait_for_initial_event: defaults::MAX_WAIT_FOR_INITIAL_EVENT,
            max_retries_for_initial_event: defaults::MAX_RETRIES_FOR_INITIAL_EVENT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = InvocationConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.admission_policy, AdmissionPolicy::Lock);
        assert_eq!(config.lock_wait_timeout, None);
        assert!(!config.use_cyclic_notifications);
        assert_eq!(config.on_change_cycle_time, Duration::from_millis(50));
        assert_eq!(config.on_change_max_delay, Duration::ZERO);
        assert_eq!(config.max_wait_for_initial_event, Duration::from_secs(1));
        assert_eq!(config.max_retries_for_initial_event, 3);
    }
}
