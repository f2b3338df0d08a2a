//! Invocation State Machine
//!
//! Defines the valid states of one command invocation and the transitions
//! between them. `Idle` is both the initial and the terminal state.

/// States of a single invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvocationState {
    #[default]
    Idle,
    /// Invocation lock held, inputs being written
    Locked,
    /// Execute flag set, waiting for the notification to come alive
    ArmedPendingNotification,
    /// Waiting for a terminal handshake
    Waiting,
    Finished,
    CancelledByController,
    TimedOut,
    Faulted,
    /// Notification removed, flag reset and lock released in this state
    Cleanup,
}

impl InvocationState {
    /// States reached once the wait for the controller is over
    pub fn is_outcome(self) -> bool {
        matches!(
            self,
            InvocationState::Finished
                | InvocationState::CancelledByController
                | InvocationState::TimedOut
                | InvocationState::Faulted
        )
    }
}

/// Events that drive an invocation forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationEvent {
    LockAcquired,
    /// Execute flag written
    Armed,
    /// Notification registration was dropped and is being retried
    RegistrationRetry,
    /// First notification arrived (or cyclic delivery needs no check)
    NotificationAlive,
    /// Terminal handshake with a success code
    ControllerFinished,
    /// Terminal handshake reporting a cancel
    ControllerCancelled,
    WaitTimedOut,
    /// Any error before an outcome was reached
    Failed,
    CleanupStarted,
    CleanupComplete,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(InvocationState),
    /// Transition was invalid from current state
    Invalid {
        from: InvocationState,
        event: InvocationEvent,
    },
}

/// State machine tracking one invocation at a time
#[derive(Debug, Default)]
pub struct InvocationStateMachine {
    current_state: InvocationState,
}

impl InvocationStateMachine {
    /// Create a new state machine in Idle state
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current state
    pub fn state(&self) -> InvocationState {
        self.current_state
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: InvocationEvent) -> TransitionResult {
        match self.next_state(event) {
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    /// Force the machine back to Idle, e.g. after an invocation was abandoned
    pub fn reset(&mut self) {
        self.current_state = InvocationState::Idle;
    }

    fn next_state(&self, event: InvocationEvent) -> Option<InvocationState> {
        use InvocationEvent::*;
        use InvocationState::*;

        match (self.current_state, event) {
            (Idle, LockAcquired) => Some(Locked),

            (Locked, Armed) => Some(ArmedPendingNotification),

            (ArmedPendingNotification, RegistrationRetry) => Some(ArmedPendingNotification),
            (ArmedPendingNotification, NotificationAlive) => Some(Waiting),

            (Waiting, ControllerFinished) => Some(Finished),
            (Waiting, ControllerCancelled) => Some(CancelledByController),
            (Waiting, WaitTimedOut) => Some(TimedOut),

            // Errors can happen anywhere between locking and an outcome
            (Locked | ArmedPendingNotification | Waiting, Failed) => Some(Faulted),

            (Finished | CancelledByController | TimedOut | Faulted, CleanupStarted) => {
                Some(Cleanup)
            }
            (Cleanup, CleanupComplete) => Some(Idle),

            _ => None,
        }
    }
}
