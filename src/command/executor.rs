//! Command invoker - arms a PLC command and waits for its completion

use super::config::InvocationConfig;
use super::error::{CommandError, InvocationError};
use super::lock::{InvocationLockRegistry, LockKey};
use super::mailbox::{HandshakeSink, NotificationMailbox};
use crate::arguments::{ArgumentHandler, CommandArguments, SymbolArgumentHandler};
use crate::connection::{
    ConnectionError, DeviceConnection, NotificationAttributes, NotificationHandle,
    TransmissionMode,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use plc_command_shared::{
    handshake::HANDSHAKE_SIZE, symbols, CommandChangeEvent, InvocationEvent, InvocationState,
    InvocationStateMachine, ResultCode, ResultCodeTranslator, TransitionResult,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Progress observation published while an invocation runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStateChanged {
    pub command_path: String,
    pub progress: u8,
    pub sub_task: u16,
    pub finished: bool,
    pub cancelled: bool,
    pub timed_out: bool,
}

/// Result of a detached invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandCompletion {
    /// Timestamp of the terminal handshake notification
    pub completed_at: DateTime<Utc>,
    /// Output arguments, filled in if they were requested
    pub output: Option<CommandArguments>,
}

/// Invokes one controller-side command
pub struct CommandInvoker {
    command_path: String,
    connection: Arc<dyn DeviceConnection>,
    locks: Arc<InvocationLockRegistry>,
    arguments: Arc<dyn ArgumentHandler>,
    translator: ResultCodeTranslator,
    config: InvocationConfig,
    observers: Mutex<Vec<mpsc::UnboundedSender<CommandStateChanged>>>,
    /// Last known (progress, sub task)
    last_progress: Mutex<(u8, u16)>,
    fsm: Mutex<InvocationStateMachine>,
}

impl CommandInvoker {
    /// Create an invoker for `command_path` on `connection`
    ///
    /// Invokers sharing `locks` never run the same command on the same
    /// device concurrently.
    pub fn new(
        command_path: impl Into<String>,
        connection: Arc<dyn DeviceConnection>,
        locks: Arc<InvocationLockRegistry>,
    ) -> Self {
        let arguments = Arc::new(SymbolArgumentHandler::new(connection.clone()));
        Self {
            command_path: command_path.into(),
            connection,
            locks,
            arguments,
            translator: ResultCodeTranslator::new(),
            config: InvocationConfig::default(),
            observers: Mutex::new(Vec::new()),
            last_progress: Mutex::new((0, 0)),
            fsm: Mutex::new(InvocationStateMachine::new()),
        }
    }

    pub fn with_config(mut self, config: InvocationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_translator(mut self, translator: ResultCodeTranslator) -> Self {
        self.translator = translator;
        self
    }

    pub fn with_argument_handler(mut self, arguments: Arc<dyn ArgumentHandler>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn command_path(&self) -> &str {
        &self.command_path
    }

    pub fn config(&self) -> &InvocationConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut InvocationConfig {
        &mut self.config
    }

    pub fn translator_mut(&mut self) -> &mut ResultCodeTranslator {
        &mut self.translator
    }

    /// Current state of the invocation state machine
    pub fn state(&self) -> InvocationState {
        self.fsm.lock().state()
    }

    /// Progress reported by the most recent handshake
    pub fn last_progress(&self) -> u8 {
        self.last_progress.lock().0
    }

    /// Sub task reported by the most recent handshake
    pub fn last_sub_task(&self) -> u16 {
        self.last_progress.lock().1
    }

    /// Receive progress observations of all future invocations
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CommandStateChanged> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.lock().push(tx);
        rx
    }

    /// Run the command and wait for the controller to finish it
    ///
    /// Returns the timestamp of the terminal handshake. Cancelling `cancel`
    /// asks the controller to abort; the invocation still waits for the
    /// controller's answer within the configured timeout.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        input: Option<&CommandArguments>,
        output: Option<&mut CommandArguments>,
    ) -> Result<DateTime<Utc>, InvocationError> {
        let device = self.connection.address();
        if !self.connection.is_connected() {
            return Err(CommandError::NotConnected {
                path: self.command_path.clone(),
                device,
            }
            .into());
        }

        let key = LockKey::new(self.command_path.clone(), device.clone());
        let permit = match self
            .locks
            .acquire(key, self.config.admission_policy, self.config.lock_wait_timeout)
            .await
        {
            Ok(permit) => permit,
            Err(e) => {
                warn!("[CMD] {}: {}", self.command_path, e);
                return Err(CommandError::LockContention {
                    path: self.command_path.clone(),
                    device,
                }
                .into());
            }
        };
        self.begin();

        let started = Instant::now();
        let mut registration = None;
        let result = self.run(cancel, input, output, &mut registration).await;
        let reset_failure = self.cleanup(registration, result.is_err()).await;
        drop(permit);

        match result {
            Ok(completed_at) => {
                info!(
                    "[CMD] {} completed in {}ms",
                    self.command_path,
                    started.elapsed().as_millis()
                );
                Ok(completed_at)
            }
            Err(e) => {
                warn!("[CMD] {}", e);
                Err(InvocationError::new(e).with_reset_failure(reset_failure))
            }
        }
    }

    /// Run the command on a separate task
    pub fn execute_detached(
        self: &Arc<Self>,
        cancel: CancellationToken,
        input: Option<CommandArguments>,
        mut output: Option<CommandArguments>,
    ) -> JoinHandle<Result<CommandCompletion, InvocationError>> {
        let invoker = self.clone();
        tokio::spawn(async move {
            let completed_at = invoker
                .execute(&cancel, input.as_ref(), output.as_mut())
                .await?;
            Ok(CommandCompletion {
                completed_at,
                output,
            })
        })
    }

    /// Steps between acquiring the lock and cleaning up
    async fn run(
        &self,
        cancel: &CancellationToken,
        input: Option<&CommandArguments>,
        output: Option<&mut CommandArguments>,
        registration: &mut Option<NotificationHandle>,
    ) -> Result<DateTime<Utc>, CommandError> {
        if let Some(input) = input {
            self.arguments
                .write_input(&self.command_path, input)
                .await
                .map_err(|source| CommandError::Argument {
                    path: self.command_path.clone(),
                    source,
                })?;
        }

        self.arm().await?;
        let armed_at = Instant::now();

        let mailbox = Arc::new(NotificationMailbox::new());
        self.register_notification(&mailbox, registration).await?;
        self.transition(InvocationEvent::NotificationAlive);

        let event = self.wait_for_completion(&mailbox, armed_at, cancel).await?;

        if let Some(output) = output {
            self.arguments
                .read_output(&self.command_path, output)
                .await
                .map_err(|source| CommandError::Argument {
                    path: self.command_path.clone(),
                    source,
                })?;
        }

        Ok(event.timestamp)
    }

    /// Set the execute flag
    async fn arm(&self) -> Result<(), CommandError> {
        let symbol = symbols::execute_flag(&self.command_path);
        match self.connection.write_flag(&symbol, true).await {
            Ok(()) => {
                info!("[CMD] {} armed", self.command_path);
                self.transition(InvocationEvent::Armed);
                Ok(())
            }
            Err(source @ ConnectionError::SymbolNotFound(_)) => Err(CommandError::CommandNotFound {
                path: self.command_path.clone(),
                source,
            }),
            Err(source) => Err(self.connection_error(source)),
        }
    }

    /// Register the handshake notification and make sure it is alive
    ///
    /// Some notification backends drop the first on-change notification
    /// after registering. Without it nothing arrives until the controller
    /// changes the handshake, so the registration is repeated until any
    /// notification shows up.
    async fn register_notification(
        &self,
        mailbox: &Arc<NotificationMailbox>,
        registration: &mut Option<NotificationHandle>,
    ) -> Result<(), CommandError> {
        let symbol = symbols::handshake(&self.command_path);
        let mode = if self.config.use_cyclic_notifications {
            TransmissionMode::Cyclic
        } else {
            TransmissionMode::OnChange
        };
        let attributes = NotificationAttributes::new(
            HANDSHAKE_SIZE,
            mode,
            self.config.on_change_max_delay,
            self.config.on_change_cycle_time,
        );

        // Zero retries still makes one attempt
        let max_attempts = self.config.max_retries_for_initial_event.max(1);
        let mut failures = 0;
        loop {
            let sink = Arc::new(HandshakeSink::new(self.command_path.clone(), mailbox.clone()));
            let handle = self
                .connection
                .register_notification(&symbol, attributes, sink)
                .await
                .map_err(|e| self.connection_error(e))?;
            *registration = Some(handle);
            debug!("[CMD] {} notification {} registered ({:?})", self.command_path, handle, mode);

            if mode == TransmissionMode::Cyclic {
                return Ok(());
            }
            if mailbox.wait(self.config.max_wait_for_initial_event).await {
                return Ok(());
            }

            failures += 1;
            warn!(
                "[CMD] {}: no initial notification within {:?} ({}/{})",
                self.command_path,
                self.config.max_wait_for_initial_event,
                failures,
                max_attempts
            );

            *registration = None;
            self.connection
                .unregister_notification(handle)
                .await
                .map_err(|e| self.connection_error(e))?;

            if failures >= max_attempts {
                return Err(CommandError::RegistrationFailed {
                    path: self.command_path.clone(),
                    attempts: failures,
                });
            }
            self.transition(InvocationEvent::RegistrationRetry);
        }
    }

    /// Consume handshake changes until the controller reports an outcome
    async fn wait_for_completion(
        &self,
        mailbox: &NotificationMailbox,
        armed_at: Instant,
        cancel: &CancellationToken,
    ) -> Result<CommandChangeEvent, CommandError> {
        let timeout = self.config.timeout;
        let mut cancel_requested = false;

        loop {
            let remaining = timeout.saturating_sub(armed_at.elapsed());

            let event = tokio::select! {
                result = mailbox.get_or_wait(remaining) => match result {
                    Ok(event) => event,
                    Err(_) => {
                        let (progress, sub_task) = *self.last_progress.lock();
                        self.publish(CommandStateChanged {
                            command_path: self.command_path.clone(),
                            progress,
                            sub_task,
                            finished: false,
                            cancelled: false,
                            timed_out: true,
                        });
                        self.transition(InvocationEvent::WaitTimedOut);
                        return Err(CommandError::Timeout {
                            path: self.command_path.clone(),
                            timeout,
                        });
                    }
                },
                _ = cancel.cancelled(), if !cancel_requested => {
                    cancel_requested = true;
                    self.request_abort().await;
                    continue;
                }
            };

            let handshake = event.handshake;
            debug!(
                "[CMD] {} execute={} busy={} result={} progress={} sub_task={}",
                self.command_path,
                handshake.execute,
                handshake.busy,
                handshake.result_code,
                handshake.progress,
                handshake.sub_task
            );

            *self.last_progress.lock() = (handshake.progress, handshake.sub_task);
            self.publish(CommandStateChanged {
                command_path: self.command_path.clone(),
                progress: handshake.progress,
                sub_task: handshake.sub_task,
                finished: handshake.is_finished(),
                cancelled: handshake.is_cancelled_by_plc(),
                timed_out: false,
            });

            if handshake.is_terminal() {
                return self.interpret(event, cancel);
            }
        }
    }

    /// Turn a terminal handshake into the invocation result
    fn interpret(
        &self,
        event: CommandChangeEvent,
        cancel: &CancellationToken,
    ) -> Result<CommandChangeEvent, CommandError> {
        let handshake = event.handshake;

        // A controller dropping execute while busy is a cancel, whatever
        // the code says
        let code = if handshake.is_cancelled_by_plc() {
            ResultCode::Cancelled
        } else {
            ResultCode::from(handshake.result_code)
        };

        if code.is_success() {
            self.transition(InvocationEvent::ControllerFinished);
            return Ok(event);
        }

        if code == ResultCode::Cancelled {
            self.transition(InvocationEvent::ControllerCancelled);
            if cancel.is_cancelled() {
                info!("[CMD] {} cancelled on request", self.command_path);
                return Err(CommandError::Cancelled {
                    path: self.command_path.clone(),
                });
            }
        } else {
            self.transition(InvocationEvent::Failed);
        }

        Err(CommandError::ControllerReportedError {
            path: self.command_path.clone(),
            code: code.code(),
            message: self.translator.message(code.code()),
        })
    }

    /// Ask the controller to abort by dropping the execute flag
    async fn request_abort(&self) {
        info!("[CMD] {} cancel requested, resetting execute flag", self.command_path);
        let symbol = symbols::execute_flag(&self.command_path);
        if let Err(e) = self.connection.write_flag(&symbol, false).await {
            warn!("[CMD] {}: cancel request failed: {}", self.command_path, e);
        }
    }

    /// Remove the notification, reset the execute flag after failures
    ///
    /// Returns the reset failure, if resetting was attempted and failed.
    async fn cleanup(
        &self,
        registration: Option<NotificationHandle>,
        failed: bool,
    ) -> Option<ConnectionError> {
        if !self.state().is_outcome() {
            self.transition(InvocationEvent::Failed);
        }
        self.transition(InvocationEvent::CleanupStarted);

        if let Some(handle) = registration {
            if let Err(e) = self.connection.unregister_notification(handle).await {
                warn!(
                    "[CMD] {}: failed to remove notification {}: {}",
                    self.command_path, handle, e
                );
            }
        }

        let mut reset_failure = None;
        if failed {
            let symbol = symbols::execute_flag(&self.command_path);
            match self.connection.write_flag(&symbol, false).await {
                Ok(()) => debug!("[CMD] {} execute flag reset", self.command_path),
                Err(e) => {
                    error!(
                        "[CMD] {}: failed to reset execute flag: {}",
                        self.command_path, e
                    );
                    reset_failure = Some(e);
                }
            }
        }

        self.transition(InvocationEvent::CleanupComplete);
        reset_failure
    }

    /// Enter the Locked state for a new invocation
    fn begin(&self) {
        {
            let mut fsm = self.fsm.lock();
            if fsm.state() != InvocationState::Idle {
                warn!(
                    "[CMD] {}: previous invocation was abandoned in {:?}",
                    self.command_path,
                    fsm.state()
                );
                fsm.reset();
            }
        }
        *self.last_progress.lock() = (0, 0);
        self.transition(InvocationEvent::LockAcquired);
    }

    fn transition(&self, event: InvocationEvent) {
        let mut fsm = self.fsm.lock();
        let from = fsm.state();
        match fsm.process_event(event) {
            TransitionResult::Success(to) => {
                if from != to {
                    debug!("[CMD] {}: {:?} -> {:?}", self.command_path, from, to);
                }
            }
            TransitionResult::Invalid { from, event } => {
                warn!(
                    "[CMD] {}: invalid transition from {:?} on {:?}",
                    self.command_path, from, event
                );
            }
        }
    }

    fn publish(&self, change: CommandStateChanged) {
        self.observers
            .lock()
            .retain(|observer| observer.send(change.clone()).is_ok());
    }

    fn connection_error(&self, source: ConnectionError) -> CommandError {
        CommandError::Connection {
            path: self.command_path.clone(),
            source,
        }
    }
}
