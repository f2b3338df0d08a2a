//! In-process controller simulation
//!
//! Implements [`DeviceConnection`] against a symbol table held in memory.
//! Commands registered with [`SimulatedPlc::add_command`] get a handshake
//! structure and react to their execute flag according to a
//! [`CommandBehaviour`].

use super::traits::{
    ConnectionError, DeviceConnection, NotificationAttributes, NotificationHandle,
    NotificationSink, TransmissionMode,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use plc_command_shared::{handshake::HANDSHAKE_SIZE, now, symbols, HandshakeSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// How a simulated command reacts to its execute flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBehaviour {
    /// Nothing happens on its own; the handshake is driven with `set_handshake`
    Manual,
    /// Walks progress to 100 in `steps` steps, then finishes with `result_code`.
    /// Dropping the execute flag while busy aborts with result code 3.
    Completes {
        steps: u8,
        step_interval: Duration,
        result_code: u16,
    },
    /// Raises busy and then stops servicing the handshake; later execute
    /// flag writes are recorded but never reach the handshake
    Hangs,
}

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatedPlcConfig {
    /// Address reported by the connection
    pub address: String,
    /// Number of initial on-change deliveries to drop after registration,
    /// reproducing backends that lose the first notification
    pub swallow_initial_events: u32,
}

impl Default for SimulatedPlcConfig {
    fn default() -> Self {
        Self {
            address: "192.168.0.10.1.1:851".into(),
            swallow_initial_events: 0,
        }
    }
}

/// Record of one flag write received by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagWrite {
    pub symbol: String,
    pub value: bool,
    /// Notifications registered at the time of the write
    pub active_subscriptions: usize,
}

struct Subscription {
    symbol: String,
    attributes: NotificationAttributes,
    sink: Arc<dyn NotificationSink>,
    last: Option<Bytes>,
    cyclic_task: Option<JoinHandle<()>>,
}

struct CommandEntry {
    behaviour: CommandBehaviour,
    program: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct PlcState {
    connected: bool,
    values: HashMap<String, Bytes>,
    commands: HashMap<String, CommandEntry>,
    /// execute flag symbol -> command path
    execute_flags: HashMap<String, String>,
    subscriptions: HashMap<NotificationHandle, Subscription>,
    next_handle: NotificationHandle,
    swallow_remaining: u32,
    registrations: u32,
    flag_writes: Vec<FlagWrite>,
    /// One-shot write failures by symbol
    faults: HashMap<String, ConnectionError>,
    flag_watchers: Vec<mpsc::UnboundedSender<FlagWrite>>,
}

type Delivery = (Arc<dyn NotificationSink>, Bytes);

struct Shared {
    config: SimulatedPlcConfig,
    state: Mutex<PlcState>,
}

/// A simulated controller reachable through [`DeviceConnection`]
#[derive(Clone)]
pub struct SimulatedPlc {
    shared: Arc<Shared>,
}

impl SimulatedPlc {
    pub fn new(config: SimulatedPlcConfig) -> Self {
        let state = PlcState {
            connected: true,
            swallow_remaining: config.swallow_initial_events,
            next_handle: 1,
            ..Default::default()
        };

        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
            }),
        }
    }

    /// Declare a command and its handshake structure
    pub fn add_command(&self, path: &str, behaviour: CommandBehaviour) {
        let idle = encode(&HandshakeSnapshot::idle());
        let mut state = self.shared.state.lock();
        state.values.insert(symbols::handshake(path), idle);
        state
            .execute_flags
            .insert(symbols::execute_flag(path), path.to_string());
        state.commands.insert(
            path.to_string(),
            CommandEntry {
                behaviour,
                program: None,
            },
        );
    }

    /// Declare a plain symbol with a fixed size
    pub fn add_symbol(&self, symbol: &str, initial: Bytes) {
        self.shared
            .state
            .lock()
            .values
            .insert(symbol.to_string(), initial);
    }

    /// Current raw value of a symbol
    pub fn value(&self, symbol: &str) -> Option<Bytes> {
        self.shared.state.lock().values.get(symbol).cloned()
    }

    pub fn set_connected(&self, connected: bool) {
        self.shared.state.lock().connected = connected;
    }

    /// Current handshake of a command
    pub fn handshake(&self, path: &str) -> Option<HandshakeSnapshot> {
        let raw = self.value(&symbols::handshake(path))?;
        HandshakeSnapshot::decode(&raw).ok()
    }

    /// Overwrite the handshake of a command as the controller program would
    pub fn set_handshake(&self, path: &str, handshake: HandshakeSnapshot) {
        self.shared.set_handshake(path, handshake);
    }

    /// Fail the next write to `symbol` with `error`
    pub fn inject_fault(&self, symbol: &str, error: ConnectionError) {
        self.shared
            .state
            .lock()
            .faults
            .insert(symbol.to_string(), error);
    }

    /// All flag writes received so far
    pub fn flag_writes(&self) -> Vec<FlagWrite> {
        self.shared.state.lock().flag_writes.clone()
    }

    /// Receive every future flag write
    pub fn subscribe_flag_writes(&self) -> mpsc::UnboundedReceiver<FlagWrite> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.state.lock().flag_watchers.push(tx);
        rx
    }

    /// Number of notifications currently registered
    pub fn active_subscriptions(&self) -> usize {
        self.shared.state.lock().subscriptions.len()
    }

    /// Number of registrations ever made
    pub fn registrations(&self) -> u32 {
        self.shared.state.lock().registrations
    }

    fn take_fault(&self, state: &mut PlcState, symbol: &str) -> Result<(), ConnectionError> {
        match state.faults.remove(symbol) {
            Some(error) => {
                warn!("[PLC] Injected fault on {}: {}", symbol, error);
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn ensure_connected(&self, state: &PlcState) -> Result<(), ConnectionError> {
        if state.connected {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected(self.shared.config.address.clone()))
        }
    }

    /// Write the execute flag into the handshake and let the command react
    fn apply_execute(&self, state: &mut PlcState, path: &str, value: bool) -> Vec<Delivery> {
        let mut handshake = self.shared.handshake_locked(state, path);
        let behaviour = state
            .commands
            .get(path)
            .map(|entry| entry.behaviour)
            .unwrap_or(CommandBehaviour::Manual);

        // A hung command no longer services its handshake
        if behaviour == CommandBehaviour::Hangs && handshake.busy {
            debug!("[PLC] {} is not responding", path);
            return Vec::new();
        }

        handshake.execute = value;
        let mut deliveries = self.shared.store_handshake(state, path, handshake);
        deliveries.extend(self.run_behaviour(state, path, value));
        deliveries
    }

    /// React to a rising or falling execute flag
    fn run_behaviour(&self, state: &mut PlcState, path: &str, value: bool) -> Vec<Delivery> {
        let Some(entry) = state.commands.get_mut(path) else {
            return Vec::new();
        };
        let behaviour = entry.behaviour;
        let was_running = entry
            .program
            .as_ref()
            .is_some_and(|program| !program.is_finished());

        match (behaviour, value) {
            (CommandBehaviour::Completes { steps, step_interval, result_code }, true) => {
                if let Some(program) = entry.program.take() {
                    program.abort();
                }
                let shared = self.shared.clone();
                let path_owned = path.to_string();
                entry.program = Some(tokio::spawn(async move {
                    run_program(shared, path_owned, steps, step_interval, result_code).await;
                }));
                self.shared
                    .store_handshake(state, path, HandshakeSnapshot::running(0))
            }
            (CommandBehaviour::Completes { .. }, false) if was_running => {
                if let Some(program) = entry.program.take() {
                    program.abort();
                }
                let current = self.shared.handshake_locked(state, path);
                info!("[PLC] {} aborted on request", path);
                let aborted = HandshakeSnapshot {
                    execute: false,
                    busy: false,
                    result_code: 3,
                    progress: current.progress,
                    sub_task: current.sub_task,
                };
                self.shared.store_handshake(state, path, aborted)
            }
            (CommandBehaviour::Hangs, true) => {
                self.shared
                    .store_handshake(state, path, HandshakeSnapshot::running(0))
            }
            _ => Vec::new(),
        }
    }
}

impl Default for SimulatedPlc {
    fn default() -> Self {
        Self::new(SimulatedPlcConfig::default())
    }
}

impl Shared {
    fn handshake_locked(&self, state: &PlcState, path: &str) -> HandshakeSnapshot {
        state
            .values
            .get(&symbols::handshake(path))
            .and_then(|raw| HandshakeSnapshot::decode(raw).ok())
            .unwrap_or_default()
    }

    fn set_handshake(&self, path: &str, handshake: HandshakeSnapshot) {
        let deliveries = {
            let mut state = self.state.lock();
            self.store_handshake(&mut state, path, handshake)
        };
        deliver(deliveries);
    }

    fn store_handshake(
        &self,
        state: &mut PlcState,
        path: &str,
        handshake: HandshakeSnapshot,
    ) -> Vec<Delivery> {
        self.store(state, &symbols::handshake(path), encode(&handshake))
    }

    /// Store a value and collect on-change deliveries for it
    fn store(&self, state: &mut PlcState, symbol: &str, data: Bytes) -> Vec<Delivery> {
        state.values.insert(symbol.to_string(), data.clone());

        let mut deliveries = Vec::new();
        for sub in state.subscriptions.values_mut() {
            if sub.symbol != symbol || sub.attributes.mode != TransmissionMode::OnChange {
                continue;
            }
            if sub.last.as_ref() == Some(&data) {
                continue;
            }
            sub.last = Some(data.clone());
            deliveries.push((sub.sink.clone(), data.clone()));
        }
        deliveries
    }
}

fn encode(handshake: &HandshakeSnapshot) -> Bytes {
    handshake
        .encode()
        .unwrap_or_else(|_| Bytes::from_static(&[0; HANDSHAKE_SIZE]))
}

fn deliver(deliveries: Vec<Delivery>) {
    if deliveries.is_empty() {
        return;
    }
    let timestamp = now();
    for (sink, data) in deliveries {
        sink.deliver(timestamp, &data);
    }
}

/// Controller-side program of a `Completes` command
async fn run_program(
    shared: Arc<Shared>,
    path: String,
    steps: u8,
    step_interval: Duration,
    result_code: u16,
) {
    let steps = steps.max(1);
    for step in 1..=steps {
        tokio::time::sleep(step_interval).await;
        let progress = ((step as u32 * 100) / steps as u32) as u8;
        if step < steps {
            shared.set_handshake(
                &path,
                HandshakeSnapshot::running(progress).with_sub_task(step as u16),
            );
        }
    }

    debug!("[PLC] {} finished with code {}", path, result_code);
    shared.set_handshake(&path, HandshakeSnapshot::finished(result_code));
}

#[async_trait]
impl DeviceConnection for SimulatedPlc {
    fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    fn address(&self) -> String {
        self.shared.config.address.clone()
    }

    async fn read_flag(&self, symbol: &str) -> Result<bool, ConnectionError> {
        let state = self.shared.state.lock();
        self.ensure_connected(&state)?;

        if let Some(path) = state.execute_flags.get(symbol) {
            return Ok(self.shared.handshake_locked(&state, path).execute);
        }

        match state.values.get(symbol) {
            Some(data) if data.len() == 1 => Ok(data[0] != 0),
            Some(data) => Err(ConnectionError::SizeMismatch {
                symbol: symbol.to_string(),
                expected: 1,
                actual: data.len(),
            }),
            None => Err(ConnectionError::SymbolNotFound(symbol.to_string())),
        }
    }

    async fn write_flag(&self, symbol: &str, value: bool) -> Result<(), ConnectionError> {
        let deliveries = {
            let mut state = self.shared.state.lock();
            self.ensure_connected(&state)?;
            self.take_fault(&mut state, symbol)?;

            let record = FlagWrite {
                symbol: symbol.to_string(),
                value,
                active_subscriptions: state.subscriptions.len(),
            };

            let deliveries = if let Some(path) = state.execute_flags.get(symbol).cloned() {
                self.apply_execute(&mut state, &path, value)
            } else if state.values.contains_key(symbol) {
                self.shared
                    .store(&mut state, symbol, Bytes::from(vec![value as u8]))
            } else {
                return Err(ConnectionError::SymbolNotFound(symbol.to_string()));
            };

            debug!("[PLC] {} <- {}", symbol, value);
            state.flag_writes.push(record.clone());
            state
                .flag_watchers
                .retain(|watcher| watcher.send(record.clone()).is_ok());
            deliveries
        };

        deliver(deliveries);
        Ok(())
    }

    async fn read_value(&self, symbol: &str) -> Result<Bytes, ConnectionError> {
        let state = self.shared.state.lock();
        self.ensure_connected(&state)?;
        state
            .values
            .get(symbol)
            .cloned()
            .ok_or_else(|| ConnectionError::SymbolNotFound(symbol.to_string()))
    }

    async fn write_value(&self, symbol: &str, data: Bytes) -> Result<(), ConnectionError> {
        let deliveries = {
            let mut state = self.shared.state.lock();
            self.ensure_connected(&state)?;
            self.take_fault(&mut state, symbol)?;

            let size = state
                .values
                .get(symbol)
                .map(|existing| existing.len())
                .ok_or_else(|| ConnectionError::SymbolNotFound(symbol.to_string()))?;

            if data.len() > size {
                return Err(ConnectionError::SizeMismatch {
                    symbol: symbol.to_string(),
                    expected: size,
                    actual: data.len(),
                });
            }

            // Short writes leave the rest of the symbol zeroed
            let mut padded = data.to_vec();
            padded.resize(size, 0);
            self.shared.store(&mut state, symbol, Bytes::from(padded))
        };

        deliver(deliveries);
        Ok(())
    }

    async fn register_notification(
        &self,
        symbol: &str,
        attributes: NotificationAttributes,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<NotificationHandle, ConnectionError> {
        let (handle, initial) = {
            let mut state = self.shared.state.lock();
            self.ensure_connected(&state)?;

            let current = state
                .values
                .get(symbol)
                .cloned()
                .ok_or_else(|| ConnectionError::SymbolNotFound(symbol.to_string()))?;

            let handle = state.next_handle;
            state.next_handle += 1;
            state.registrations += 1;

            let mut initial = None;
            let cyclic_task = match attributes.mode {
                TransmissionMode::Cyclic => {
                    let shared = self.shared.clone();
                    let sink = sink.clone();
                    let symbol = symbol.to_string();
                    let period = attributes.cycle_time.max(Duration::from_millis(1));
                    Some(tokio::spawn(async move {
                        let mut ticker = interval(period);
                        loop {
                            ticker.tick().await;
                            let data = shared.state.lock().values.get(&symbol).cloned();
                            if let Some(data) = data {
                                sink.deliver(now(), &data);
                            }
                        }
                    }))
                }
                TransmissionMode::OnChange => {
                    if state.swallow_remaining > 0 {
                        state.swallow_remaining -= 1;
                        warn!("[PLC] Dropping initial notification for {}", symbol);
                    } else {
                        initial = Some(current.clone());
                    }
                    None
                }
            };

            state.subscriptions.insert(
                handle,
                Subscription {
                    symbol: symbol.to_string(),
                    attributes,
                    sink: sink.clone(),
                    last: Some(current),
                    cyclic_task,
                },
            );

            (handle, initial)
        };

        if let Some(data) = initial {
            sink.deliver(now(), &data);
        }
        Ok(handle)
    }

    async fn unregister_notification(&self, handle: NotificationHandle) -> Result<(), ConnectionError> {
        let mut state = self.shared.state.lock();
        let sub = state
            .subscriptions
            .remove(&handle)
            .ok_or(ConnectionError::InvalidHandle(handle))?;
        if let Some(task) = sub.cyclic_task {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<HandshakeSnapshot>>,
    }

    impl NotificationSink for Recorder {
        fn deliver(&self, _timestamp: DateTime<Utc>, raw: &[u8]) {
            if let Ok(hs) = HandshakeSnapshot::decode(raw) {
                self.received.lock().push(hs);
            }
        }
    }

    fn on_change() -> NotificationAttributes {
        NotificationAttributes::new(
            HANDSHAKE_SIZE,
            TransmissionMode::OnChange,
            Duration::ZERO,
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_unknown_symbol() {
        let plc = SimulatedPlc::default();
        let result = plc.write_flag("MAIN.fbMissing.stHandshake.bExecute", true).await;
        assert!(matches!(result, Err(ConnectionError::SymbolNotFound(_))));
    }

    #[tokio::test]
    async fn test_disconnected() {
        let plc = SimulatedPlc::default();
        plc.add_command("MAIN.fbHome", CommandBehaviour::Manual);
        plc.set_connected(false);

        assert!(!plc.is_connected());
        let result = plc.read_flag("MAIN.fbHome.stHandshake.bExecute").await;
        assert!(matches!(result, Err(ConnectionError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_on_change_delivery() {
        let plc = SimulatedPlc::default();
        plc.add_command("MAIN.fbHome", CommandBehaviour::Manual);
        let recorder = Arc::new(Recorder::default());

        let handle = plc
            .register_notification("MAIN.fbHome.stHandshake", on_change(), recorder.clone())
            .await
            .unwrap();

        // Initial value, then one per change; identical bytes are not repeated
        plc.set_handshake("MAIN.fbHome", HandshakeSnapshot::running(10));
        plc.set_handshake("MAIN.fbHome", HandshakeSnapshot::running(10));
        plc.set_handshake("MAIN.fbHome", HandshakeSnapshot::finished(2));

        let received = recorder.received.lock().clone();
        assert_eq!(
            received,
            vec![
                HandshakeSnapshot::idle(),
                HandshakeSnapshot::running(10),
                HandshakeSnapshot::finished(2),
            ]
        );

        plc.unregister_notification(handle).await.unwrap();
        assert_eq!(plc.active_subscriptions(), 0);
        assert!(matches!(
            plc.unregister_notification(handle).await,
            Err(ConnectionError::InvalidHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_swallowed_initial_event() {
        let plc = SimulatedPlc::new(SimulatedPlcConfig {
            swallow_initial_events: 1,
            ..Default::default()
        });
        plc.add_command("MAIN.fbHome", CommandBehaviour::Manual);
        let recorder = Arc::new(Recorder::default());

        plc.register_notification("MAIN.fbHome.stHandshake", on_change(), recorder.clone())
            .await
            .unwrap();
        assert!(recorder.received.lock().is_empty());

        plc.register_notification("MAIN.fbHome.stHandshake", on_change(), recorder.clone())
            .await
            .unwrap();
        assert_eq!(recorder.received.lock().len(), 1);
        assert_eq!(plc.registrations(), 2);
    }

    #[tokio::test]
    async fn test_completing_command() {
        let plc = SimulatedPlc::default();
        plc.add_command(
            "MAIN.fbHome",
            CommandBehaviour::Completes {
                steps: 2,
                step_interval: Duration::from_millis(5),
                result_code: 2,
            },
        );

        plc.write_flag("MAIN.fbHome.stHandshake.bExecute", true)
            .await
            .unwrap();
        assert_eq!(plc.handshake("MAIN.fbHome"), Some(HandshakeSnapshot::running(0)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let hs = plc.handshake("MAIN.fbHome").unwrap();
        assert!(hs.is_finished());
        assert_eq!(hs.result_code, 2);
        assert_eq!(hs.progress, 100);
    }

    #[tokio::test]
    async fn test_abort_on_falling_execute() {
        let plc = SimulatedPlc::default();
        plc.add_command(
            "MAIN.fbHome",
            CommandBehaviour::Completes {
                steps: 10,
                step_interval: Duration::from_secs(1),
                result_code: 0,
            },
        );
        let mut writes = plc.subscribe_flag_writes();

        plc.write_flag("MAIN.fbHome.stHandshake.bExecute", true)
            .await
            .unwrap();
        plc.write_flag("MAIN.fbHome.stHandshake.bExecute", false)
            .await
            .unwrap();

        let hs = plc.handshake("MAIN.fbHome").unwrap();
        assert!(hs.is_cancelled_by_plc());
        assert_eq!(hs.result_code, 3);

        assert!(writes.recv().await.unwrap().value);
        assert!(!writes.recv().await.unwrap().value);
        assert_eq!(plc.flag_writes().len(), 2);
    }

    #[tokio::test]
    async fn test_cyclic_delivery() {
        let plc = SimulatedPlc::default();
        plc.add_command("MAIN.fbHome", CommandBehaviour::Manual);
        let recorder = Arc::new(Recorder::default());

        let attributes = NotificationAttributes::new(
            HANDSHAKE_SIZE,
            TransmissionMode::Cyclic,
            Duration::ZERO,
            Duration::from_millis(5),
        );
        let handle = plc
            .register_notification("MAIN.fbHome.stHandshake", attributes, recorder.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        plc.unregister_notification(handle).await.unwrap();

        // Same value delivered repeatedly
        let received = recorder.received.lock().clone();
        assert!(received.len() >= 2);
        assert!(received.iter().all(|hs| *hs == HandshakeSnapshot::idle()));
    }

    #[tokio::test]
    async fn test_injected_fault_fails_once() {
        let plc = SimulatedPlc::default();
        plc.add_command("MAIN.fbHome", CommandBehaviour::Manual);
        let fault = ConnectionError::Device {
            code: 1861,
            message: "timeout elapsed".into(),
        };
        plc.inject_fault("MAIN.fbHome.stHandshake.bExecute", fault.clone());

        let first = plc.write_flag("MAIN.fbHome.stHandshake.bExecute", true).await;
        assert_eq!(first, Err(fault));
        assert!(plc.flag_writes().is_empty());

        plc.write_flag("MAIN.fbHome.stHandshake.bExecute", true)
            .await
            .unwrap();
        assert_eq!(plc.flag_writes().len(), 1);
    }

    #[tokio::test]
    async fn test_value_symbols() {
        let plc = SimulatedPlc::default();
        plc.add_symbol("MAIN.fbMove.stInput.nTarget", Bytes::from_static(&[0; 4]));

        plc.write_value("MAIN.fbMove.stInput.nTarget", Bytes::from_static(&[1, 2]))
            .await
            .unwrap();
        assert_eq!(
            plc.read_value("MAIN.fbMove.stInput.nTarget").await.unwrap(),
            Bytes::from_static(&[1, 2, 0, 0])
        );

        let too_long = plc
            .write_value("MAIN.fbMove.stInput.nTarget", Bytes::from_static(&[0; 8]))
            .await;
        assert!(matches!(too_long, Err(ConnectionError::SizeMismatch { .. })));
    }
}
