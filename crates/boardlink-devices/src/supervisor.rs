/*!
 * Reconnection supervisor.
 *
 * Owns one logical device: a transport factory, the driver (fixed or found by
 * probing), and the live session. A single supervision task connects, watches
 * the session for loss (fault, close underneath, missed heartbeats), tears it
 * down in order and reconnects with exponential backoff. Consecutive failures
 * beyond the policy's limit park the supervisor in `PermanentlyFailed` until
 * [`ReconnectionSupervisor::reset`] is called.
 */
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use boardlink_core::event::{EventReceiver, SharedEventBus};
use boardlink_core::logging::device_span;
use boardlink_core::telemetry::{TelemetryRingBuffer, TelemetrySample};
use boardlink_core::types::{Id, Value};

use crate::backoff::{Backoff, ReconnectPolicy};
use crate::driver::DeviceDriver;
use crate::error::{DeviceError, Result};
use crate::registry::DriverRegistry;
use crate::session::{DeviceSession, SessionOptions, SessionState};
use crate::subscription::{Subscription, SubscriptionRegistry, ALL_STREAMS};
use crate::transport::TransportFactory;

/// Connection state of a supervised device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not supervising
    Idle,
    /// First connection in progress
    Connecting,
    /// Session ready
    Connected,
    /// Connection lost; retrying
    Reconnecting,
    /// Gave up; requires `reset`
    PermanentlyFailed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Published on the event bus on every connection-state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    /// Supervised device
    pub device_id: Id,
    /// State before the change
    pub previous: ConnectionState,
    /// State after the change
    pub current: ConnectionState,
    /// Consecutive failed attempts at the time of the change
    pub attempt: u32,
    /// When the change happened
    pub timestamp: DateTime<Utc>,
    /// Why, for losses and failures
    pub reason: Option<String>,
}

/// How the supervisor picks a driver for each new transport
#[derive(Debug, Clone)]
pub enum DriverSelection {
    /// Probe the registry's drivers in order
    Probe(Arc<DriverRegistry>),
    /// Always open with this driver
    Fixed(Arc<dyn DeviceDriver>),
}

/// Periodic liveness check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Endpoint invoked without arguments
    pub endpoint: String,
    /// Time between checks
    pub interval: Duration,
    /// Reply timeout of one check
    pub timeout: Duration,
    /// Consecutive misses treated as a lost connection
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            endpoint: "ping".to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_millis(1000),
            max_missed: 3,
        }
    }
}

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Device id kept across reconnects; generated when absent
    pub device_id: Option<Id>,
    /// Backoff and attempt limit
    pub reconnect: ReconnectPolicy,
    /// Heartbeat, disabled when `None`
    pub heartbeat: Option<HeartbeatConfig>,
    /// Options for every session opened
    pub session: SessionOptions,
    /// Capacity of the shared telemetry ring buffer
    pub telemetry_capacity: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            device_id: None,
            reconnect: ReconnectPolicy::default(),
            heartbeat: None,
            session: SessionOptions::default(),
            telemetry_capacity: boardlink_core::telemetry::MIN_CAPACITY,
        }
    }
}

impl SupervisorOptions {
    /// Use a fixed device id
    pub fn with_device_id(mut self, id: Id) -> Self {
        self.device_id = Some(id);
        self
    }

    /// Use `policy` for reconnection
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Enable the heartbeat
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct SupervisorInner {
    id: Id,
    factory: Arc<dyn TransportFactory>,
    selection: DriverSelection,
    options: SupervisorOptions,
    events: SharedEventBus,
    state: watch::Sender<ConnectionState>,
    failures: AtomicU32,
    session: Mutex<Option<DeviceSession>>,
    forward: Mutex<Option<Subscription>>,
    subscriptions: Arc<SubscriptionRegistry>,
    telemetry: Arc<TelemetryRingBuffer>,
}

/// Keeps one device connected
pub struct ReconnectionSupervisor {
    inner: Arc<SupervisorInner>,
    running: Mutex<Option<Running>>,
}

impl ReconnectionSupervisor {
    /// Create an idle supervisor; call [`start`](Self::start) to connect
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        selection: DriverSelection,
        options: SupervisorOptions,
        events: SharedEventBus,
    ) -> Self {
        let id = Id::or_generate(options.device_id.clone());
        let telemetry = Arc::new(TelemetryRingBuffer::new(options.telemetry_capacity));
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(SupervisorInner {
                id,
                factory,
                selection,
                options,
                events,
                state,
                failures: AtomicU32::new(0),
                session: Mutex::new(None),
                forward: Mutex::new(None),
                subscriptions: SubscriptionRegistry::new(),
                telemetry,
            }),
            running: Mutex::new(None),
        }
    }

    /// Device id, stable across reconnects
    pub fn id(&self) -> &Id {
        &self.inner.id
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch the connection state
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Event bus the supervisor publishes [`ConnectionEvent`]s on
    pub fn events(&self) -> &SharedEventBus {
        &self.inner.events
    }

    /// Receiver of this bus's connection events
    pub fn subscribe_events(&self) -> Result<EventReceiver<ConnectionEvent>> {
        Ok(self.inner.events.subscribe::<ConnectionEvent>()?)
    }

    /// Consecutive failed connection attempts
    pub fn failures(&self) -> u32 {
        self.inner.failures.load(Ordering::SeqCst)
    }

    /// Ring buffer fed by every session this supervisor opens
    pub fn telemetry(&self) -> &Arc<TelemetryRingBuffer> {
        &self.inner.telemetry
    }

    /// The live session, if connected
    pub fn session(&self) -> Option<DeviceSession> {
        self.inner.current_session()
    }

    /// Start supervising
    ///
    /// Fails with `AlreadyRunning` while a supervision task is alive and with
    /// `PermanentlyFailed` until [`reset`](Self::reset) after giving up.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state() == ConnectionState::PermanentlyFailed {
            return Err(DeviceError::PermanentlyFailed {
                attempts: self.failures(),
            });
        }
        if running.as_ref().map_or(false, |r| !r.handle.is_finished()) {
            return Err(DeviceError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        let span = device_span(self.inner.id.as_str(), "supervisor");
        let handle = tokio::spawn(supervise(self.inner.clone(), token.clone()).instrument(span));
        *running = Some(Running { token, handle });
        Ok(())
    }

    /// Stop supervising and close the session
    ///
    /// Returns to `Idle` unless the supervisor already gave up.
    pub async fn shutdown(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(Running { token, handle }) = running {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Supervisor {} task ended abnormally: {}", self.inner.id, e);
            }
        }
        self.inner.teardown().await;
        if self.state() != ConnectionState::PermanentlyFailed {
            self.inner.transition(ConnectionState::Idle, None);
        }
    }

    /// Leave `PermanentlyFailed` for `Idle` so the supervisor can be started again
    pub fn reset(&self) {
        if self.state() == ConnectionState::PermanentlyFailed {
            self.inner.failures.store(0, Ordering::SeqCst);
            self.inner.transition(ConnectionState::Idle, Some("reset".to_string()));
        }
    }

    /// Invoke `endpoint` on the live session with the default timeout
    pub async fn invoke(&self, endpoint: &str, args: &[Value]) -> Result<Value> {
        let session = self.inner.current_session().ok_or(DeviceError::NotConnected)?;
        session.call(endpoint, args).await
    }

    /// Invoke `endpoint` on the live session with an explicit timeout
    pub async fn invoke_with_timeout(
        &self,
        endpoint: &str,
        args: &[Value],
        timeout: Duration,
    ) -> Result<Value> {
        let session = self.inner.current_session().ok_or(DeviceError::NotConnected)?;
        session.invoke(endpoint, args, timeout).await
    }

    /// Subscribe to `stream` across reconnects
    pub fn subscribe<F>(&self, stream: &str, handler: F) -> Subscription
    where
        F: Fn(&TelemetrySample) + Send + Sync + 'static,
    {
        self.inner.subscriptions.subscribe(stream, handler)
    }
}

impl fmt::Debug for ReconnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectionSupervisor")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("factory", &self.inner.factory)
            .finish()
    }
}

impl Drop for ReconnectionSupervisor {
    fn drop(&mut self) {
        // the task closes the session on its way out
        if let Some(running) = self.running.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            running.token.cancel();
        }
    }
}

impl SupervisorInner {
    fn current_session(&self) -> Option<DeviceSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn transition(&self, next: ConnectionState, reason: Option<String>) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        let attempt = self.failures.load(Ordering::SeqCst);
        match &reason {
            Some(reason) => info!("Device {} {} -> {}: {}", self.id, previous, next, reason),
            None => info!("Device {} {} -> {}", self.id, previous, next),
        }
        let event = ConnectionEvent {
            device_id: self.id.clone(),
            previous,
            current: next,
            attempt,
            timestamp: Utc::now(),
            reason,
        };
        if let Err(e) = self.events.publish(event) {
            warn!("Failed to publish connection event for {}: {}", self.id, e);
        }
    }

    /// Connect, identify and open; the transport is released on failure
    async fn establish(&self) -> Result<DeviceSession> {
        let transport = self.factory.create().await?;
        let options = self
            .options
            .session
            .clone()
            .with_device_id(self.id.clone())
            .with_telemetry(self.telemetry.clone());

        let opened = match &self.selection {
            DriverSelection::Probe(registry) => registry
                .probe_and_open(transport.clone(), options)
                .await
                .map(|(_, session)| session),
            DriverSelection::Fixed(driver) => {
                let timeout = driver.descriptor().timeouts.open;
                driver.open(transport.clone(), options, timeout).await
            }
        };
        if opened.is_err() {
            transport.cleanup_resources().await;
            if let Err(e) = transport.disconnect().await {
                debug!("Disconnect after failed open of {}: {}", self.id, e);
            }
        }
        opened
    }

    fn install(&self, session: DeviceSession) {
        let registry = self.subscriptions.clone();
        let forward = session.subscribe(ALL_STREAMS, move |sample| {
            registry.dispatch(sample);
        });
        *self.forward.lock().unwrap_or_else(PoisonError::into_inner) = Some(forward);
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    /// Close the live session, if any
    async fn teardown(&self) {
        let session = self.session.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(forward) = self.forward.lock().unwrap_or_else(PoisonError::into_inner).take() {
            forward.unsubscribe();
        }
        if let Some(session) = session {
            session.close().await;
        }
    }
}

async fn supervise(inner: Arc<SupervisorInner>, token: CancellationToken) {
    let mut backoff = Backoff::new(inner.options.reconnect.clone());
    inner.failures.store(0, Ordering::SeqCst);
    inner.transition(ConnectionState::Connecting, None);

    loop {
        // an attempt runs to completion so a half-opened transport is always released
        let attempt = inner.establish().await;
        if token.is_cancelled() {
            if let Ok(session) = attempt {
                session.close().await;
            }
            break;
        }

        match attempt {
            Ok(session) => {
                backoff.reset();
                inner.failures.store(0, Ordering::SeqCst);
                let heartbeat = start_heartbeat(&inner, &session);
                inner.install(session.clone());
                inner.transition(ConnectionState::Connected, None);

                let lost = tokio::select! {
                    _ = token.cancelled() => None,
                    reason = wait_for_loss(&session, heartbeat) => Some(reason),
                };
                match lost {
                    Some(reason) => {
                        inner.transition(ConnectionState::Reconnecting, Some(reason));
                        inner.teardown().await;
                    }
                    None => {
                        inner.teardown().await;
                        break;
                    }
                }
            }
            Err(e) => {
                let failures = inner.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if inner.options.reconnect.exhausted(failures) {
                    inner.transition(
                        ConnectionState::PermanentlyFailed,
                        Some(format!("giving up after {} attempts: {}", failures, e)),
                    );
                    return;
                }
                warn!("Connection attempt {} for {} failed: {}", failures, inner.id, e);
            }
        }

        let delay = backoff.next_delay();
        debug!("Next attempt for {} in {:?}", inner.id, delay);
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    if *inner.state.borrow() != ConnectionState::PermanentlyFailed {
        inner.transition(ConnectionState::Idle, None);
    }
}

/// Resolves with a reason once the session is lost or the heartbeat gives up
async fn wait_for_loss(session: &DeviceSession, heartbeat: Option<oneshot::Receiver<String>>) -> String {
    let mut state = session.watch_state();
    let ended = async {
        loop {
            let current = *state.borrow_and_update();
            match current {
                SessionState::Faulted => {
                    return session
                        .fault_reason()
                        .unwrap_or_else(|| "session faulted".to_string())
                }
                SessionState::Closing | SessionState::Closed => {
                    return "session closed".to_string()
                }
                SessionState::Opening | SessionState::Ready => {}
            }
            if state.changed().await.is_err() {
                return "session dropped".to_string();
            }
        }
    };

    match heartbeat {
        Some(missed) => tokio::select! {
            reason = ended => reason,
            Ok(reason) = missed => reason,
        },
        None => ended.await,
    }
}

/// Spawn the heartbeat on the session's transport so cleanup cancels it
fn start_heartbeat(
    inner: &SupervisorInner,
    session: &DeviceSession,
) -> Option<oneshot::Receiver<String>> {
    let config = inner.options.heartbeat.clone()?;
    let (missed_tx, missed_rx) = oneshot::channel();
    let span = device_span(inner.id.as_str(), session.driver());
    let handle = tokio::spawn(heartbeat(session.clone(), config, missed_tx).instrument(span));
    session.transport().core().attach(handle);
    Some(missed_rx)
}

async fn heartbeat(session: DeviceSession, config: HeartbeatConfig, lost: oneshot::Sender<String>) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    let mut missed = 0u32;
    loop {
        ticker.tick().await;
        match session.invoke(&config.endpoint, &[], config.timeout).await {
            Ok(_) | Err(DeviceError::Rejected(_)) => missed = 0,
            Err(e) => {
                missed += 1;
                warn!("Heartbeat {} of {} missed: {}", missed, config.max_missed, e);
                if missed >= config.max_missed {
                    let _ = lost.send(format!("heartbeat missed {} times", missed));
                    return;
                }
            }
        }
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::drivers::ArduinoDriver;
    use crate::transport::{MockFactory, MockTransport};
    use test_log::test;
    use tokio::sync::broadcast;

    fn arduino_script(mock: &MockTransport) {
        mock.respond("ID?\n", "ARDUINO UNO R3\n");
        mock.respond("INIT\n", "READY\n");
        mock.respond("CMD:digitalRead:7\n", "OK:1\n");
        mock.respond("CMD:ping:\n", "OK\n");
    }

    fn supervisor(factory: Arc<MockFactory>, options: SupervisorOptions) -> ReconnectionSupervisor {
        ReconnectionSupervisor::new(
            factory,
            DriverSelection::Probe(Arc::new(DriverRegistry::with_builtin_drivers())),
            options.with_device_id(Id::from_string("bench")),
            SharedEventBus::new(),
        )
    }

    async fn wait_for_state(supervisor: &ReconnectionSupervisor, wanted: ConnectionState) {
        let mut state = supervisor.watch_state();
        state.wait_for(|s| *s == wanted).await.unwrap();
    }

    async fn next_transition(events: &mut broadcast::Receiver<ConnectionEvent>) -> (ConnectionState, ConnectionState) {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("no connection event")
            .unwrap();
        (event.previous, event.current)
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_gives_up_after_max_attempts() {
        let factory = Arc::new(MockFactory::new("dead", arduino_script));
        factory.fail_always();
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::default()
        };
        let supervisor = supervisor(factory.clone(), SupervisorOptions::default().with_reconnect(policy));

        supervisor.start().unwrap();
        wait_for_state(&supervisor, ConnectionState::PermanentlyFailed).await;
        assert_eq!(supervisor.failures(), 3);
        assert!(factory.created().is_empty());
        assert!(matches!(
            supervisor.start(),
            Err(DeviceError::PermanentlyFailed { attempts: 3 })
        ));
        assert!(matches!(
            supervisor.invoke("digitalRead", &[Value::from(7)]).await,
            Err(DeviceError::NotConnected)
        ));

        supervisor.reset();
        assert_eq!(supervisor.state(), ConnectionState::Idle);
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_reconnects_after_hang_up() {
        let factory = Arc::new(MockFactory::new("uno", arduino_script));
        let supervisor = supervisor(factory.clone(), SupervisorOptions::default());
        let mut events = supervisor.subscribe_events().unwrap();

        supervisor.start().unwrap();
        assert_eq!(next_transition(&mut events).await, (ConnectionState::Idle, ConnectionState::Connecting));
        assert_eq!(next_transition(&mut events).await, (ConnectionState::Connecting, ConnectionState::Connected));
        let first = supervisor.session().unwrap();

        factory.last().unwrap().hang_up();
        assert_eq!(next_transition(&mut events).await, (ConnectionState::Connected, ConnectionState::Reconnecting));
        assert_eq!(next_transition(&mut events).await, (ConnectionState::Reconnecting, ConnectionState::Connected));

        assert_eq!(factory.created().len(), 2);
        assert_eq!(first.state(), SessionState::Closed);
        let second = supervisor.session().unwrap();
        assert_eq!(second.id(), first.id());
        assert_eq!(supervisor.failures(), 0);

        supervisor.shutdown().await;
        assert_eq!(supervisor.state(), ConnectionState::Idle);
        assert_eq!(second.state(), SessionState::Closed);
        assert_eq!(factory.created()[1].active_tasks(), 0);
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_start_twice_is_rejected() {
        let factory = Arc::new(MockFactory::new("uno", arduino_script));
        let supervisor = supervisor(factory, SupervisorOptions::default());
        supervisor.start().unwrap();
        assert!(matches!(supervisor.start(), Err(DeviceError::AlreadyRunning)));
        supervisor.shutdown().await;
        // a stopped supervisor can be started again
        supervisor.start().unwrap();
        supervisor.shutdown().await;
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_invoke_and_telemetry_survive_reconnect() {
        let factory = Arc::new(MockFactory::new("uno", arduino_script));
        let supervisor = supervisor(factory.clone(), SupervisorOptions::default());
        assert!(matches!(
            supervisor.invoke("digitalRead", &[Value::from(7)]).await,
            Err(DeviceError::NotConnected)
        ));

        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        let _subscription = supervisor.subscribe("temp", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        supervisor.start().unwrap();
        wait_for_state(&supervisor, ConnectionState::Connected).await;
        let value = supervisor.invoke("digitalRead", &[Value::from(7)]).await.unwrap();
        assert_eq!(value, Value::Integer(1));

        factory.last().unwrap().inject("TLM:temp:21.5\n");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let mut state = supervisor.watch_state();
        factory.last().unwrap().hang_up();
        state.wait_for(|s| *s == ConnectionState::Reconnecting).await.unwrap();
        state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();

        factory.last().unwrap().inject("TLM:temp:22.0\n");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.telemetry().len(), 2);

        supervisor.shutdown().await;
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_missed_heartbeats_trigger_reconnect() {
        let factory = Arc::new(MockFactory::new("mute", |mock: &MockTransport| {
            mock.respond("ID?\n", "ARDUINO UNO R3\n");
            mock.respond("INIT\n", "READY\n");
        }));
        let heartbeat = HeartbeatConfig {
            endpoint: "ping".to_string(),
            interval: Duration::from_millis(500),
            timeout: Duration::from_millis(200),
            max_missed: 2,
        };
        let supervisor = supervisor(factory.clone(), SupervisorOptions::default().with_heartbeat(heartbeat));
        let mut events = supervisor.subscribe_events().unwrap();

        supervisor.start().unwrap();
        let mut reason = None;
        while reason.is_none() {
            let event = events.recv().await.unwrap();
            if event.current == ConnectionState::Reconnecting {
                reason = event.reason;
            }
        }
        assert!(reason.unwrap().contains("heartbeat"));
        let pings = factory.created()[0]
            .written()
            .iter()
            .filter(|w| w.as_ref() == b"CMD:ping:\n")
            .count();
        assert_eq!(pings, 2);

        supervisor.shutdown().await;
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_fixed_driver_selection() {
        let factory = Arc::new(MockFactory::new("uno", arduino_script));
        let supervisor = ReconnectionSupervisor::new(
            factory.clone(),
            DriverSelection::Fixed(Arc::new(ArduinoDriver::new())),
            SupervisorOptions::default(),
            SharedEventBus::new(),
        );
        supervisor.start().unwrap();
        wait_for_state(&supervisor, ConnectionState::Connected).await;
        // no probe when the driver is fixed
        assert_eq!(&factory.last().unwrap().written()[0][..], b"INIT\n");
        supervisor.shutdown().await;
    }
}
