/*!
 * Byte-stream transports.
 *
 * A transport moves raw bytes to and from one physical or virtual endpoint.
 * Readers and writers are serialized by separate locks so a session's read
 * task never blocks a command write. Background tasks bound to a connection
 * (read loops, heartbeats, mock reply timers) are attached to the channel and
 * torn down by [`Transport::cleanup_resources`], which always runs before the
 * channel is disconnected.
 */
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{DeviceError, Result};

#[cfg(feature = "mock")]
pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp;
pub mod udp;

#[cfg(feature = "mock")]
pub use mock::{MockFactory, MockTransport, TranscriptEntry};
#[cfg(feature = "serial")]
pub use serial::SerialTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// How long `cleanup_resources` waits for aborted tasks to wind down
const CLEANUP_GRACE: Duration = Duration::from_millis(250);

/// Per-read timeout used while draining stale input
const DISCARD_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Kind of transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Serial port (USB-serial, RS-232)
    Serial,
    /// TCP stream
    Tcp,
    /// UDP datagrams
    Udp,
    /// In-process mock channel
    Mock,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Serial => "serial",
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
            TransportKind::Mock => "mock",
        };
        f.write_str(name)
    }
}

/// Connection state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportState {
    /// Not connected
    Disconnected,
    /// Connect in progress
    Connecting,
    /// Connected and usable
    Connected,
    /// Tearing down
    Closing,
}

/// Timeouts applied by a transport, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportTimeouts {
    /// Connect timeout
    pub connect_timeout_ms: u64,
    /// Default read timeout
    pub read_timeout_ms: u64,
    /// Default write timeout
    pub write_timeout_ms: u64,
}

impl TransportTimeouts {
    /// Connect timeout as a duration
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Read timeout as a duration
    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Write timeout as a duration
    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3000,
            read_timeout_ms: 100,
            write_timeout_ms: 1000,
        }
    }
}

/// Where and how to connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Transport kind
    pub kind: TransportKind,
    /// Device path (serial), host (tcp/udp) or name (mock)
    pub endpoint: String,
    /// Port for tcp/udp
    #[serde(default)]
    pub port: Option<u16>,
    /// Baud rate for serial
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Timeouts
    #[serde(default)]
    pub timeouts: TransportTimeouts,
}

impl TransportConfig {
    /// Serial port at `path`
    pub fn serial<S: Into<String>>(path: S, baud_rate: u32) -> Self {
        Self::new(TransportKind::Serial, path, None, Some(baud_rate))
    }

    /// TCP stream to `host:port`
    pub fn tcp<S: Into<String>>(host: S, port: u16) -> Self {
        Self::new(TransportKind::Tcp, host, Some(port), None)
    }

    /// UDP peer at `host:port`
    pub fn udp<S: Into<String>>(host: S, port: u16) -> Self {
        Self::new(TransportKind::Udp, host, Some(port), None)
    }

    /// In-process mock channel
    pub fn mock<S: Into<String>>(name: S) -> Self {
        Self::new(TransportKind::Mock, name, None, None)
    }

    fn new<S: Into<String>>(
        kind: TransportKind,
        endpoint: S,
        port: Option<u16>,
        baud_rate: Option<u32>,
    ) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            port,
            baud_rate,
            timeouts: TransportTimeouts::default(),
        }
    }

    /// Replace the timeouts
    pub fn with_timeouts(mut self, timeouts: TransportTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Parse a transport description from TOML
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| DeviceError::config(e.to_string()))
    }

    /// `host:port` for network transports
    pub fn socket_address(&self) -> Result<String> {
        match self.port {
            Some(port) => Ok(format!("{}:{}", self.endpoint, port)),
            None => Err(DeviceError::config(format!(
                "{} transport to '{}' needs a port",
                self.kind, self.endpoint
            ))),
        }
    }
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.port, self.baud_rate) {
            (Some(port), _) => write!(f, "{}://{}:{}", self.kind, self.endpoint, port),
            (None, Some(baud)) => write!(f, "{}://{}@{}", self.kind, self.endpoint, baud),
            (None, None) => write!(f, "{}://{}", self.kind, self.endpoint),
        }
    }
}

/// A connected byte channel to one device
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Shared lifecycle state
    fn core(&self) -> &ChannelCore;

    /// Kind of this transport
    fn kind(&self) -> TransportKind {
        self.core().config().kind
    }

    /// Current connection state
    fn state(&self) -> TransportState {
        self.core().state()
    }

    /// Configuration the channel was built from
    fn config(&self) -> &TransportConfig {
        self.core().config()
    }

    /// Connect using the channel's configuration
    async fn connect(&self) -> Result<()>;

    /// Write all of `data`
    async fn write(&self, data: &[u8], timeout: Duration) -> Result<()>;

    /// Read at most `max_len` bytes
    ///
    /// Stream transports report a zero-byte read as `UnexpectedEof`.
    async fn read(&self, max_len: usize, timeout: Duration) -> Result<Bytes>;

    /// Drop the connection; runs `cleanup_resources` first if needed
    async fn disconnect(&self) -> Result<()>;

    /// Bind a background task to this channel's lifetime
    fn attach_task(&self, handle: JoinHandle<()>) {
        self.core().attach(handle);
    }

    /// Token cancelled when the channel is cleaned up
    fn cancellation_token(&self) -> CancellationToken {
        self.core().token()
    }

    /// Cancel and reap every attached task; idempotent
    async fn cleanup_resources(&self) {
        self.core().cleanup().await;
    }

    /// Drain inbound bytes that arrived before the caller cared
    async fn discard_input(&self) -> Result<usize> {
        let mut discarded = 0;
        loop {
            match self.read(4096, DISCARD_READ_TIMEOUT).await {
                Ok(bytes) if bytes.is_empty() => break,
                Ok(bytes) => discarded += bytes.len(),
                Err(e) if e.is_retryable() => break,
                Err(e) => return Err(e),
            }
        }
        if discarded > 0 {
            trace!("Discarded {} stale bytes from {}", discarded, self.config());
        }
        Ok(discarded)
    }
}

/// Lifecycle state shared by every transport implementation
pub struct ChannelCore {
    config: TransportConfig,
    state: Mutex<TransportState>,
    token: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    probe_lock: tokio::sync::Mutex<()>,
}

impl ChannelCore {
    /// Create the core for a disconnected channel
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TransportState::Disconnected),
            token: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
            probe_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Channel configuration
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the state
    pub fn set_state(&self, state: TransportState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            trace!("{}: {:?} -> {:?}", self.config, *current, state);
            *current = state;
        }
    }

    /// Enter `Connecting`, arming a fresh token if a previous connection was cleaned up
    pub fn begin_connect(&self) {
        let mut token = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        drop(token);
        self.set_state(TransportState::Connecting);
    }

    /// Token of the current connection
    pub fn token(&self) -> CancellationToken {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Serializes probes on this channel
    pub fn probe_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.probe_lock
    }

    /// Bind a task; aborted at once if the channel is already cleaned up
    pub fn attach(&self, handle: JoinHandle<()>) {
        if self.token().is_cancelled() {
            handle.abort();
            return;
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Number of attached tasks still running
    pub fn active_tasks(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Cancel the token, abort attached tasks and wait briefly for them
    ///
    /// Tasks still running after the grace period stay attached and keep
    /// counting in [`active_tasks`](Self::active_tasks). Must not be awaited
    /// from inside an attached task.
    pub async fn cleanup(&self) {
        self.token().cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        if tasks.is_empty() {
            return;
        }
        debug!("Cleaning up {} task(s) on {}", tasks.len(), self.config);
        for task in &tasks {
            task.abort();
        }
        let mut stragglers = Vec::new();
        for mut task in tasks {
            if tokio::time::timeout(CLEANUP_GRACE, &mut task).await.is_err() {
                stragglers.push(task);
            }
        }
        if !stragglers.is_empty() {
            warn!(
                "{} task(s) on {} still running {:?} after abort",
                stragglers.len(),
                self.config,
                CLEANUP_GRACE
            );
            self.tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(stragglers);
        }
    }
}

impl fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCore")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}

/// Map an elapsed read/write timer to a device timeout
pub(crate) fn elapsed(what: &str, config: &TransportConfig, timeout: Duration) -> DeviceError {
    DeviceError::timeout(format!("{} on {} after {:?}", what, config, timeout))
}

/// Produces connected transports for one logical device
#[async_trait]
pub trait TransportFactory: Send + Sync + fmt::Debug {
    /// Create and connect a new transport
    async fn create(&self) -> Result<Arc<dyn Transport>>;
}

/// Factory that connects from a fixed configuration
#[derive(Debug, Clone)]
pub struct ConfigTransportFactory {
    config: TransportConfig,
}

impl ConfigTransportFactory {
    /// Create a factory for `config`
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for ConfigTransportFactory {
    async fn create(&self) -> Result<Arc<dyn Transport>> {
        connect(&self.config).await
    }
}

/// Build the transport for `config.kind` and connect it
pub async fn connect(config: &TransportConfig) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match config.kind {
        TransportKind::Tcp => Arc::new(TcpTransport::new(config.clone())),
        TransportKind::Udp => Arc::new(UdpTransport::new(config.clone())),
        #[cfg(feature = "serial")]
        TransportKind::Serial => Arc::new(SerialTransport::new(config.clone())),
        #[cfg(not(feature = "serial"))]
        TransportKind::Serial => {
            return Err(DeviceError::config(
                "serial transport requires the `serial` feature",
            ))
        }
        #[cfg(feature = "mock")]
        TransportKind::Mock => Arc::new(MockTransport::new(config.clone())),
        #[cfg(not(feature = "mock"))]
        TransportKind::Mock => {
            return Err(DeviceError::config(
                "mock transport requires the `mock` feature",
            ))
        }
    };
    transport.connect().await?;
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_transport_config_from_toml() {
        let config = TransportConfig::from_toml_str(
            r#"
            kind = "tcp"
            endpoint = "192.168.4.1"
            port = 3333

            [timeouts]
            connect_timeout_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.kind, TransportKind::Tcp);
        assert_eq!(config.socket_address().unwrap(), "192.168.4.1:3333");
        assert_eq!(config.timeouts.connect(), Duration::from_millis(500));
        assert_eq!(config.timeouts.read(), Duration::from_millis(100));
        assert_eq!(config.to_string(), "tcp://192.168.4.1:3333");
    }

    #[test]
    fn test_socket_address_requires_port() {
        let config = TransportConfig::serial("/dev/ttyACM0", 115_200);
        assert!(matches!(config.socket_address(), Err(DeviceError::Config(_))));
        assert_eq!(config.to_string(), "serial:///dev/ttyACM0@115200");
    }

    #[tokio::test]
    async fn test_cleanup_aborts_attached_tasks() {
        let core = ChannelCore::new(TransportConfig::mock("core"));
        let sentinel = Arc::new(());
        let held = sentinel.clone();
        core.attach(tokio::spawn(async move {
            let _held = held;
            std::future::pending::<()>().await;
        }));
        assert_eq!(core.active_tasks(), 1);

        core.cleanup().await;
        assert_eq!(core.active_tasks(), 0);
        assert_eq!(Arc::strong_count(&sentinel), 1);
        assert!(core.token().is_cancelled());

        // idempotent
        core.cleanup().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_task_outliving_grace_period_stays_counted() {
        let core = ChannelCore::new(TransportConfig::mock("stuck"));
        // blocking code never reaches an await point, so abort cannot stop it
        let (started_tx, started) = tokio::sync::oneshot::channel();
        core.attach(tokio::spawn(async move {
            let _ = started_tx.send(());
            std::thread::sleep(Duration::from_millis(600));
        }));
        started.await.unwrap();

        core.cleanup().await;
        assert_eq!(core.active_tasks(), 1);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(core.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_finished_tasks_are_not_active() {
        let core = ChannelCore::new(TransportConfig::mock("done"));
        let handle = tokio::spawn(async {});
        tokio::time::sleep(Duration::from_millis(10)).await;
        core.attach(handle);
        assert_eq!(core.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_attach_after_cleanup_aborts_immediately() {
        let core = ChannelCore::new(TransportConfig::mock("late"));
        core.cleanup().await;

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        });
        core.attach(handle);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(core.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_begin_connect_rearms_token() {
        let core = ChannelCore::new(TransportConfig::mock("rearm"));
        core.cleanup().await;
        assert!(core.token().is_cancelled());
        core.begin_connect();
        assert!(!core.token().is_cancelled());
        assert_eq!(core.state(), TransportState::Connecting);
    }

    #[cfg(not(feature = "serial"))]
    #[tokio::test]
    async fn test_serial_without_feature_is_config_error() {
        let result = connect(&TransportConfig::serial("/dev/null", 9600)).await;
        assert!(matches!(result, Err(DeviceError::Config(_))));
    }
}
