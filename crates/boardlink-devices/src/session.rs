/*!
 * Device sessions.
 *
 * A session is an opened, handshaken conversation with one device over one
 * transport. A single background read task is the only reader: it decodes
 * inbound bytes, completes the pending command (if any) and fans telemetry out
 * to subscribers and the optional ring buffer. Commands are serialized by a
 * fair lock, so concurrent callers queue in arrival order and at most one
 * request is outstanding.
 */
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use futures::{FutureExt, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

use boardlink_core::logging::device_span;
use boardlink_core::telemetry::{TelemetryRingBuffer, TelemetrySample};
use boardlink_core::types::{Id, Value};

use crate::driver::Handshake;
use crate::error::{DeviceError, Result};
use crate::protocol::{FrameDecoder, InboundFrame, Protocol, Request};
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::transport::{Transport, TransportState};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Handshake in progress
    Opening,
    /// Accepting commands
    Ready,
    /// Tearing down
    Closing,
    /// Closed; terminal
    Closed,
    /// Unrecoverable protocol or transport failure
    Faulted,
}

impl SessionState {
    /// Whether the state machine allows moving to `next`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Opening, Ready)
                | (Opening, Closing)
                | (Ready, Closing)
                | (Ready, Faulted)
                | (Faulted, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Options for opening a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Device id; generated when absent
    pub device_id: Option<Id>,
    /// Default timeout for [`DeviceSession::call`]
    pub command_timeout: Duration,
    /// Timeout for writing a request
    pub write_timeout: Duration,
    /// Per-read timeout of the read task
    pub read_timeout: Duration,
    /// Bytes requested per read
    pub read_chunk: usize,
    /// Consecutive malformed frames that fault the session
    pub fault_threshold: u32,
    /// Ring buffer fed with every telemetry sample
    pub telemetry: Option<Arc<TelemetryRingBuffer>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            device_id: None,
            command_timeout: Duration::from_millis(2000),
            write_timeout: Duration::from_millis(1000),
            read_timeout: Duration::from_millis(100),
            read_chunk: 512,
            fault_threshold: 2,
            telemetry: None,
        }
    }
}

impl SessionOptions {
    /// Use a fixed device id
    pub fn with_device_id(mut self, id: Id) -> Self {
        self.device_id = Some(id);
        self
    }

    /// Feed telemetry into `ring`
    pub fn with_telemetry(mut self, ring: Arc<TelemetryRingBuffer>) -> Self {
        self.telemetry = Some(ring);
        self
    }

    /// Set the default command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set how many consecutive malformed frames fault the session
    pub fn with_fault_threshold(mut self, threshold: u32) -> Self {
        self.fault_threshold = threshold.max(1);
        self
    }
}

type PendingReply = oneshot::Sender<Result<Value>>;

/// At most one caller waiting for a response
///
/// A request that times out leaves a late-reply window behind: the next
/// request waits up to that long for the stale reply to arrive (and be
/// dropped as unmatched) before it goes on the wire.
#[derive(Default)]
struct Correlation {
    slot: Mutex<Option<PendingReply>>,
    late_window: Mutex<Option<Duration>>,
    unmatched: Notify,
}

impl Correlation {
    fn install(&self, reply: PendingReply) -> Result<()> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map_or(false, |pending| !pending.is_closed()) {
            return Err(DeviceError::protocol("a request is already pending"));
        }
        *slot = Some(reply);
        Ok(())
    }

    /// Complete the pending request; false if nobody was waiting
    fn complete(&self, result: Result<Value>) -> bool {
        let pending = self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        match pending {
            Some(reply) => reply.send(result).is_ok(),
            None => false,
        }
    }

    fn clear(&self) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Record that the pending request timed out after `window`
    fn expire(&self, window: Duration) {
        // forget replies that went unmatched before this request
        let _ = self.unmatched.notified().now_or_never();
        *self.late_window.lock().unwrap_or_else(PoisonError::into_inner) = Some(window);
    }

    /// A reply arrived with nobody waiting
    fn unmatched(&self) {
        self.unmatched.notify_one();
    }

    /// Wait out the late-reply window left by a timed-out request, if any
    async fn settle(&self) {
        let window = self.late_window.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(window) = window {
            match tokio::time::timeout(window, self.unmatched.notified()).await {
                Ok(()) => debug!("Late reply drained before next request"),
                Err(_) => trace!("No late reply within {:?}", window),
            }
        }
    }
}

/// Removes the correlation entry however the request ends
struct PendingGuard<'a>(&'a Correlation);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.clear();
    }
}

fn transition(state: &watch::Sender<SessionState>, next: SessionState) -> bool {
    state.send_if_modified(|current| {
        if current.can_transition_to(next) {
            *current = next;
            true
        } else {
            false
        }
    })
}

struct SessionInner {
    id: Id,
    driver: String,
    transport: Arc<dyn Transport>,
    protocol: Arc<dyn Protocol>,
    state: Arc<watch::Sender<SessionState>>,
    command_lock: tokio::sync::Mutex<()>,
    close_lock: tokio::sync::Mutex<()>,
    correlation: Arc<Correlation>,
    subscriptions: Arc<SubscriptionRegistry>,
    fault_reason: Arc<Mutex<Option<String>>>,
    options: SessionOptions,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if *self.state.borrow() == SessionState::Closed {
            return;
        }
        // the read task exits on cancellation and releases its transport handle
        debug!("Session {} dropped without close", self.id);
        self.transport.cancellation_token().cancel();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let transport = self.transport.clone();
            runtime.spawn(async move {
                transport.cleanup_resources().await;
                if let Err(e) = transport.disconnect().await {
                    warn!("Disconnect after drop failed: {}", e);
                }
            });
        }
    }
}

/// An open session with one device
///
/// Dropping the last handle without [`close`](Self::close) cancels the read
/// task and disconnects the transport in the background.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl DeviceSession {
    /// Start a session on a connected transport and run the handshake
    ///
    /// On failure the half-open session is closed (cleanup, then disconnect)
    /// and `Initialization` is returned.
    pub async fn open(
        driver: impl Into<String>,
        protocol: Arc<dyn Protocol>,
        handshake: Option<Handshake>,
        transport: Arc<dyn Transport>,
        options: SessionOptions,
        timeout: Duration,
    ) -> Result<Self> {
        if transport.state() != TransportState::Connected {
            return Err(DeviceError::NotConnected);
        }
        // leftovers from probing must not be taken for the handshake reply
        let stale = transport.discard_input().await?;
        if stale > 0 {
            debug!("Dropped {} stale bytes before handshake", stale);
        }
        let session = Self::start(driver.into(), protocol, transport, options);
        debug!("Opening session {} ({})", session.id(), session.driver());

        let outcome = match handshake {
            None => Ok(()),
            Some(handshake) => match session.exchange(&handshake.request, "handshake", timeout).await {
                Ok(reply) if (handshake.accept)(&reply) => Ok(()),
                Ok(reply) => Err(format!("unexpected handshake reply {:?}", reply)),
                Err(e) => Err(e.to_string()),
            },
        };

        match outcome {
            Ok(()) => {
                transition(&session.inner.state, SessionState::Ready);
                info!(
                    "Session {} ready ({} over {})",
                    session.id(),
                    session.driver(),
                    session.inner.transport.config()
                );
                Ok(session)
            }
            Err(reason) => {
                warn!("Handshake with {} failed: {}", session.driver(), reason);
                session.close().await;
                Err(DeviceError::Initialization(reason))
            }
        }
    }

    fn start(
        driver: String,
        protocol: Arc<dyn Protocol>,
        transport: Arc<dyn Transport>,
        options: SessionOptions,
    ) -> Self {
        let id = Id::or_generate(options.device_id.clone());
        let (state, _) = watch::channel(SessionState::Opening);
        let inner = Arc::new(SessionInner {
            id: id.clone(),
            driver: driver.clone(),
            transport: transport.clone(),
            protocol: protocol.clone(),
            state: Arc::new(state),
            command_lock: tokio::sync::Mutex::new(()),
            close_lock: tokio::sync::Mutex::new(()),
            correlation: Arc::new(Correlation::default()),
            subscriptions: SubscriptionRegistry::new(),
            fault_reason: Arc::new(Mutex::new(None)),
            options,
        });

        let read_loop = ReadLoop {
            id,
            transport: transport.clone(),
            decoder: protocol.decoder(),
            correlation: inner.correlation.clone(),
            subscriptions: inner.subscriptions.clone(),
            telemetry: inner.options.telemetry.clone(),
            state: inner.state.clone(),
            fault_reason: inner.fault_reason.clone(),
            read_timeout: inner.options.read_timeout,
            read_chunk: inner.options.read_chunk.max(1),
            fault_threshold: inner.options.fault_threshold.max(1),
        };
        let span = device_span(inner.id.as_str(), &driver);
        transport.attach_task(tokio::spawn(read_loop.run().instrument(span)));

        Self { inner }
    }

    /// Device id, stable for the session's lifetime
    pub fn id(&self) -> &Id {
        &self.inner.id
    }

    /// Name of the driver that opened the session
    pub fn driver(&self) -> &str {
        &self.inner.driver
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch state changes
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Why the session faulted, if it did
    pub fn fault_reason(&self) -> Option<String> {
        self.inner
            .fault_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The owned transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Ring buffer fed by this session, if any
    pub fn telemetry(&self) -> Option<&Arc<TelemetryRingBuffer>> {
        self.inner.options.telemetry.as_ref()
    }

    /// Number of registered telemetry handlers
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Faulted => Err(self.faulted_error()),
            SessionState::Closing | SessionState::Closed => Err(DeviceError::Closed),
            SessionState::Opening => Err(DeviceError::NotConnected),
        }
    }

    fn faulted_error(&self) -> DeviceError {
        DeviceError::Faulted(
            self.fault_reason()
                .unwrap_or_else(|| format!("session {} faulted", self.id())),
        )
    }

    /// Invoke `endpoint` with the default command timeout
    pub async fn call(&self, endpoint: &str, args: &[Value]) -> Result<Value> {
        self.invoke(endpoint, args, self.inner.options.command_timeout)
            .await
    }

    /// Invoke `endpoint` and wait up to `timeout` for the device's reply
    ///
    /// Concurrent callers queue in arrival order; the timeout starts once the
    /// request is on the wire.
    pub async fn invoke(&self, endpoint: &str, args: &[Value], timeout: Duration) -> Result<Value> {
        self.ensure_ready()?;
        let request = self.inner.protocol.encode(endpoint, args)?;

        let _command = self.inner.command_lock.lock().await;
        self.ensure_ready()?;
        self.exchange_locked(&request, endpoint, timeout).await
    }

    /// [`invoke`](Self::invoke) that gives up when `token` is cancelled
    ///
    /// Cancellation releases the command lock and the correlation entry.
    pub async fn invoke_cancellable(
        &self,
        endpoint: &str,
        args: &[Value],
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<Value> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(DeviceError::Cancelled),
            result = self.invoke(endpoint, args, timeout) => result,
        }
    }

    async fn exchange(&self, request: &Request, what: &str, timeout: Duration) -> Result<Value> {
        let _command = self.inner.command_lock.lock().await;
        self.exchange_locked(request, what, timeout).await
    }

    async fn exchange_locked(&self, request: &Request, what: &str, timeout: Duration) -> Result<Value> {
        trace!("{} -> {}", what, request);
        let write_timeout = self.inner.options.write_timeout;
        if !request.expects_response {
            self.inner.transport.write(&request.bytes, write_timeout).await?;
            return Ok(Value::Null);
        }

        self.inner.correlation.settle().await;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.correlation.install(reply_tx)?;
        let _pending = PendingGuard(self.inner.correlation.as_ref());
        if self.fault_reason().is_some() {
            return Err(self.faulted_error());
        }

        self.inner.transport.write(&request.bytes, write_timeout).await?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(match self.state() {
                SessionState::Faulted => self.faulted_error(),
                _ => DeviceError::Closed,
            }),
            Err(_) => {
                self.inner.correlation.expire(timeout);
                Err(DeviceError::timeout(format!(
                    "no reply to {} within {:?}",
                    what, timeout
                )))
            }
        }
    }

    /// Call `handler` for every sample on `stream` (`"*"` for all streams)
    pub fn subscribe<F>(&self, stream: &str, handler: F) -> Subscription
    where
        F: Fn(&TelemetrySample) + Send + Sync + 'static,
    {
        self.inner.subscriptions.subscribe(stream, handler)
    }

    /// Samples on `stream` as an async stream; ends when the session closes
    pub fn telemetry_stream(&self, stream: &str) -> TelemetryStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(stream, move |sample| {
            let _ = tx.send(sample.clone());
        });
        TelemetryStream {
            rx,
            _subscription: subscription,
        }
    }

    /// Close the session: drop subscriptions, clean up the transport, then disconnect
    ///
    /// Idempotent. Must not be called from a telemetry handler, which runs on
    /// the read task that cleanup aborts.
    pub async fn close(&self) {
        let _closing = self.inner.close_lock.lock().await;
        if self.state() == SessionState::Closed {
            return;
        }
        transition(&self.inner.state, SessionState::Closing);
        debug!("Closing session {}", self.id());

        self.inner.subscriptions.clear();
        self.inner.correlation.complete(Err(DeviceError::Closed));
        self.inner.transport.cleanup_resources().await;
        if let Err(e) = self.inner.transport.disconnect().await {
            warn!("Disconnect of session {} failed: {}", self.id(), e);
        }

        transition(&self.inner.state, SessionState::Closed);
        info!("Session {} closed", self.id());
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.inner.id)
            .field("driver", &self.inner.driver)
            .field("state", &self.state())
            .field("transport", &self.inner.transport.config())
            .finish()
    }
}

/// Telemetry samples of one stream; see [`DeviceSession::telemetry_stream`]
#[derive(Debug)]
pub struct TelemetryStream {
    rx: mpsc::UnboundedReceiver<TelemetrySample>,
    _subscription: Subscription,
}

impl Stream for TelemetryStream {
    type Item = TelemetrySample;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// State owned by the background read task
struct ReadLoop {
    id: Id,
    transport: Arc<dyn Transport>,
    decoder: FrameDecoder,
    correlation: Arc<Correlation>,
    subscriptions: Arc<SubscriptionRegistry>,
    telemetry: Option<Arc<TelemetryRingBuffer>>,
    state: Arc<watch::Sender<SessionState>>,
    fault_reason: Arc<Mutex<Option<String>>>,
    read_timeout: Duration,
    read_chunk: usize,
    fault_threshold: u32,
}

impl ReadLoop {
    async fn run(mut self) {
        let token = self.transport.cancellation_token();
        let mut buffer = BytesMut::with_capacity(self.read_chunk * 2);
        let mut malformed = 0u32;

        loop {
            let chunk = match self.transport.read(self.read_chunk, self.read_timeout).await {
                Ok(chunk) => chunk,
                Err(e) if e.is_retryable() => {
                    trace!("Retryable read error: {}", e);
                    continue;
                }
                Err(DeviceError::Cancelled) => {
                    debug!("Read loop cancelled");
                    return;
                }
                Err(e) => {
                    self.fault(format!("transport error: {}", e));
                    return;
                }
            };
            if token.is_cancelled() {
                return;
            }
            buffer.extend_from_slice(&chunk);

            loop {
                match self.decoder.decode(&mut buffer) {
                    Ok(Some(frame)) => match frame.malformed_reason() {
                        Some(reason) => {
                            malformed += 1;
                            warn!(
                                "Malformed frame ({} of {}): {}",
                                malformed, self.fault_threshold, reason
                            );
                            if malformed >= self.fault_threshold {
                                self.fault(format!(
                                    "{} consecutive malformed frames, last: {}",
                                    malformed, reason
                                ));
                                return;
                            }
                            self.dispatch(frame);
                        }
                        None => {
                            malformed = 0;
                            self.dispatch(frame);
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        self.fault(format!("decoder error: {}", e));
                        return;
                    }
                }
            }
        }
    }

    fn dispatch(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Response(value) => {
                if !self.correlation.complete(Ok(value)) {
                    warn!("Dropping response with no pending request");
                    self.correlation.unmatched();
                }
            }
            InboundFrame::Rejected(message) => {
                if !self.correlation.complete(Err(DeviceError::Rejected(message))) {
                    warn!("Dropping rejection with no pending request");
                    self.correlation.unmatched();
                }
            }
            InboundFrame::Telemetry(sample) => {
                trace!("Telemetry {}", sample);
                if let Some(ring) = &self.telemetry {
                    ring.push(sample.clone());
                }
                self.subscriptions.dispatch(&sample);
            }
            InboundFrame::Corrupt {
                expected, actual, ..
            } => {
                self.correlation
                    .complete(Err(DeviceError::Checksum { expected, actual }));
            }
            InboundFrame::Malformed { bytes, .. } => {
                trace!("Skipped {} malformed bytes", bytes.len());
            }
        }
    }

    fn fault(&self, reason: String) {
        error!("Session {} faulted: {}", self.id, reason);
        *self
            .fault_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.clone());
        transition(&self.state, SessionState::Faulted);
        self.correlation.complete(Err(DeviceError::Faulted(reason)));
    }
}
