/*!
 * In-process mock transport.
 *
 * Scripted request/response rules stand in for a real device: every write is
 * matched against the rules and the first match queues its reply, optionally
 * after a delay. Tests can inject unsolicited bytes, simulate the peer hanging
 * up, and inspect the ordered transcript of what went over the wire.
 */
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use super::{elapsed, ChannelCore, Transport, TransportConfig, TransportFactory, TransportState};
use crate::error::{DeviceError, Result};

/// One entry of the wire transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEntry {
    /// Bytes written by the host
    Tx(Bytes),
    /// Bytes delivered to a reader
    Rx(Bytes),
}

impl TranscriptEntry {
    /// Payload regardless of direction
    pub fn bytes(&self) -> &Bytes {
        match self {
            TranscriptEntry::Tx(b) | TranscriptEntry::Rx(b) => b,
        }
    }
}

#[derive(Debug)]
enum Matcher {
    Exact(Bytes),
    Prefix(Bytes),
}

impl Matcher {
    fn matches(&self, written: &[u8]) -> bool {
        match self {
            Matcher::Exact(expected) => written == &expected[..],
            Matcher::Prefix(prefix) => written.starts_with(prefix),
        }
    }
}

#[derive(Debug)]
struct Rule {
    matcher: Matcher,
    reply: Bytes,
    delay: Duration,
}

#[derive(Debug)]
enum Inbound {
    Data(Bytes),
    HangUp,
}

#[derive(Debug)]
struct Reader {
    rx: mpsc::UnboundedReceiver<Inbound>,
    leftover: Bytes,
    hung_up: bool,
}

/// Mock transport with scripted replies
#[derive(Debug)]
pub struct MockTransport {
    core: ChannelCore,
    rules: Mutex<Vec<Rule>>,
    inbound: mpsc::UnboundedSender<Inbound>,
    reader: tokio::sync::Mutex<Reader>,
    write_lock: tokio::sync::Mutex<()>,
    transcript: Mutex<Vec<TranscriptEntry>>,
    silent: AtomicBool,
    fail_connect: AtomicBool,
}

impl MockTransport {
    /// Create a disconnected mock
    pub fn new(config: TransportConfig) -> Self {
        let (inbound, rx) = mpsc::unbounded_channel();
        Self {
            core: ChannelCore::new(config),
            rules: Mutex::new(Vec::new()),
            inbound,
            reader: tokio::sync::Mutex::new(Reader {
                rx,
                leftover: Bytes::new(),
                hung_up: false,
            }),
            write_lock: tokio::sync::Mutex::new(()),
            transcript: Mutex::new(Vec::new()),
            silent: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
        }
    }

    /// Create a disconnected mock named `name`
    pub fn named<S: Into<String>>(name: S) -> Self {
        Self::new(TransportConfig::mock(name))
    }

    fn add_rule(&self, matcher: Matcher, reply: Bytes, delay: Duration) {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Rule { matcher, reply, delay });
    }

    /// Reply with `reply` whenever exactly `request` is written
    pub fn respond<Q: Into<Bytes>, R: Into<Bytes>>(&self, request: Q, reply: R) -> &Self {
        self.add_rule(Matcher::Exact(request.into()), reply.into(), Duration::ZERO);
        self
    }

    /// Reply with `reply` after `delay` whenever exactly `request` is written
    pub fn respond_after<Q: Into<Bytes>, R: Into<Bytes>>(
        &self,
        request: Q,
        reply: R,
        delay: Duration,
    ) -> &Self {
        self.add_rule(Matcher::Exact(request.into()), reply.into(), delay);
        self
    }

    /// Reply with `reply` whenever a write starts with `prefix`
    pub fn respond_prefix<Q: Into<Bytes>, R: Into<Bytes>>(&self, prefix: Q, reply: R) -> &Self {
        self.add_rule(Matcher::Prefix(prefix.into()), reply.into(), Duration::ZERO);
        self
    }

    /// Queue unsolicited inbound bytes
    pub fn inject<B: Into<Bytes>>(&self, bytes: B) {
        let _ = self.inbound.send(Inbound::Data(bytes.into()));
    }

    /// Make the peer close the connection; pending reads see EOF
    pub fn hang_up(&self) {
        let _ = self.inbound.send(Inbound::HangUp);
    }

    /// Stop answering writes
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Make `connect` fail
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Everything that went over the wire, in order
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Only the bytes written by the host
    pub fn written(&self) -> Vec<Bytes> {
        self.transcript()
            .into_iter()
            .filter_map(|entry| match entry {
                TranscriptEntry::Tx(b) => Some(b),
                TranscriptEntry::Rx(_) => None,
            })
            .collect()
    }

    /// Forget the transcript so far
    pub fn clear_transcript(&self) {
        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Background tasks still bound to this channel
    pub fn active_tasks(&self) -> usize {
        self.core.active_tasks()
    }

    fn record(&self, entry: TranscriptEntry) {
        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    fn reply_for(&self, written: &[u8]) -> Option<(Bytes, Duration)> {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|rule| rule.matcher.matches(written))
            .map(|rule| (rule.reply.clone(), rule.delay))
    }

    fn take_chunk(&self, reader: &mut Reader, max_len: usize) -> Bytes {
        let n = reader.leftover.len().min(max_len.max(1));
        let chunk = reader.leftover.split_to(n);
        self.record(TranscriptEntry::Rx(chunk.clone()));
        chunk
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn connect(&self) -> Result<()> {
        self.core.begin_connect();
        if self.fail_connect.load(Ordering::SeqCst) {
            self.core.set_state(TransportState::Disconnected);
            return Err(DeviceError::connection(format!(
                "{} refused the connection",
                self.core.config()
            )));
        }
        let mut reader = self.reader.lock().await;
        reader.hung_up = false;
        reader.leftover = Bytes::new();
        drop(reader);
        self.core.set_state(TransportState::Connected);
        Ok(())
    }

    async fn write(&self, data: &[u8], _timeout: Duration) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.core.state() != TransportState::Connected {
            return Err(DeviceError::NotConnected);
        }
        let written = Bytes::copy_from_slice(data);
        self.record(TranscriptEntry::Tx(written.clone()));
        if self.silent.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Some((reply, delay)) = self.reply_for(&written) {
            trace!("Mock {} answering {:?}", self.core.config(), written);
            if delay.is_zero() {
                self.inject(reply);
            } else {
                let inbound = self.inbound.clone();
                self.core.attach(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inbound.send(Inbound::Data(reply));
                }));
            }
        }
        Ok(())
    }

    async fn read(&self, max_len: usize, timeout: Duration) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        if !reader.leftover.is_empty() {
            return Ok(self.take_chunk(&mut reader, max_len));
        }
        if reader.hung_up {
            return Err(DeviceError::eof());
        }
        if self.core.state() != TransportState::Connected {
            return Err(DeviceError::NotConnected);
        }

        let token = self.core.token();
        let received = tokio::select! {
            _ = token.cancelled() => return Err(DeviceError::Cancelled),
            received = tokio::time::timeout(timeout, reader.rx.recv()) => received,
        };
        match received {
            Ok(Some(Inbound::Data(bytes))) => {
                reader.leftover = bytes;
                Ok(self.take_chunk(&mut reader, max_len))
            }
            Ok(Some(Inbound::HangUp)) | Ok(None) => {
                reader.hung_up = true;
                Err(DeviceError::eof())
            }
            Err(_) => Err(elapsed("read", self.core.config(), timeout)),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        if self.core.state() == TransportState::Disconnected {
            return Ok(());
        }
        self.cleanup_resources().await;
        self.core.set_state(TransportState::Closing);
        self.core.set_state(TransportState::Disconnected);
        Ok(())
    }
}

type Script = dyn Fn(&MockTransport) + Send + Sync;

/// Hands out freshly scripted, connected mocks; used to exercise reconnection
pub struct MockFactory {
    name: String,
    script: Arc<Script>,
    created: Mutex<Vec<Arc<MockTransport>>>,
    failures: AtomicU32,
    counter: AtomicUsize,
}

impl MockFactory {
    /// Every created mock is passed through `script` before connecting
    pub fn new<S, F>(name: S, script: F) -> Self
    where
        S: Into<String>,
        F: Fn(&MockTransport) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            script: Arc::new(script),
            created: Mutex::new(Vec::new()),
            failures: AtomicU32::new(0),
            counter: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` creations with a connection error
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Fail every creation from now on
    pub fn fail_always(&self) {
        self.failures.store(u32::MAX, Ordering::SeqCst);
    }

    /// Every mock handed out so far
    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most recently handed out mock
    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// Create, script and connect a new mock
    pub async fn create_mock(&self) -> Result<Arc<MockTransport>> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}-{}", self.name, index);

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.failures.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(DeviceError::connection(format!("mock://{} unavailable", name)));
        }

        let mock = Arc::new(MockTransport::named(name));
        (self.script)(&mock);
        mock.connect().await?;
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(mock.clone());
        Ok(mock)
    }
}

impl fmt::Debug for MockFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockFactory")
            .field("name", &self.name)
            .field("created", &self.counter.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(&self) -> Result<Arc<dyn Transport>> {
        let mock: Arc<dyn Transport> = self.create_mock().await?;
        Ok(mock)
    }
}
