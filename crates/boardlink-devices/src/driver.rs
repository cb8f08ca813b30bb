/*!
 * Device driver abstraction.
 *
 * A driver knows one device family: how to recognise it on a freshly
 * connected transport (probe), how to bring it up (handshake), and which wire
 * protocol its sessions speak.
 */
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use boardlink_core::types::Value;

use crate::error::Result;
use crate::protocol::{Protocol, Request};
use crate::session::{DeviceSession, SessionOptions};
use crate::transport::{Transport, TransportKind};

/// Bytes requested per read while probing
const PROBE_READ_CHUNK: usize = 256;

/// Upper bound of a single read while probing; the probe timeout governs overall
const PROBE_READ_SLICE: Duration = Duration::from_millis(50);

/// Probe replies beyond this many bytes are trimmed from the front
const PROBE_BUFFER_LIMIT: usize = 4096;

/// Hardware capability advertised by a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Digital pins
    Gpio,
    /// PWM outputs
    Pwm,
    /// Analog inputs
    Adc,
    /// I2C bus
    I2c,
    /// SPI bus
    Spi,
    /// Wi-Fi radio
    Wifi,
    /// Relay channels
    Relay,
}

/// Default timeouts of a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverTimeouts {
    /// Bound on one probe
    pub probe: Duration,
    /// Bound on the open handshake
    pub open: Duration,
    /// Default command timeout
    pub command: Duration,
}

impl Default for DriverTimeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_millis(1500),
            open: Duration::from_millis(5000),
            command: Duration::from_millis(2000),
        }
    }
}

/// Static description of a driver; immutable once registered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverDescriptor {
    /// Unique driver name
    pub name: String,
    /// Driver version
    pub version: String,
    /// Transports the family can be reached over
    pub transports: Vec<TransportKind>,
    /// Capability flags
    pub capabilities: Vec<Capability>,
    /// Default timeouts
    pub timeouts: DriverTimeouts,
}

impl DriverDescriptor {
    /// Whether the driver can talk over `kind`
    pub fn supports(&self, kind: TransportKind) -> bool {
        self.transports.contains(&kind)
    }

    /// Whether the driver advertises `capability`
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Session handshake: one request and a predicate over its reply
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Request sent once the read task runs
    pub request: Request,
    /// Accepts the decoded reply
    pub accept: fn(&Value) -> bool,
}

/// A device family driver
#[async_trait]
pub trait DeviceDriver: Send + Sync + Debug {
    /// Static description
    fn descriptor(&self) -> &DriverDescriptor;

    /// Wire protocol spoken by sessions of this driver
    fn protocol(&self) -> Arc<dyn Protocol>;

    /// Whether the device on `transport` belongs to this family
    ///
    /// Never fails: transport errors and timeouts yield `false`.
    async fn probe(&self, transport: &dyn Transport, timeout: Duration) -> bool;

    /// Handshake run by [`open`](Self::open), if the family has one
    fn handshake(&self) -> Option<Handshake>;

    /// Open a session on `transport`
    async fn open(
        &self,
        transport: Arc<dyn Transport>,
        options: SessionOptions,
        timeout: Duration,
    ) -> Result<DeviceSession> {
        DeviceSession::open(
            self.descriptor().name.clone(),
            self.protocol(),
            self.handshake(),
            transport,
            options,
            timeout,
        )
        .await
    }
}

/// Send `request` and report whether the reply matches a family signature
///
/// Holds the transport's probe lock for the duration, drains stale input
/// first, and gives up after `timeout`.
pub async fn probe_signature<F>(
    transport: &dyn Transport,
    request: &[u8],
    timeout: Duration,
    matches: F,
) -> bool
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    let deadline = Instant::now() + timeout;
    let _probe = match tokio::time::timeout_at(deadline, transport.core().probe_lock().lock()).await {
        Ok(guard) => guard,
        Err(_) => {
            debug!("Probe lock on {} not acquired in time", transport.config());
            return false;
        }
    };

    match tokio::time::timeout_at(deadline, exchange_until(transport, request, &matches)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Probe on {} failed: {}", transport.config(), e);
            false
        }
        Err(_) => {
            trace!("No matching signature on {} within {:?}", transport.config(), timeout);
            false
        }
    }
}

async fn exchange_until<F>(transport: &dyn Transport, request: &[u8], matches: &F) -> Result<()>
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    transport.discard_input().await?;
    transport
        .write(request, transport.config().timeouts.write())
        .await?;

    let mut seen = BytesMut::new();
    loop {
        match transport.read(PROBE_READ_CHUNK, PROBE_READ_SLICE).await {
            Ok(bytes) => {
                seen.extend_from_slice(&bytes);
                if matches(&seen) {
                    return Ok(());
                }
                if seen.len() > PROBE_BUFFER_LIMIT {
                    seen.advance(seen.len() - PROBE_BUFFER_LIMIT);
                }
            }
            Err(e) if e.is_retryable() => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Case-insensitive search for any of `needles` in a probe reply
pub fn contains_any(haystack: &[u8], needles: &[&str]) -> bool {
    let text = String::from_utf8_lossy(haystack).to_ascii_uppercase();
    needles.iter().any(|needle| text.contains(&needle.to_ascii_uppercase()))
}
