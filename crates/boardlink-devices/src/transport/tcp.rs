/*!
 * TCP stream transport.
 */
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{elapsed, ChannelCore, Transport, TransportConfig, TransportState};
use crate::error::{DeviceError, Result};

/// Transport over a TCP connection (ESP32 AT servers, serial-to-network bridges)
#[derive(Debug)]
pub struct TcpTransport {
    core: ChannelCore,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpTransport {
    /// Create a disconnected transport
    pub fn new(config: TransportConfig) -> Self {
        Self {
            core: ChannelCore::new(config),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn connect(&self) -> Result<()> {
        let config = self.core.config();
        let address = config.socket_address()?;
        let timeout = config.timeouts.connect();
        self.core.begin_connect();

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.core.set_state(TransportState::Disconnected);
                return Err(DeviceError::connection(format!("{}: {}", address, e)));
            }
            Err(_) => {
                self.core.set_state(TransportState::Disconnected);
                return Err(elapsed("connect", config, timeout));
            }
        };
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        self.core.set_state(TransportState::Connected);
        info!("Connected to {}", config);
        Ok(())
    }

    async fn write(&self, data: &[u8], timeout: Duration) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let half = writer.as_mut().ok_or(DeviceError::NotConnected)?;
        let token = self.core.token();

        tokio::select! {
            _ = token.cancelled() => Err(DeviceError::Cancelled),
            result = tokio::time::timeout(timeout, async {
                half.write_all(data).await?;
                half.flush().await
            }) => match result {
                Ok(outcome) => outcome.map_err(DeviceError::from),
                Err(_) => Err(elapsed("write", self.core.config(), timeout)),
            },
        }
    }

    async fn read(&self, max_len: usize, timeout: Duration) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        let half = reader.as_mut().ok_or(DeviceError::NotConnected)?;
        let token = self.core.token();
        let mut buf = vec![0u8; max_len.max(1)];

        tokio::select! {
            _ = token.cancelled() => Err(DeviceError::Cancelled),
            result = tokio::time::timeout(timeout, half.read(&mut buf)) => match result {
                Ok(Ok(0)) => Err(DeviceError::eof()),
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    Ok(Bytes::from(buf))
                }
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(elapsed("read", self.core.config(), timeout)),
            },
        }
    }

    async fn disconnect(&self) -> Result<()> {
        if self.core.state() == TransportState::Disconnected {
            return Ok(());
        }
        self.cleanup_resources().await;
        self.core.set_state(TransportState::Closing);

        if let Some(mut half) = self.writer.lock().await.take() {
            if let Err(e) = half.shutdown().await {
                debug!("Shutdown of {} failed: {}", self.core.config(), e);
            }
        }
        self.reader.lock().await.take();
        self.core.set_state(TransportState::Disconnected);
        info!("Disconnected from {}", self.core.config());
        Ok(())
    }
}
