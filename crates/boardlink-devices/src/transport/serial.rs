/*!
 * Serial port transport (USB-serial adapters, on-board CDC ports).
 */
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

use super::{elapsed, ChannelCore, Transport, TransportConfig, TransportState};
use crate::error::{DeviceError, Result};

/// Baud rate used when the configuration names none
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Transport over a local serial port, 8N1 without flow control
pub struct SerialTransport {
    core: ChannelCore,
    reader: Mutex<Option<ReadHalf<SerialStream>>>,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
}

impl SerialTransport {
    /// Create a disconnected transport
    pub fn new(config: TransportConfig) -> Self {
        Self {
            core: ChannelCore::new(config),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    fn open(&self) -> Result<SerialStream> {
        let config = self.core.config();
        let baud = config.baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
        tokio_serial::new(&config.endpoint, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(config.timeouts.read())
            .open_native_async()
            .map_err(|e| match e.kind() {
                tokio_serial::ErrorKind::NoDevice => {
                    DeviceError::connection(format!("no such port: {}", config.endpoint))
                }
                tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    DeviceError::connection(format!("permission denied: {}", config.endpoint))
                }
                _ => DeviceError::connection(format!("{}: {}", config.endpoint, e)),
            })
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport").field("core", &self.core).finish()
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn connect(&self) -> Result<()> {
        self.core.begin_connect();
        let stream = match self.open() {
            Ok(stream) => stream,
            Err(e) => {
                self.core.set_state(TransportState::Disconnected);
                return Err(e);
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        self.core.set_state(TransportState::Connected);
        info!("Opened {}", self.core.config());
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
        self.writer.lock().await.take();
        self.reader.lock().await.take();
        self.core.set_state(TransportState::Disconnected);
        info!("Closed {}", self.core.config());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_port_is_connection_error() {
        let transport =
            SerialTransport::new(TransportConfig::serial("/dev/boardlink-does-not-exist", 9600));
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, DeviceError::Connection(_)));
        assert_eq!(transport.state(), TransportState::Disconnected);
    }
}
