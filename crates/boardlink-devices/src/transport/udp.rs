/*!
 * UDP datagram transport.
 *
 * The socket is connected to a single peer, so each read yields one datagram
 * from that peer. Unlike stream transports, an empty datagram is not a
 * disconnect.
 */
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::info;

use super::{elapsed, ChannelCore, Transport, TransportConfig, TransportState};
use crate::error::{DeviceError, Result};

/// Transport over a connected UDP socket
#[derive(Debug)]
pub struct UdpTransport {
    core: ChannelCore,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    read_lock: tokio::sync::Mutex<()>,
    write_lock: tokio::sync::Mutex<()>,
}

impl UdpTransport {
    /// Create a disconnected transport
    pub fn new(config: TransportConfig) -> Self {
        Self {
            core: ChannelCore::new(config),
            socket: Mutex::new(None),
            read_lock: tokio::sync::Mutex::new(()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DeviceError::NotConnected)
    }

    /// Local address of the bound socket
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.socket()?.local_addr()?)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn connect(&self) -> Result<()> {
        let config = self.core.config();
        let address = config.socket_address()?;
        let timeout = config.timeouts.connect();
        self.core.begin_connect();

        let attempt = async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(&address).await?;
            Ok::<_, std::io::Error>(socket)
        };
        let socket = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                self.core.set_state(TransportState::Disconnected);
                return Err(DeviceError::connection(format!("{}: {}", address, e)));
            }
            Err(_) => {
                self.core.set_state(TransportState::Disconnected);
                return Err(elapsed("connect", config, timeout));
            }
        };

        *self.socket.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(socket));
        self.core.set_state(TransportState::Connected);
        info!("Connected to {}", config);
        Ok(())
    }

    async fn write(&self, data: &[u8], timeout: Duration) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let socket = self.socket()?;
        let token = self.core.token();

        tokio::select! {
            _ = token.cancelled() => Err(DeviceError::Cancelled),
            result = tokio::time::timeout(timeout, socket.send(data)) => match result {
                Ok(Ok(sent)) if sent == data.len() => Ok(()),
                Ok(Ok(sent)) => Err(DeviceError::protocol(format!(
                    "datagram truncated: sent {} of {} bytes",
                    sent,
                    data.len()
                ))),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(elapsed("write", self.core.config(), timeout)),
            },
        }
    }

    async fn read(&self, max_len: usize, timeout: Duration) -> Result<Bytes> {
        let _guard = self.read_lock.lock().await;
        let socket = self.socket()?;
        let token = self.core.token();
        let mut buf = vec![0u8; max_len.max(1)];

        tokio::select! {
            _ = token.cancelled() => Err(DeviceError::Cancelled),
            result = tokio::time::timeout(timeout, socket.recv(&mut buf)) => match result {
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
        self.socket.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.core.set_state(TransportState::Disconnected);
        info!("Disconnected from {}", self.core.config());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_datagram_round_trip() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();

        let transport = UdpTransport::new(TransportConfig::udp("127.0.0.1", port));
        transport.connect().await.unwrap();
        transport
            .write(&[0xAA, 0x01, 0x00, 0x00, 0xAB], Duration::from_secs(1))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0xAA, 0x01, 0x00, 0x00, 0xAB]);
        peer.send_to(b"OK\n", from).await.unwrap();

        let reply = transport.read(64, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&reply[..], b"OK\n");

        transport.disconnect().await.unwrap();
        assert!(matches!(
            transport.read(1, Duration::from_millis(1)).await,
            Err(DeviceError::NotConnected)
        ));
    }
}
