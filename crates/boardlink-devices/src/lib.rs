/*!
 * Boardlink Devices
 *
 * Transports, wire protocols and device drivers for Arduino, ESP32 and
 * RioRand relay boards, plus the session and reconnection machinery that
 * keeps a device usable over a flaky link.
 */

#![warn(missing_docs)]

pub mod backoff;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod settings;
pub mod subscription;
pub mod supervisor;
pub mod transport;

pub use backoff::{Backoff, ReconnectPolicy};
pub use driver::{Capability, DeviceDriver, DriverDescriptor, DriverTimeouts, Handshake};
pub use error::{DeviceError, Result};
pub use registry::DriverRegistry;
pub use session::{DeviceSession, SessionOptions, SessionState, TelemetryStream};
pub use subscription::{Subscription, ALL_STREAMS};
pub use supervisor::{
    ConnectionEvent, ConnectionState, DriverSelection, HeartbeatConfig, ReconnectionSupervisor,
    SupervisorOptions,
};
pub use transport::{Transport, TransportConfig, TransportFactory, TransportKind, TransportState};

/// Everything needed to drive a device in one import
pub mod prelude {
    pub use boardlink_core::prelude::*;

    pub use crate::{
        ConnectionEvent, ConnectionState, DeviceDriver, DeviceError, DeviceSession,
        DriverRegistry, DriverSelection, ReconnectionSupervisor, SessionOptions, SessionState,
        SupervisorOptions, Transport, TransportConfig, TransportKind,
    };
}

/// Boardlink devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device layer
pub fn init() -> std::result::Result<(), boardlink_core::error::Error> {
    tracing::info!("Boardlink Devices {} initialized", VERSION);
    Ok(())
}

/// Transport kinds compiled into this build
pub fn available_transports() -> Vec<TransportKind> {
    let mut transports = vec![TransportKind::Tcp, TransportKind::Udp];

    #[cfg(feature = "serial")]
    transports.push(TransportKind::Serial);

    #[cfg(feature = "mock")]
    transports.push(TransportKind::Mock);

    transports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_transports() {
        let transports = available_transports();
        assert!(transports.contains(&TransportKind::Tcp));
        assert!(transports.contains(&TransportKind::Udp));
        assert_eq!(transports.contains(&TransportKind::Serial), cfg!(feature = "serial"));
    }
}
