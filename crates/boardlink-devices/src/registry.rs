/*!
 * Driver registry.
 *
 * Holds the known device families in registration order and identifies the
 * device behind a freshly connected transport by probing them one at a time.
 */
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::driver::{DeviceDriver, DriverDescriptor, DriverTimeouts};
use crate::drivers::{ArduinoDriver, Esp32Driver, RioRandDriver};
use crate::error::{DeviceError, Result};
use crate::session::{DeviceSession, SessionOptions};
use crate::transport::Transport;

/// Ordered set of device drivers
#[derive(Debug, Default)]
pub struct DriverRegistry {
    drivers: RwLock<Vec<Arc<dyn DeviceDriver>>>,
    timeouts: Option<DriverTimeouts>,
}

impl DriverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in families: Arduino, ESP32, RioRand
    pub fn with_builtin_drivers() -> Self {
        let registry = Self::new();
        let builtin: [Arc<dyn DeviceDriver>; 3] = [
            Arc::new(ArduinoDriver::new()),
            Arc::new(Esp32Driver::new()),
            Arc::new(RioRandDriver::new()),
        ];
        for driver in builtin {
            if let Err(e) = registry.register(driver) {
                warn!("Built-in driver not registered: {}", e);
            }
        }
        registry
    }

    /// Override every driver's probe and open timeouts
    pub fn with_timeouts(mut self, timeouts: DriverTimeouts) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Append a driver; names must be unique
    pub fn register(&self, driver: Arc<dyn DeviceDriver>) -> Result<()> {
        let mut drivers = self.drivers.write().unwrap_or_else(PoisonError::into_inner);
        let name = &driver.descriptor().name;
        if drivers.iter().any(|d| &d.descriptor().name == name) {
            return Err(DeviceError::config(format!("driver {} already registered", name)));
        }
        debug!("Registered driver {} v{}", name, driver.descriptor().version);
        drivers.push(driver);
        Ok(())
    }

    /// Driver registered under `name`
    pub fn get(&self, name: &str) -> Option<Arc<dyn DeviceDriver>> {
        self.drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|d| d.descriptor().name == name)
            .cloned()
    }

    /// Descriptors in registration order
    pub fn descriptors(&self) -> Vec<DriverDescriptor> {
        self.snapshot().iter().map(|d| d.descriptor().clone()).collect()
    }

    /// Number of registered drivers
    pub fn len(&self) -> usize {
        self.drivers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no driver is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn DeviceDriver>> {
        self.drivers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn timeouts_for(&self, driver: &dyn DeviceDriver) -> DriverTimeouts {
        self.timeouts.unwrap_or(driver.descriptor().timeouts)
    }

    /// First driver, in registration order, whose probe matches
    ///
    /// Drivers that cannot talk over the transport's kind are skipped. Probes
    /// run one after another, each bounded by that driver's probe timeout.
    pub async fn probe_all(&self, transport: &dyn Transport) -> Result<Arc<dyn DeviceDriver>> {
        let kind = transport.kind();
        for driver in self.snapshot() {
            let descriptor = driver.descriptor();
            if !descriptor.supports(kind) {
                debug!("Skipping {} on {} transport", descriptor.name, kind);
                continue;
            }
            let timeout = self.timeouts_for(driver.as_ref()).probe;
            let matched = tokio::time::timeout(timeout, driver.probe(transport, timeout))
                .await
                .unwrap_or(false);
            if matched {
                info!("Identified {} on {}", descriptor.name, transport.config());
                return Ok(driver);
            }
            debug!("{} did not match on {}", descriptor.name, transport.config());
        }
        Err(DeviceError::NoMatch)
    }

    /// Identify the device on `transport` and open a session with its driver
    pub async fn probe_and_open(
        &self,
        transport: Arc<dyn Transport>,
        options: SessionOptions,
    ) -> Result<(Arc<dyn DeviceDriver>, DeviceSession)> {
        let driver = self.probe_all(transport.as_ref()).await?;
        let timeout = self.timeouts_for(driver.as_ref()).open;
        let session = driver.open(transport, options, timeout).await?;
        Ok((driver, session))
    }

    /// Probe timeout used for `driver`
    pub fn probe_timeout(&self, driver: &dyn DeviceDriver) -> Duration {
        self.timeouts_for(driver).probe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registration_order() {
        let registry = DriverRegistry::with_builtin_drivers();
        let names: Vec<String> = registry.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["arduino", "esp32", "riorand"]);
        assert!(registry.get("esp32").is_some());
        assert!(registry.get("raspberry").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = DriverRegistry::with_builtin_drivers();
        let error = tokio_test::assert_err!(registry.register(Arc::new(ArduinoDriver::new())));
        assert!(matches!(error, DeviceError::Config(_)));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_timeout_override() {
        let timeouts = DriverTimeouts {
            probe: Duration::from_millis(200),
            ..DriverTimeouts::default()
        };
        let registry = DriverRegistry::with_builtin_drivers().with_timeouts(timeouts);
        let driver = registry.get("arduino").unwrap();
        assert_eq!(registry.probe_timeout(driver.as_ref()), Duration::from_millis(200));
    }

    #[cfg(feature = "mock")]
    mod probing {
        use super::super::*;
        use crate::session::SessionState;
        use crate::drivers::riorand::frame;
        use crate::transport::MockTransport;
        use tokio::time::Instant;

        #[tokio::test(start_paused = true)]
        async fn test_esp32_found_after_arduino_misses() {
            let mock = MockTransport::named("esp");
            mock.respond("AT\r\n", "\r\nOK\r\n");
            mock.connect().await.unwrap();

            let registry = DriverRegistry::with_builtin_drivers();
            let driver = registry.probe_all(&mock).await.unwrap();
            assert_eq!(driver.descriptor().name, "esp32");
            // arduino went first
            assert_eq!(&mock.written()[0][..], b"ID?\n");
        }

        #[tokio::test(start_paused = true)]
        async fn test_silent_transport_yields_no_match() {
            let mock = MockTransport::named("silent");
            mock.set_silent(true);
            mock.connect().await.unwrap();

            let timeouts = DriverTimeouts {
                probe: Duration::from_millis(300),
                ..DriverTimeouts::default()
            };
            let registry = DriverRegistry::with_builtin_drivers().with_timeouts(timeouts);
            let started = Instant::now();
            let result = registry.probe_all(&mock).await;
            assert!(matches!(result, Err(DeviceError::NoMatch)));
            assert!(started.elapsed() <= Duration::from_millis(3 * 300 + 50));
        }

        #[tokio::test(start_paused = true)]
        async fn test_probe_and_open_relay_board() {
            let mock = Arc::new(MockTransport::named("relay"));
            mock.respond(frame(0x01, 0, 0).to_vec(), frame(0x81, 0, 8).to_vec());
            mock.respond(frame(0x05, 0, 0).to_vec(), frame(0x85, 0, 0).to_vec());
            mock.connect().await.unwrap();

            let registry = DriverRegistry::with_builtin_drivers();
            let (driver, session) = registry
                .probe_and_open(mock.clone(), SessionOptions::default())
                .await
                .unwrap();
            assert_eq!(driver.descriptor().name, "riorand");
            assert_eq!(session.state(), SessionState::Ready);
            session.close().await;
        }
    }
}
