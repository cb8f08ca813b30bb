/*!
 * Conversions from the core configuration sections into device-layer options.
 */
use boardlink_core::config::{
    Config, HeartbeatSection, ReconnectSection, SessionSection, TransportSection,
};
use boardlink_core::utils::millis_to_duration;

use crate::backoff::ReconnectPolicy;
use crate::driver::DriverTimeouts;
use crate::session::SessionOptions;
use crate::supervisor::{HeartbeatConfig, SupervisorOptions};
use crate::transport::TransportTimeouts;

impl From<&TransportSection> for TransportTimeouts {
    fn from(section: &TransportSection) -> Self {
        Self {
            connect_timeout_ms: section.connect_timeout_ms,
            read_timeout_ms: section.read_timeout_ms,
            write_timeout_ms: section.write_timeout_ms,
        }
    }
}

impl From<&SessionSection> for DriverTimeouts {
    fn from(section: &SessionSection) -> Self {
        Self {
            probe: millis_to_duration(section.probe_timeout_ms),
            open: millis_to_duration(section.open_timeout_ms),
            command: millis_to_duration(section.command_timeout_ms),
        }
    }
}

impl From<&ReconnectSection> for ReconnectPolicy {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            initial_delay: millis_to_duration(section.initial_delay_ms),
            max_delay: millis_to_duration(section.max_delay_ms),
            jitter: millis_to_duration(section.jitter_ms),
            max_attempts: section.max_attempts,
        }
    }
}

impl From<&HeartbeatSection> for HeartbeatConfig {
    fn from(section: &HeartbeatSection) -> Self {
        Self {
            endpoint: section.endpoint.clone(),
            interval: millis_to_duration(section.interval_ms),
            timeout: millis_to_duration(section.timeout_ms),
            max_missed: section.max_missed.max(1),
        }
    }
}

impl SessionOptions {
    /// Session options from the `[transport]` and `[session]` sections
    pub fn from_config(config: &Config) -> Self {
        Self {
            command_timeout: millis_to_duration(config.session.command_timeout_ms),
            write_timeout: millis_to_duration(config.transport.write_timeout_ms),
            read_timeout: millis_to_duration(config.transport.read_timeout_ms),
            read_chunk: config.session.read_chunk.max(1),
            fault_threshold: config.session.fault_threshold.max(1),
            ..Self::default()
        }
    }
}

impl SupervisorOptions {
    /// Supervisor options from the whole configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            device_id: None,
            reconnect: ReconnectPolicy::from(&config.reconnect),
            heartbeat: config
                .heartbeat
                .enabled
                .then(|| HeartbeatConfig::from(&config.heartbeat)),
            session: SessionOptions::from_config(config),
            telemetry_capacity: config.telemetry.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_defaults_line_up() {
        let config = Config::default();
        assert_eq!(ReconnectPolicy::from(&config.reconnect), ReconnectPolicy::default());
        assert_eq!(DriverTimeouts::from(&config.session), DriverTimeouts::default());
        assert_eq!(TransportTimeouts::from(&config.transport), TransportTimeouts::default());

        let options = SupervisorOptions::from_config(&config);
        assert!(options.heartbeat.is_none());
        assert_eq!(options.session.command_timeout, Duration::from_millis(2000));
        assert_eq!(options.telemetry_capacity, 4096);
    }

    #[test]
    fn test_heartbeat_enabled_from_config() {
        let mut config = Config::default();
        config.heartbeat.enabled = true;
        config.heartbeat.interval_ms = 250;
        config.heartbeat.max_missed = 0;

        let heartbeat = SupervisorOptions::from_config(&config).heartbeat.unwrap();
        assert_eq!(heartbeat.endpoint, "ping");
        assert_eq!(heartbeat.interval, Duration::from_millis(250));
        assert_eq!(heartbeat.max_missed, 1);
    }
}
