/*!
 * Prelude module for Boardlink Core.
 *
 * Re-exports the types most callers need in one import.
 */

pub use crate::error::{Error, Result};

pub use crate::types::{Id, Value};

pub use crate::event::{EventBus, EventReceiver, SharedEventBus};

pub use crate::config::{Config, ConfigBuilder, SharedConfig};

pub use crate::telemetry::{
    RingBuffer, SampleValue, Snapshot, TelemetryRingBuffer, TelemetrySample,
};

pub use crate::utils::{duration_to_millis, millis_to_duration, spawn_and_log, with_timeout};

pub use tracing::{debug, error, info, trace, warn};

pub use crate::init;
