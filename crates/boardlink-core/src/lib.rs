/*!
 * Boardlink Core
 *
 * This crate provides the ambient pieces shared by every Boardlink crate:
 * configuration, logging, the event bus, core value types, async helpers and
 * the telemetry ring buffer.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod telemetry;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use bytes;
    pub use chrono;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// Boardlink core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("Boardlink Core {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
