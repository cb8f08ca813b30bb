/*!
 * Utility functions and helpers for Boardlink.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// Returns the result of the future, or [`Error::Timeout`] naming `what`.
pub async fn with_timeout<F, T>(duration: Duration, what: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!("{} timed out after {:?}", what, duration))),
    }
}

/// Spawn a task that runs in the background and logs its outcome
///
/// The returned handle can be aborted; an aborted task logs nothing.
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => {
                debug!("Task '{}' completed successfully", task_name);
            }
            Err(e) => {
                warn!("Task '{}' failed: {}", task_name, e);
            }
        }
    })
}

/// Convert milliseconds to a Duration
pub fn millis_to_duration(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Convert a Duration to whole milliseconds, saturating at `u64::MAX`
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_timeout_success() {
        let result = tokio_test::block_on(with_timeout(Duration::from_secs(1), "answer", async {
            Ok::<_, Error>(42)
        }));
        assert_eq!(tokio_test::assert_ok!(result), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), "sleepy", async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, Error>(42)
        })
        .await;
        match result {
            Err(Error::Timeout(msg)) => assert!(msg.contains("sleepy")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_and_log_completes() {
        let handle = spawn_and_log("ok-task", async { Ok::<_, Error>(()) });
        assert!(handle.await.is_ok());

        let handle = spawn_and_log("failing-task", async { Err::<(), _>(Error::other("boom")) });
        assert!(handle.await.is_ok());
    }

    #[test]
    fn test_duration_conversions() {
        assert_eq!(duration_to_millis(Duration::from_millis(1234)), 1234);
        assert_eq!(millis_to_duration(1234), Duration::from_millis(1234));
    }
}
