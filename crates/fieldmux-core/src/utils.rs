/*!
 * Async helpers shared by the fieldmux crates.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::error::Error;

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `operation` - Name of the operation, used in the timeout message
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or [`Error::Timeout`] converted into the
/// caller's error type if the timeout is reached
pub async fn with_timeout<F, T, E>(duration: Duration, operation: &str, future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<Error>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!("{} timed out after {:?}", operation, duration)).into()),
    }
}

/// Create a task that runs in the background and logs any errors
///
/// # Arguments
///
/// * `name` - A name for the task (for logging)
/// * `fut` - The future to run
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
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

/// Milliseconds elapsed since `start`, with sub-millisecond precision
pub fn elapsed_millis(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), "op", async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), "slow read", async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, Error>(42)
        })
        .await;
        match result {
            Err(Error::Timeout(msg)) => assert!(msg.starts_with("slow read timed out")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_and_log_runs_to_completion() {
        let handle = spawn_and_log("failing", async { Err::<(), _>(Error::other("nope")) });
        assert!(handle.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_millis() {
        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(250)).await;
        let ms = elapsed_millis(start);
        assert!((250.0..260.0).contains(&ms));
    }
}
