//! Readiness polling: waits for `/tmp/.sandbox_ready` to appear inside a
//! freshly started container.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::docker::{ContainerRuntime, RuntimeState};
use crate::error::Result;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const READY_DEADLINE: Duration = Duration::from_secs(120);
const READY_MARKER: &str = "/tmp/.sandbox_ready";

pub enum ReadinessOutcome {
    Ready,
    Failed,
}

pub async fn wait_until_ready(driver: &dyn ContainerRuntime, container_id: &str) -> Result<ReadinessOutcome> {
    poll_until_ready(driver, container_id, POLL_INTERVAL, READY_DEADLINE).await
}

/// The poll loop itself, with interval and deadline as parameters so tests
/// can exercise the timeout boundary without waiting 120 real seconds.
async fn poll_until_ready(
    driver: &dyn ContainerRuntime,
    container_id: &str,
    poll_interval: Duration,
    ready_deadline: Duration,
) -> Result<ReadinessOutcome> {
    let deadline = Instant::now() + ready_deadline;
    let mut ticker = tokio::time::interval(poll_interval);

    loop {
        ticker.tick().await;

        if Instant::now() >= deadline {
            debug!(container_id, "readiness deadline reached");
            return Ok(ReadinessOutcome::Failed);
        }

        let inspection = match driver.inspect(container_id).await {
            Ok(i) => i,
            Err(_) => return Ok(ReadinessOutcome::Failed),
        };

        if matches!(inspection.state, RuntimeState::Exited | RuntimeState::Dead) {
            return Ok(ReadinessOutcome::Failed);
        }

        match driver.probe_file_exists(container_id, READY_MARKER).await {
            Ok(true) => return Ok(ReadinessOutcome::Ready),
            Ok(false) => continue,
            Err(_) => return Ok(ReadinessOutcome::Failed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::test_support::FakeDriver;

    #[tokio::test]
    async fn ready_as_soon_as_marker_probe_succeeds() {
        let driver = FakeDriver::new();
        driver.set_running();
        driver.set_probe_result(true);

        let outcome = poll_until_ready(&driver, "c1", Duration::from_millis(5), Duration::from_millis(200)).await.unwrap();
        assert!(matches!(outcome, ReadinessOutcome::Ready));
    }

    #[tokio::test]
    async fn exited_container_fails_readiness_immediately() {
        let driver = FakeDriver::new();
        driver.set_state(RuntimeState::Exited);

        let outcome = poll_until_ready(&driver, "c1", Duration::from_millis(5), Duration::from_millis(200)).await.unwrap();
        assert!(matches!(outcome, ReadinessOutcome::Failed));
    }

    #[tokio::test]
    async fn deadline_reached_without_marker_fails() {
        let driver = FakeDriver::new();
        driver.set_running();
        driver.set_probe_result(false);

        let outcome = poll_until_ready(&driver, "c1", Duration::from_millis(5), Duration::from_millis(20)).await.unwrap();
        assert!(matches!(outcome, ReadinessOutcome::Failed));
    }

    #[tokio::test]
    async fn driver_error_during_poll_fails_readiness() {
        let driver = FakeDriver::new();
        driver.fail_inspect();

        let outcome = poll_until_ready(&driver, "c1", Duration::from_millis(5), Duration::from_millis(200)).await.unwrap();
        assert!(matches!(outcome, ReadinessOutcome::Failed));
    }
}
