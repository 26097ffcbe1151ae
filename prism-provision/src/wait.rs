//! Bounded polling helper

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Timeout and interval for a polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollConfig {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Run `probe` until it yields a value or the timeout elapses.
///
/// The probe always runs at least once. Returns `Ok(None)` on timeout;
/// errors from the probe end the loop immediately.
pub async fn poll_until<T, E, F, Fut>(poll: PollConfig, mut probe: F) -> Result<Option<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + poll.timeout;
    loop {
        if let Some(value) = probe().await? {
            return Ok(Some(value));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(poll.interval).await;
    }
}
