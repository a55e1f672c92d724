//! Bounded reconnect poll used while a device reboots.

use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{ConnectRequest, Connector};
use crate::error::{Result, UpgradeError};

/// Shortest poll interval honoured; smaller values are raised to this.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to keep probing a rebooting device, and how often.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Total window, measured from the first attempt.
    pub max_wait: Duration,

    /// Spacing between attempt start times.
    pub poll_interval: Duration,
}

impl ReconnectPolicy {
    /// Create a policy.
    pub fn new(max_wait: Duration, poll_interval: Duration) -> Self {
        Self {
            max_wait,
            poll_interval,
        }
    }

    /// Upper bound on the number of attempts made within `max_wait`.
    pub fn max_attempts(&self) -> u32 {
        let poll = self.poll_interval.max(MIN_POLL_INTERVAL).as_nanos();
        self.max_wait.as_nanos().div_ceil(poll) as u32
    }
}

/// Poll `connector` until a session opens or `policy.max_wait` elapses.
///
/// Attempts are scheduled at `start + k * poll_interval`; an attempt that runs
/// long delays the next one rather than stacking them up. Every failure
/// counts as an attempt, including rejected credentials and a shell that
/// never shows its prompt. When the window closes the last error is
/// carried in [`UpgradeError::ReconnectTimeout`].
pub async fn wait_for_reconnect<C: Connector>(
    connector: &C,
    request: &ConnectRequest<'_>,
    policy: &ReconnectPolicy,
) -> Result<C::Session> {
    let start = Instant::now();
    let deadline = start + policy.max_wait;
    let poll = policy.poll_interval.max(MIN_POLL_INTERVAL);

    let mut attempts = 0u32;
    let mut last_error = None;
    let mut next_attempt = start;

    info!(
        "waiting up to {:?} for {} (poll every {:?})",
        policy.max_wait, request.host, poll
    );

    loop {
        if next_attempt >= deadline || Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep_until(next_attempt).await;

        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = ConnectRequest {
            timeout: request.timeout.min(remaining),
            ..*request
        };

        match connector.connect(&attempt).await {
            Ok(session) => {
                info!(
                    "{} reachable after {:?} ({} attempts)",
                    request.host,
                    start.elapsed(),
                    attempts
                );
                return Ok(session);
            }
            Err(e) => {
                debug!("{}: attempt {} failed: {}", request.host, attempts, e);
                last_error = Some(e.to_string());
            }
        }

        next_attempt += poll;
    }

    Err(UpgradeError::ReconnectTimeout {
        waited: start.elapsed(),
        attempts,
        last_error,
    }
    .into())
}
