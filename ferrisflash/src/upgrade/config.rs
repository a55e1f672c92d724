//! Options that shape an upgrade run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::RebootProfile;
use crate::session::ReconnectPolicy;

/// Bounded retries for the steps that tolerate transient failures.
///
/// Counts are total attempts, so `upload_attempts = 3` allows two retries.
/// Backoff between attempts is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts to open a session outside the reboot poll.
    pub connect_attempts: u32,

    /// Attempts at `upload_image`.
    pub upload_attempts: u32,

    /// Attempts at `restore_config`.
    pub restore_attempts: u32,

    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            upload_attempts: 3,
            restore_attempts: 3,
            backoff: Duration::from_secs(10),
        }
    }
}

/// Timeouts and overrides for an upgrade run.
///
/// Every field has a default, so an empty document deserializes to
/// [`UpgradeOptions::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeOptions {
    /// Bound on opening a session and seeing the first prompt.
    pub connect_timeout: Duration,

    /// Bound on an ordinary command round trip.
    pub command_timeout: Duration,

    /// Bound on the device fetching the image.
    pub transfer_timeout: Duration,

    /// Retry limits.
    pub retry: RetryPolicy,

    /// Overrides the driver's quiet period after the flash is acknowledged.
    pub settle: Option<Duration>,

    /// Overrides how long to wait for the device to come back.
    pub reboot_wait: Option<Duration>,

    /// Overrides the spacing between reconnect attempts.
    pub poll_interval: Option<Duration>,

    /// Firmware version the image is known to carry.
    pub expected_version: Option<String>,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            settle: None,
            reboot_wait: None,
            poll_interval: None,
            expected_version: None,
        }
    }
}

impl UpgradeOptions {
    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the reboot wait window.
    pub fn reboot_wait(mut self, wait: Duration) -> Self {
        self.reboot_wait = Some(wait);
        self
    }

    /// Require the device to report `version` after the upgrade.
    pub fn expected_version(mut self, version: impl Into<String>) -> Self {
        self.expected_version = Some(version.into());
        self
    }

    /// Settle delay for a driver's profile, with overrides applied.
    pub fn settle_for(&self, profile: &RebootProfile) -> Duration {
        self.settle.unwrap_or(profile.settle)
    }

    /// Reconnect policy for a driver's profile, with overrides applied.
    pub fn reconnect_policy(&self, profile: &RebootProfile) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.reboot_wait.unwrap_or(profile.max_wait),
            self.poll_interval.unwrap_or(profile.poll_interval),
        )
    }
}
