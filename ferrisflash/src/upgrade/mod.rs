//! Upgrade orchestration.
//!
//! An [`Orchestrator`] takes a [`DeviceTarget`] through
//! connect, gather, backup, upload, flash, reboot, verify and restore,
//! recording each step in an [`UpgradeRun`] and reporting an
//! [`UpgradeResult`].
//!
//! ```text
//! INIT -> CONNECTING_INITIAL -> GATHERING_INFO -> BACKING_UP -> UPLOADING
//!      -> FLASHING -> AWAITING_REBOOT -> RECONNECTING_UPGRADED -> VERIFYING
//!      -> [RESTORING] -> SUCCEEDED
//! ```
//!
//! Any non-terminal state may move to `FAILED`.

mod builder;
mod config;
mod orchestrator;
mod result;
mod state;

pub use builder::{DeviceTarget, TargetBuilder};
pub use config::{RetryPolicy, UpgradeOptions};
pub use orchestrator::Orchestrator;
pub use result::UpgradeResult;
pub use state::{StepAttempts, UpgradeRun, UpgradeState};
