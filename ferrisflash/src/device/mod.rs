//! Model drivers and the upgrader interface they share.
//!
//! Every supported gateway is a driver implementing [`DeviceUpgrader`].
//! The set of models is closed and known at build time, so drivers are
//! selected through the [`ModelDriver`] enum rather than trait objects;
//! the [`registry`] maps model identifiers to driver factories.
//!
//! Drivers never open connections themselves. The orchestrator hands them
//! a live [`Shell`] for each step and owns reconnects and retries.

mod dialect;
mod info;
pub mod registry;
pub mod vendors;

pub use dialect::Dialect;
pub use info::DeviceInfo;
pub use registry::{DeviceRegistry, DriverFactory};

use std::fmt;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::image::{StagedImage, TransferMethod};
use crate::session::{ReconnectPolicy, Shell};
use vendors::adtran::{Adtran834v5, Adtran834v6};
use vendors::comtrend::{ComtrendVr3071, ComtrendVr3071v2};

/// Supported gateway models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Model {
    /// ADTRAN 834-5.
    #[serde(rename = "adtran-834v5")]
    Adtran834v5,
    /// ADTRAN 834-6.
    #[serde(rename = "adtran-834v6")]
    Adtran834v6,
    /// Comtrend VR-3071.
    #[serde(rename = "comtrend-vr3071")]
    ComtrendVr3071,
    /// Comtrend VR-3071 v2.
    #[serde(rename = "comtrend-vr3071v2")]
    ComtrendVr3071v2,
}

impl Model {
    /// All supported models.
    pub const ALL: [Model; 4] = [
        Model::Adtran834v5,
        Model::Adtran834v6,
        Model::ComtrendVr3071,
        Model::ComtrendVr3071v2,
    ];

    /// Canonical identifier.
    pub fn id(&self) -> &'static str {
        match self {
            Model::Adtran834v5 => "adtran-834v5",
            Model::Adtran834v6 => "adtran-834v6",
            Model::ComtrendVr3071 => "comtrend-vr3071",
            Model::ComtrendVr3071v2 => "comtrend-vr3071v2",
        }
    }

    /// Marketing name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Model::Adtran834v5 => "ADTRAN 834v5",
            Model::Adtran834v6 => "ADTRAN 834v6",
            Model::ComtrendVr3071 => "Comtrend VR-3071",
            Model::ComtrendVr3071v2 => "Comtrend VR-3071v2",
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Timing of a model's flash-and-reboot cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootProfile {
    /// Quiet period after the flash is acknowledged, before the first reconnect attempt.
    pub settle: Duration,

    /// How long to keep probing for the device once settled.
    pub max_wait: Duration,

    /// Spacing between reconnect attempts.
    pub poll_interval: Duration,
}

impl RebootProfile {
    /// Reconnect policy for this profile.
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.max_wait, self.poll_interval)
    }
}

/// Configuration captured from a device before flashing.
///
/// Opaque to everything but the driver that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBackup {
    /// Model the backup was taken from.
    pub model: Model,

    /// Raw configuration text as the device printed it.
    pub data: Bytes,
}

impl ConfigBackup {
    /// Wrap captured configuration.
    pub fn new(model: Model, data: impl Into<Bytes>) -> Self {
        Self {
            model,
            data: data.into(),
        }
    }

    /// Configuration as text.
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// What counts as "upgraded" when reading the version back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionCheck<'a> {
    /// Version read before flashing, if it was readable.
    pub previous: Option<&'a str>,

    /// Version the new image is known to carry.
    pub expected: Option<&'a str>,
}

/// Outcome of [`DeviceUpgrader::verify_upgrade`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// Version the device reports now.
    pub version: String,

    /// Whether the [`VersionCheck`] accepted it.
    pub upgraded: bool,
}

impl VersionCheck<'_> {
    /// Decide whether `current` shows the upgrade took.
    ///
    /// An expected version must match exactly; otherwise the version must
    /// differ from the previous one. With neither known, any readable
    /// version passes.
    pub fn accepts(&self, current: &str) -> bool {
        let current = current.trim();
        match (self.expected, self.previous) {
            (Some(expected), _) => current == expected.trim(),
            (None, Some(previous)) => current != previous.trim(),
            (None, None) => !current.is_empty(),
        }
    }
}

/// Steps every model driver provides.
///
/// Each step takes the live shell for the current phase and a bound on how
/// long it may wait for the device. None of them reconnect or retry.
pub trait DeviceUpgrader: Send + Sync {
    /// Model this driver handles.
    fn model(&self) -> Model;

    /// Prompt that marks the shell as idle.
    fn prompt(&self) -> &Regex;

    /// How the device pulls its image.
    fn transfer_method(&self) -> TransferMethod;

    /// Flash and reboot timing.
    fn reboot_profile(&self) -> RebootProfile;

    /// Address the device answers on after the upgrade, if it moves.
    fn post_upgrade_host(&self) -> Option<&'static str> {
        None
    }

    /// Read model, firmware version and whatever else the CLI exposes.
    fn gather_info<S: Shell>(
        &self,
        shell: &mut S,
        timeout: Duration,
    ) -> impl Future<Output = Result<DeviceInfo>> + Send;

    /// Capture the running configuration.
    ///
    /// Fails with `BackupUnsupported` if the model has no backup command.
    fn backup_config<S: Shell>(
        &self,
        shell: &mut S,
        timeout: Duration,
    ) -> impl Future<Output = Result<ConfigBackup>> + Send;

    /// Have the device fetch `image`.
    ///
    /// Fails with a transfer error if the device reports a failure or a
    /// size mismatch.
    fn upload_image<S: Shell>(
        &self,
        shell: &mut S,
        image: &StagedImage,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Start flashing. Returns once the device has accepted the command,
    /// not once flashing completes.
    fn trigger_flash<S: Shell>(
        &self,
        shell: &mut S,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Read the running firmware version.
    fn read_version<S: Shell>(
        &self,
        shell: &mut S,
        timeout: Duration,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Read the version back and apply `check` to it.
    ///
    /// Errors if the version is unreadable. A readable version the check
    /// rejects is reported with `upgraded` unset.
    fn verify_upgrade<S: Shell>(
        &self,
        shell: &mut S,
        check: &VersionCheck<'_>,
        timeout: Duration,
    ) -> impl Future<Output = Result<Verification>> + Send {
        async move {
            let version = self.read_version(shell, timeout).await?;
            Ok(Verification {
                upgraded: check.accepts(&version),
                version,
            })
        }
    }

    /// Put a backup taken by [`backup_config`](Self::backup_config) back.
    fn restore_config<S: Shell>(
        &self,
        shell: &mut S,
        backup: &ConfigBackup,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Closed set of drivers, one variant per supported model.
#[derive(Debug, Clone)]
pub enum ModelDriver {
    /// ADTRAN 834v5.
    Adtran834v5(Adtran834v5),
    /// ADTRAN 834v6.
    Adtran834v6(Adtran834v6),
    /// Comtrend VR-3071.
    ComtrendVr3071(ComtrendVr3071),
    /// Comtrend VR-3071v2.
    ComtrendVr3071v2(ComtrendVr3071v2),
}

impl ModelDriver {
    /// Build the driver for `model`.
    pub fn for_model(model: Model) -> Self {
        match model {
            Model::Adtran834v5 => ModelDriver::Adtran834v5(Adtran834v5::new()),
            Model::Adtran834v6 => ModelDriver::Adtran834v6(Adtran834v6::new()),
            Model::ComtrendVr3071 => ModelDriver::ComtrendVr3071(ComtrendVr3071::new()),
            Model::ComtrendVr3071v2 => ModelDriver::ComtrendVr3071v2(ComtrendVr3071v2::new()),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $driver:ident => $body:expr) => {
        match $self {
            ModelDriver::Adtran834v5($driver) => $body,
            ModelDriver::Adtran834v6($driver) => $body,
            ModelDriver::ComtrendVr3071($driver) => $body,
            ModelDriver::ComtrendVr3071v2($driver) => $body,
        }
    };
}

impl DeviceUpgrader for ModelDriver {
    fn model(&self) -> Model {
        dispatch!(self, d => d.model())
    }

    fn prompt(&self) -> &Regex {
        dispatch!(self, d => d.prompt())
    }

    fn transfer_method(&self) -> TransferMethod {
        dispatch!(self, d => d.transfer_method())
    }

    fn reboot_profile(&self) -> RebootProfile {
        dispatch!(self, d => d.reboot_profile())
    }

    fn post_upgrade_host(&self) -> Option<&'static str> {
        dispatch!(self, d => d.post_upgrade_host())
    }

    async fn gather_info<S: Shell>(&self, shell: &mut S, timeout: Duration) -> Result<DeviceInfo> {
        dispatch!(self, d => d.gather_info(shell, timeout).await)
    }

    async fn backup_config<S: Shell>(
        &self,
        shell: &mut S,
        timeout: Duration,
    ) -> Result<ConfigBackup> {
        dispatch!(self, d => d.backup_config(shell, timeout).await)
    }

    async fn upload_image<S: Shell>(
        &self,
        shell: &mut S,
        image: &StagedImage,
        timeout: Duration,
    ) -> Result<()> {
        dispatch!(self, d => d.upload_image(shell, image, timeout).await)
    }

    async fn trigger_flash<S: Shell>(&self, shell: &mut S, timeout: Duration) -> Result<()> {
        dispatch!(self, d => d.trigger_flash(shell, timeout).await)
    }

    async fn read_version<S: Shell>(&self, shell: &mut S, timeout: Duration) -> Result<String> {
        dispatch!(self, d => d.read_version(shell, timeout).await)
    }

    async fn verify_upgrade<S: Shell>(
        &self,
        shell: &mut S,
        check: &VersionCheck<'_>,
        timeout: Duration,
    ) -> Result<Verification> {
        dispatch!(self, d => d.verify_upgrade(shell, check, timeout).await)
    }

    async fn restore_config<S: Shell>(
        &self,
        shell: &mut S,
        backup: &ConfigBackup,
        timeout: Duration,
    ) -> Result<()> {
        dispatch!(self, d => d.restore_config(shell, backup, timeout).await)
    }
}
