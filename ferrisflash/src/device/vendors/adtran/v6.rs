//! ADTRAN 834v6 driver.

use std::time::Duration;

use regex::bytes::Regex;

use super::AdtranCli;
use crate::device::{ConfigBackup, DeviceInfo, DeviceUpgrader, Model, RebootProfile};
use crate::error::{DeviceError, Result};
use crate::image::{StagedImage, TransferMethod};
use crate::session::Shell;

/// LAN address the 834v6 comes back on once the new firmware boots.
pub const POST_UPGRADE_HOST: &str = "172.16.192.1";

/// ADTRAN 834v6.
///
/// Upgrades with `upgrade <url>`. The CLI has no configuration export, and
/// the new firmware re-addresses the LAN to [`POST_UPGRADE_HOST`].
#[derive(Debug, Clone)]
pub struct Adtran834v6 {
    cli: AdtranCli,
}

impl Adtran834v6 {
    /// Create the driver.
    pub fn new() -> Self {
        Self {
            cli: AdtranCli::new(),
        }
    }

    fn backup_unsupported(&self) -> DeviceError {
        DeviceError::BackupUnsupported {
            model: self.model().to_string(),
        }
    }
}

impl Default for Adtran834v6 {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceUpgrader for Adtran834v6 {
    fn model(&self) -> Model {
        Model::Adtran834v6
    }

    fn prompt(&self) -> &Regex {
        self.cli.dialect.prompt()
    }

    fn transfer_method(&self) -> TransferMethod {
        TransferMethod::Http
    }

    fn reboot_profile(&self) -> RebootProfile {
        RebootProfile {
            settle: Duration::from_secs(30),
            max_wait: Duration::from_secs(420),
            poll_interval: Duration::from_secs(15),
        }
    }

    fn post_upgrade_host(&self) -> Option<&'static str> {
        Some(POST_UPGRADE_HOST)
    }

    async fn gather_info<S: Shell>(&self, shell: &mut S, timeout: Duration) -> Result<DeviceInfo> {
        self.cli.gather_info(shell, timeout).await
    }

    async fn backup_config<S: Shell>(
        &self,
        _shell: &mut S,
        _timeout: Duration,
    ) -> Result<ConfigBackup> {
        Err(self.backup_unsupported().into())
    }

    async fn upload_image<S: Shell>(
        &self,
        shell: &mut S,
        image: &StagedImage,
        timeout: Duration,
    ) -> Result<()> {
        let command = format!("upgrade {}", image.url());
        self.cli.fetch_image(shell, &command, timeout).await
    }

    async fn trigger_flash<S: Shell>(&self, shell: &mut S, timeout: Duration) -> Result<()> {
        self.cli.confirm_flash(shell, timeout).await
    }

    async fn read_version<S: Shell>(&self, shell: &mut S, timeout: Duration) -> Result<String> {
        self.cli.read_version(shell, timeout).await
    }

    async fn restore_config<S: Shell>(
        &self,
        _shell: &mut S,
        _backup: &ConfigBackup,
        _timeout: Duration,
    ) -> Result<()> {
        Err(self.backup_unsupported().into())
    }
}
