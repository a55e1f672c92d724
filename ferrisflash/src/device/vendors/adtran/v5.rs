//! ADTRAN 834v5 driver.

use std::time::Duration;

use log::{debug, info};
use regex::bytes::Regex;

use super::AdtranCli;
use crate::device::{ConfigBackup, DeviceInfo, DeviceUpgrader, Model, RebootProfile};
use crate::error::{DeviceError, Result};
use crate::image::{StagedImage, TransferMethod};
use crate::session::Shell;

/// ADTRAN 834v5.
///
/// Upgrades with `upgrade firmware <url>`. The running configuration is
/// captured with `show config` and replayed line by line in configuration
/// mode after the reboot.
#[derive(Debug, Clone)]
pub struct Adtran834v5 {
    cli: AdtranCli,
}

impl Adtran834v5 {
    /// Create the driver.
    pub fn new() -> Self {
        Self {
            cli: AdtranCli::new(),
        }
    }
}

impl Default for Adtran834v5 {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceUpgrader for Adtran834v5 {
    fn model(&self) -> Model {
        Model::Adtran834v5
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
            max_wait: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
        }
    }

    async fn gather_info<S: Shell>(&self, shell: &mut S, timeout: Duration) -> Result<DeviceInfo> {
        self.cli.gather_info(shell, timeout).await
    }

    async fn backup_config<S: Shell>(
        &self,
        shell: &mut S,
        timeout: Duration,
    ) -> Result<ConfigBackup> {
        let response = self
            .cli
            .dialect
            .exec_ok(shell, "show config", timeout)
            .await?;
        if response.result.trim().is_empty() {
            return Err(DeviceError::UnexpectedOutput {
                command: "show config".into(),
                output: String::new(),
            }
            .into());
        }
        Ok(ConfigBackup::new(self.model(), response.result))
    }

    async fn upload_image<S: Shell>(
        &self,
        shell: &mut S,
        image: &StagedImage,
        timeout: Duration,
    ) -> Result<()> {
        let command = format!("upgrade firmware {}", image.url());
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
        shell: &mut S,
        backup: &ConfigBackup,
        timeout: Duration,
    ) -> Result<()> {
        let dialect = &self.cli.dialect;
        let text = backup.as_text();

        dialect.exec_ok(shell, "configure terminal", timeout).await?;

        let mut applied = 0;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('!') {
                continue;
            }
            dialect.exec_ok(shell, line, timeout).await?;
            applied += 1;
        }
        debug!("replayed {} configuration lines", applied);

        dialect.exec_ok(shell, "end", timeout).await?;
        dialect.exec_ok(shell, "write memory", timeout).await?;
        info!("configuration restored ({} lines)", applied);
        Ok(())
    }
}
