//! Comtrend VR-3071v2 driver.

use std::time::Duration;

use log::info;
use regex::bytes::Regex;

use super::{Flash, await_flash_ack, flash_markers};
use crate::channel::MarkerSet;
use crate::device::{ConfigBackup, DeviceInfo, DeviceUpgrader, Dialect, Model, RebootProfile};
use crate::error::{ChannelError, DeviceError, Error, Result, UpgradeError};
use crate::image::{StagedImage, TransferMethod};
use crate::session::Shell;

const PROMPT: &str = r"(?m)^[\w.\-@]{0,63}>\s?$";

const DEFAULT_TFTP_PORT: u16 = 69;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Failed,
    Written,
}

/// Comtrend VR-3071v2.
///
/// `tftp -g -t i` fetches the image and writes it to flash in one step;
/// `restoredefault` then reboots into it. The CLI has no configuration
/// export, so configuration is lost across the upgrade. Its `tftp` takes no
/// port argument, so images must be served on port 69.
#[derive(Debug, Clone)]
pub struct ComtrendVr3071v2 {
    dialect: Dialect,
    transfer: MarkerSet<Transfer>,
    flash: MarkerSet<Flash>,
}

impl ComtrendVr3071v2 {
    /// Create the driver.
    pub fn new() -> Self {
        let dialect = Dialect::new(PROMPT)
            .unwrap()
            .with_failure_pattern("Invalid command")
            .with_failure_pattern("command not found");

        let transfer = MarkerSet::new(&[
            (Transfer::Failed, r"(?i)error|fail|timeout|not found|invalid"),
            (Transfer::Written, r"(?i)success|complete|flashed|done"),
        ])
        .unwrap();

        Self {
            dialect,
            transfer,
            flash: flash_markers(
                r"(?i)[^\n]*(?:invalid|error|fail)[^\n]*\n",
                r"(?i)restoring|rebooting|please wait|system will",
                PROMPT,
            ),
        }
    }

    fn transfer_failure_line<'a>(&self, output: &'a str) -> Option<&'a str> {
        output
            .lines()
            .map(str::trim)
            .find(|line| self.transfer.classify(line) == Some(Transfer::Failed))
    }

    fn backup_unsupported(&self) -> DeviceError {
        DeviceError::BackupUnsupported {
            model: self.model().to_string(),
        }
    }
}

impl Default for ComtrendVr3071v2 {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceUpgrader for ComtrendVr3071v2 {
    fn model(&self) -> Model {
        Model::ComtrendVr3071v2
    }

    fn prompt(&self) -> &Regex {
        self.dialect.prompt()
    }

    fn transfer_method(&self) -> TransferMethod {
        TransferMethod::Tftp
    }

    fn reboot_profile(&self) -> RebootProfile {
        RebootProfile {
            settle: Duration::from_secs(30),
            max_wait: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
        }
    }

    async fn gather_info<S: Shell>(&self, shell: &mut S, timeout: Duration) -> Result<DeviceInfo> {
        let version = self.read_version(shell, timeout).await?;
        Ok(DeviceInfo {
            firmware_version: Some(version),
            ..Default::default()
        })
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
        if image.port != DEFAULT_TFTP_PORT {
            return Err(UpgradeError::InvalidTarget {
                reason: format!(
                    "{} can only fetch from TFTP port {}, image is served on {}",
                    self.model(),
                    DEFAULT_TFTP_PORT,
                    image.port
                ),
            }
            .into());
        }

        let command = format!("tftp -g -t i -f {} {}", image.file_name, image.host);

        // Writing flash takes most of the transfer window and prints nothing
        // until the CLI returns.
        let response = match self.dialect.exec(shell, &command, timeout).await {
            Ok(response) => response,
            Err(Error::Channel(ChannelError::PatternTimeout { partial, .. })) => {
                shell.close().await?;
                return Err(DeviceError::Transfer {
                    message: format!("no response within {:?}: {}", timeout, partial.trim()),
                }
                .into());
            }
            Err(e) => return Err(e),
        };

        if let Some(message) = response.failure_message {
            return Err(DeviceError::Transfer { message }.into());
        }
        match self.transfer.classify(&response.result) {
            Some(Transfer::Failed) => Err(DeviceError::Transfer {
                message: self
                    .transfer_failure_line(&response.result)
                    .unwrap_or(response.result.trim())
                    .to_string(),
            }
            .into()),
            Some(Transfer::Written) => {
                info!("image {} written by tftp", image.file_name);
                Ok(())
            }
            None => Err(DeviceError::Transfer {
                message: format!(
                    "tftp returned without confirming the image was written: {}",
                    response.result.trim().lines().last().unwrap_or_default()
                ),
            }
            .into()),
        }
    }

    async fn trigger_flash<S: Shell>(&self, shell: &mut S, timeout: Duration) -> Result<()> {
        await_flash_ack(shell, "restoredefault", &self.flash, timeout).await
    }

    async fn read_version<S: Shell>(&self, shell: &mut S, timeout: Duration) -> Result<String> {
        let response = self.dialect.exec_ok(shell, "swversion show", timeout).await?;
        response
            .lines()
            .map(|line| match line.split_once(':') {
                Some((_, value)) => value.trim(),
                None => line.trim(),
            })
            .find(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                DeviceError::VersionUnreadable {
                    command: "swversion show".into(),
                }
                .into()
            })
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::image::ValidatedImage;
    use crate::session::script::ScriptedShell;

    async fn ready(shell: ScriptedShell) -> ScriptedShell {
        let mut shell = shell;
        shell
            .read_until(ComtrendVr3071v2::new().prompt(), Duration::from_secs(1))
            .await
            .unwrap();
        shell
    }

    fn staged() -> StagedImage {
        staged_on("192.168.1.100:69")
    }

    fn staged_on(addr: &str) -> StagedImage {
        StagedImage::external(
            TransferMethod::Tftp,
            addr.parse().unwrap(),
            &ValidatedImage {
                path: "/fw/vr3071v2.img".into(),
                file_name: "vr3071v2.img".into(),
                size: 1,
                sha256: String::new(),
            },
        )
    }

    #[test]
    fn test_prompt() {
        let driver = ComtrendVr3071v2::new();
        assert!(driver.prompt().is_match(b"> "));
        assert!(driver.prompt().is_match(b"Comtrend> "));
        assert!(!driver.prompt().is_match(b"root@VR-3071:~# "));
    }

    #[tokio::test]
    async fn test_version_only_info() {
        let driver = ComtrendVr3071v2::new();
        let mut shell =
            ready(ScriptedShell::new("> ").on("swversion show", "Software version: 2.0.4-ct")).await;

        let info = driver
            .gather_info(&mut shell, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(info.firmware_version.as_deref(), Some("2.0.4-ct"));
        assert!(info.serial_number.is_none());
    }

    #[tokio::test]
    async fn test_backup_unsupported() {
        let driver = ComtrendVr3071v2::new();
        let mut shell = ready(ScriptedShell::new("> ")).await;
        let err = driver
            .backup_config(&mut shell, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackupUnsupported);
    }

    #[tokio::test]
    async fn test_upload_and_flash() {
        let driver = ComtrendVr3071v2::new();
        let mut shell = ready(
            ScriptedShell::new("> ")
                .on("tftp -g -t i -f vr3071v2.img 192.168.1.100", "Image flashed successfully")
                .on_hangup("restoredefault", "Restoring default settings and rebooting...\r\n"),
        )
        .await;

        driver
            .upload_image(&mut shell, &staged(), Duration::from_secs(5))
            .await
            .unwrap();
        driver
            .trigger_flash(&mut shell, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upload_failure() {
        let driver = ComtrendVr3071v2::new();
        let mut shell = ready(
            ScriptedShell::new("> ").on("tftp", "tftp: timeout waiting for 192.168.1.100"),
        )
        .await;

        let err = driver
            .upload_image(&mut shell, &staged(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transfer);
        assert!(err.to_string().contains("timeout waiting"));
    }

    #[tokio::test]
    async fn test_retry_reads_its_own_output() {
        let driver = ComtrendVr3071v2::new();
        let mut shell = ready(
            ScriptedShell::new("> ")
                .buffered()
                .on("tftp", "tftp: timeout waiting for 192.168.1.100")
                .on("tftp", "tftp: timeout waiting for 192.168.1.100")
                .on("tftp", "Image flashed successfully")
                .on_hangup("restoredefault", "Restoring default settings and rebooting...\r\n"),
        )
        .await;

        for _ in 0..2 {
            let err = driver
                .upload_image(&mut shell, &staged(), Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(err.to_string().contains("timeout waiting"));
        }
        driver
            .upload_image(&mut shell, &staged(), Duration::from_secs(5))
            .await
            .unwrap();
        driver
            .trigger_flash(&mut shell, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bare_prompt_is_not_success() {
        let driver = ComtrendVr3071v2::new();
        let mut shell = ready(ScriptedShell::new("> ").buffered().on("tftp", "")).await;

        let err = driver
            .upload_image(&mut shell, &staged(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transfer);
        assert!(err.to_string().contains("without confirming"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_transfer_drops_session() {
        let driver = ComtrendVr3071v2::new();
        let mut shell = ready(ScriptedShell::new("> ").on_raw("tftp", "Getting image...")).await;

        let err = driver
            .upload_image(&mut shell, &staged(), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transfer);
        assert!(!shell.is_open());
    }

    #[tokio::test]
    async fn test_rejects_non_default_tftp_port() {
        let driver = ComtrendVr3071v2::new();
        let mut shell = ready(ScriptedShell::new("> ")).await;

        let err = driver
            .upload_image(&mut shell, &staged_on("192.168.1.100:6969"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTarget);
        assert!(!err.is_transient());
        assert!(err.to_string().contains("6969"));
    }
}
