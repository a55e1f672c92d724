//! Comtrend VR-3071 driver.

use std::time::Duration;

use log::{debug, info};
use regex::bytes::Regex;

use super::{Flash, await_flash_ack, flash_markers};
use crate::channel::MarkerSet;
use crate::device::info::value_after;
use crate::device::{ConfigBackup, DeviceInfo, DeviceUpgrader, Dialect, Model, RebootProfile};
use crate::error::{DeviceError, Result};
use crate::image::{StagedImage, TransferMethod};
use crate::session::Shell;

const PROMPT: &str = r"(?m)^[\w.\-@:~/\[\] ]{0,63}[#$]\s?$";

/// Where the image is staged on the device before `sysupgrade`.
const STAGED_PATH: &str = "/tmp/firmware.bin";

/// Scratch file for configuration restore.
const RESTORE_PATH: &str = "/tmp/restore.uci";

const DEFAULT_TFTP_PORT: u16 = 69;

/// Comtrend VR-3071.
///
/// Fetches the image into `/tmp` with busybox `tftp`, checks its size (and
/// checksum where `sha256sum` exists) and flashes it with `sysupgrade`.
/// Configuration round-trips through `uci export` / `uci import`.
#[derive(Debug, Clone)]
pub struct ComtrendVr3071 {
    dialect: Dialect,
    transfer_failed: Regex,
    flash: MarkerSet<Flash>,
    restore_done: Regex,
}

impl ComtrendVr3071 {
    /// Create the driver.
    pub fn new() -> Self {
        let dialect = Dialect::new(PROMPT)
            .unwrap()
            .with_failure_pattern("not found")
            .with_failure_pattern("No such file")
            .with_failure_pattern("Permission denied")
            .with_failure_pattern("can't");

        Self {
            dialect,
            transfer_failed: Regex::new(r"(?i)tftp: |error|timeout|fail").unwrap(),
            flash: flash_markers(
                r"(?i)[^\n]*(?:invalid|not supported|error|fail|no such file)[^\n]*\n",
                r"(?i)commencing|upgrading|writing|flashing|rebooting",
                PROMPT,
            ),
            restore_done: Regex::new(r"(?m)^RESTORE_(?:OK|FAILED)").unwrap(),
        }
    }

    async fn check_staged_size<S: Shell>(
        &self,
        shell: &mut S,
        expected: u64,
        timeout: Duration,
    ) -> Result<()> {
        let command = format!("wc -c < {}", STAGED_PATH);
        let response = self.dialect.exec_ok(shell, &command, timeout).await?;
        let actual: u64 = response
            .result
            .trim()
            .parse()
            .map_err(|_| DeviceError::Transfer {
                message: format!("could not read staged size: {}", response.result.trim()),
            })?;

        if actual != expected {
            return Err(DeviceError::Transfer {
                message: format!("device has {} bytes, expected {}", actual, expected),
            }
            .into());
        }
        Ok(())
    }

    async fn check_staged_checksum<S: Shell>(
        &self,
        shell: &mut S,
        expected: &str,
        timeout: Duration,
    ) -> Result<()> {
        let command = format!("sha256sum {}", STAGED_PATH);
        let response = self.dialect.exec(shell, &command, timeout).await?;
        let reported = response
            .result
            .split_whitespace()
            .next()
            .filter(|digest| digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()));

        match reported {
            Some(digest) if !digest.eq_ignore_ascii_case(expected) => Err(DeviceError::Transfer {
                message: format!("checksum mismatch: device reports {}", digest),
            }
            .into()),
            Some(_) => Ok(()),
            None => {
                debug!("sha256sum unavailable, skipping checksum check");
                Ok(())
            }
        }
    }
}

impl Default for ComtrendVr3071 {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceUpgrader for ComtrendVr3071 {
    fn model(&self) -> Model {
        Model::ComtrendVr3071
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
            max_wait: Duration::from_secs(240),
            poll_interval: Duration::from_secs(10),
        }
    }

    async fn gather_info<S: Shell>(&self, shell: &mut S, timeout: Duration) -> Result<DeviceInfo> {
        let mut info = DeviceInfo::default();

        let cmdline = self.dialect.exec_ok(shell, "cat /proc/cmdline", timeout).await?;
        info.model = parse_cmdline_model(&cmdline.result);

        if let Ok(mfg) = self.dialect.exec_ok(shell, "cat /proc/mfg", timeout).await {
            info.merge(parse_mfg(&mfg.result));
        }
        if let Ok(wireless) = self
            .dialect
            .exec_ok(shell, "cat /etc/config/wireless", timeout)
            .await
        {
            info.merge(parse_wireless(&wireless.result));
        }
        if let Ok(version) = self.read_version(shell, timeout).await {
            info.firmware_version = Some(version);
        }

        Ok(info)
    }

    async fn backup_config<S: Shell>(
        &self,
        shell: &mut S,
        timeout: Duration,
    ) -> Result<ConfigBackup> {
        let response = self.dialect.exec_ok(shell, "uci export", timeout).await?;
        if !response.result.contains("package ") {
            return Err(DeviceError::UnexpectedOutput {
                command: "uci export".into(),
                output: response.result,
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
        let mut command = format!(
            "tftp -g -l {} -r {} {}",
            STAGED_PATH, image.file_name, image.host
        );
        if image.port != DEFAULT_TFTP_PORT {
            command.push_str(&format!(" {}", image.port));
        }

        let response = self.dialect.exec(shell, &command, timeout).await?;
        if let Some(m) = self.transfer_failed.find(response.result.as_bytes()) {
            let line = response.result[m.start()..]
                .lines()
                .next()
                .unwrap_or_default()
                .trim()
                .to_string();
            return Err(DeviceError::Transfer { message: line }.into());
        }
        if let Some(message) = &response.failure_message {
            return Err(DeviceError::Transfer {
                message: message.clone(),
            }
            .into());
        }

        self.check_staged_size(shell, image.size, timeout).await?;
        self.check_staged_checksum(shell, &image.sha256, timeout).await?;
        info!("image staged at {} ({} bytes)", STAGED_PATH, image.size);
        Ok(())
    }

    async fn trigger_flash<S: Shell>(&self, shell: &mut S, timeout: Duration) -> Result<()> {
        let command = format!("sysupgrade {}", STAGED_PATH);
        await_flash_ack(shell, &command, &self.flash, timeout).await
    }

    async fn read_version<S: Shell>(&self, shell: &mut S, timeout: Duration) -> Result<String> {
        let response = self.dialect.exec_ok(shell, "cat /etc/version", timeout).await?;
        response
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                DeviceError::VersionUnreadable {
                    command: "cat /etc/version".into(),
                }
                .into()
            })
    }

    async fn restore_config<S: Shell>(
        &self,
        shell: &mut S,
        backup: &ConfigBackup,
        timeout: Duration,
    ) -> Result<()> {
        // Heredoc lines are written blind; the device only answers with
        // continuation prompts until the terminator.
        shell
            .send(&format!("cat > {} <<'UCI_EOF'", RESTORE_PATH))
            .await?;
        for line in backup.as_text().lines() {
            shell.send(line).await?;
        }
        shell.send("UCI_EOF").await?;

        // Quoting splits the markers so the echoed command never matches
        shell
            .send(&format!(
                "uci import < {} && uci commit && echo RESTORE_\"\"OK || echo RESTORE_\"\"FAILED",
                RESTORE_PATH
            ))
            .await?;
        let output = shell.read_until(&self.restore_done, timeout).await?;
        shell.read_until(self.dialect.prompt(), timeout).await?;

        if output.ends_with("RESTORE_OK") {
            info!("configuration restored via uci import");
            Ok(())
        } else {
            Err(DeviceError::CommandFailed {
                command: "uci import".into(),
                message: "import rejected".into(),
            }
            .into())
        }
    }
}

/// Extract `model=<name>` from the kernel command line.
fn parse_cmdline_model(cmdline: &str) -> Option<String> {
    cmdline
        .split_whitespace()
        .find_map(|token| token.strip_prefix("model="))
        .filter(|model| !model.is_empty())
        .map(str::to_string)
}

fn parse_mfg(output: &str) -> DeviceInfo {
    let mut info = DeviceInfo::default();
    for line in output.lines() {
        if line.contains("MFG_SERIAL") {
            info.serial_number = value_after(line, '=');
        } else if line.contains("MFG_MAC") {
            info.mac_address = value_after(line, '=');
        }
    }
    info
}

/// Pull the first `option ssid` / `option key` out of `/etc/config/wireless`.
fn parse_wireless(output: &str) -> DeviceInfo {
    let quoted = |line: &str| line.split('\'').nth(1).map(str::to_string);
    let mut info = DeviceInfo::default();
    for line in output.lines().map(str::trim) {
        if line.starts_with("option ssid") && info.wifi_ssid.is_none() {
            info.wifi_ssid = quoted(line);
        } else if line.starts_with("option key") && info.wifi_key.is_none() {
            info.wifi_key = quoted(line);
        }
    }
    info
}
