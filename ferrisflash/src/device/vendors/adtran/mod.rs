//! ADTRAN 834 series gateways.
//!
//! Both generations share a Cisco-like CLI and pull firmware over HTTP from
//! a URL given to the `upgrade` command. The device asks for confirmation
//! before downloading and again before writing flash. Some firmware asks
//! both questions up front, reports `Upgrade successful` and reboots
//! without returning to the prompt.
//!
//! # Prompt Examples
//!
//! ```text
//! 834-6>                 # exec
//! admin@834-6#           # privileged
//! 834-5(config)#         # configuration
//! ```

mod v5;
mod v6;

pub use v5::Adtran834v5;
pub use v6::Adtran834v6;

use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::time::Instant;

use crate::channel::MarkerSet;
use crate::device::{DeviceInfo, Dialect};
use crate::device::info::value_after;
use crate::error::{ChannelError, DeviceError, Error, Result};
use crate::session::Shell;

const PROMPT: &str = r"(?m)^[\w.\-@()/: ]{1,63}[>#]\s?$";

/// A yes/no question, consumed through the end of its line.
const CONFIRM: &str = r"(?i)[^\n]*(?:confirm|proceed|y/n)[^\n]*";

/// Confirmations answered before the download starts.
const MAX_DOWNLOAD_CONFIRMS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Failed,
    Confirm,
    Complete,
    Prompt,
    Progress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flash {
    Failed,
    Confirm,
    Accepted,
    Prompt,
}

/// CLI behaviour common to the 834v5 and 834v6.
#[derive(Debug, Clone)]
struct AdtranCli {
    dialect: Dialect,
    transfer: MarkerSet<Transfer>,
    flash: MarkerSet<Flash>,
}

impl AdtranCli {
    fn new() -> Self {
        let dialect = Dialect::new(PROMPT)
            .unwrap()
            .with_failure_pattern("% Invalid")
            .with_failure_pattern("% Unknown command")
            .with_failure_pattern("% Incomplete command")
            .with_failure_pattern("% Error");

        let transfer = MarkerSet::new(&[
            (Transfer::Failed, r"(?i)[^\n]*(?:error|fail)[^\n]*\n"),
            (Transfer::Confirm, CONFIRM),
            (Transfer::Complete, r"(?i)\b(?:complete|success)\w*"),
            (Transfer::Prompt, PROMPT),
            (Transfer::Progress, r"(?i)(?:download|transfer|\d+%)[^\n]*\n"),
        ])
        .unwrap();

        let flash = MarkerSet::new(&[
            (Flash::Failed, r"(?i)[^\n]*(?:error|fail|abort|invalid)[^\n]*\n"),
            (Flash::Confirm, CONFIRM),
            (
                Flash::Accepted,
                r"(?i)upgrading|writing|flashing|programming|rebooting|success",
            ),
            (Flash::Prompt, PROMPT),
        ])
        .unwrap();

        Self {
            dialect,
            transfer,
            flash,
        }
    }

    async fn gather_info<S: Shell>(&self, shell: &mut S, timeout: Duration) -> Result<DeviceInfo> {
        let version = self.dialect.exec_ok(shell, "show version", timeout).await?;
        let mut info = parse_show_version(&version.result);

        match self.dialect.exec_ok(shell, "show wifi config", timeout).await {
            Ok(wifi) => info.merge(parse_wifi_config(&wifi.result)),
            Err(e) => debug!("show wifi config: {}", e),
        }
        match self.dialect.exec_ok(shell, "show mfg", timeout).await {
            Ok(mfg) => info.merge(parse_mfg(&mfg.result)),
            Err(e) => debug!("show mfg: {}", e),
        }

        Ok(info)
    }

    async fn read_version<S: Shell>(&self, shell: &mut S, timeout: Duration) -> Result<String> {
        let response = self.dialect.exec_ok(shell, "show version", timeout).await?;
        parse_show_version(&response.result)
            .firmware_version
            .ok_or_else(|| {
                DeviceError::VersionUnreadable {
                    command: "show version".into(),
                }
                .into()
            })
    }

    /// Issue `command` and follow the download to completion.
    ///
    /// Once a download has been confirmed or has started, the device
    /// dropping the session means it went on to flash and reboot.
    async fn fetch_image<S: Shell>(
        &self,
        shell: &mut S,
        command: &str,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut started = false;
        let mut confirms = 0;

        shell.send(command).await?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let chunk = match shell.read_until(self.transfer.combined(), remaining).await {
                Ok(chunk) => chunk,
                Err(Error::Channel(ChannelError::Closed)) if confirms > 0 || started => {
                    info!("session closed during download, device is flashing");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match self.transfer.classify(&chunk) {
                Some(Transfer::Failed) => {
                    let message = last_line(&chunk);
                    self.dialect
                        .resync(shell, deadline.saturating_duration_since(Instant::now()))
                        .await;
                    return Err(DeviceError::Transfer { message }.into());
                }
                Some(Transfer::Confirm) => {
                    if confirms >= MAX_DOWNLOAD_CONFIRMS {
                        // Back out of the unexpected question
                        shell.send("n").await?;
                        self.dialect
                            .resync(shell, deadline.saturating_duration_since(Instant::now()))
                            .await;
                        return Err(DeviceError::UnexpectedOutput {
                            command: command.to_string(),
                            output: last_line(&chunk),
                        }
                        .into());
                    }
                    confirms += 1;
                    debug!("answering download confirmation {}", confirms);
                    shell.send("y").await?;
                }
                Some(Transfer::Complete) => {
                    info!("firmware download complete");
                    return Ok(());
                }
                Some(Transfer::Prompt) => {
                    let message = if started {
                        "download ended without completing"
                    } else {
                        "download did not start"
                    };
                    return Err(DeviceError::Transfer {
                        message: message.into(),
                    }
                    .into());
                }
                Some(Transfer::Progress) => {
                    started = true;
                    trace!("download: {}", chunk.trim());
                }
                None => {}
            }
        }
    }

    /// Answer the flash confirmation and wait for the device to start writing.
    ///
    /// Only runs after a completed download, so a dropped session is the
    /// device rebooting into the new image.
    async fn confirm_flash<S: Shell>(&self, shell: &mut S, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut confirmed = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let chunk = match shell.read_until(self.flash.combined(), remaining).await {
                Ok(chunk) => chunk,
                Err(Error::Channel(ChannelError::Closed)) => {
                    warn!("session closed before flash acknowledgement, assuming reboot");
                    return Ok(());
                }
                Err(Error::Channel(ChannelError::PatternTimeout { partial, .. })) => {
                    return Err(DeviceError::FlashRejected {
                        message: format!(
                            "no acknowledgement within {:?}: {}",
                            timeout,
                            partial.trim()
                        ),
                    }
                    .into());
                }
                Err(e) => return Err(e),
            };

            match self.flash.classify(&chunk) {
                Some(Flash::Failed) => {
                    return Err(DeviceError::FlashRejected {
                        message: last_line(&chunk),
                    }
                    .into());
                }
                Some(Flash::Confirm) if !confirmed => {
                    confirmed = true;
                    debug!("answering flash confirmation");
                    shell.send("y").await?;
                }
                Some(Flash::Confirm) => {
                    return Err(DeviceError::FlashRejected {
                        message: format!("asked again after confirming: {}", last_line(&chunk)),
                    }
                    .into());
                }
                Some(Flash::Accepted) => {
                    info!("flash accepted: {}", last_line(&chunk));
                    return Ok(());
                }
                Some(Flash::Prompt) => {
                    return Err(DeviceError::FlashRejected {
                        message: "returned to the prompt without flashing".into(),
                    }
                    .into());
                }
                None => {}
            }
        }
    }
}

fn last_line(text: &str) -> String {
    text.trim()
        .lines()
        .last()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Parse `show version`.
///
/// ```text
/// Model: 834-6
/// Serial Number: LBADTN2203AB123
/// MAC Address: 00:A0:C8:12:34:56
/// Firmware Version: 22.3.1.2
/// ```
fn parse_show_version(output: &str) -> DeviceInfo {
    let mut info = DeviceInfo::default();
    for line in output.lines() {
        if line.contains("Model") {
            info.model = value_after(line, ':');
        } else if line.contains("Serial") {
            info.serial_number = value_after(line, ':');
        } else if line.contains("MAC") {
            info.mac_address = value_after(line, ':');
        } else if line.contains("Firmware") {
            info.firmware_version = value_after(line, ':');
        }
    }
    info
}

/// Parse `show wifi config` (uci-style `key='value'` lines).
fn parse_wifi_config(output: &str) -> DeviceInfo {
    let mut info = DeviceInfo::default();
    for line in output.lines() {
        if line.contains("wireless.i5g.ssid") {
            info.wifi_ssid = value_after(line, '=');
        } else if line.contains("wireless.i5g.key") {
            info.wifi_key = value_after(line, '=');
        }
    }
    info
}

/// Parse `show mfg` (`MFG_KEY=value` lines).
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
