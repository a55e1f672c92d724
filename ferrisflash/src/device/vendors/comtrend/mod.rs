//! Comtrend VR-3071 series gateways.
//!
//! Both models pull firmware over TFTP from this host. The VR-3071 runs an
//! OpenWrt-style busybox shell; the v2 runs Broadcom's CLI, where the
//! `tftp -t i` image transfer also writes flash and `restoredefault`
//! reboots into the new image with factory settings.
//!
//! # Prompt Examples
//!
//! ```text
//! root@VR-3071:~#        # VR-3071 busybox shell
//! >                      # VR-3071v2 CLI
//! ```

mod vr3071;
mod vr3071v2;

pub use vr3071::ComtrendVr3071;
pub use vr3071v2::ComtrendVr3071v2;

use std::time::Duration;

use log::{info, warn};
use tokio::time::Instant;

use crate::channel::MarkerSet;
use crate::error::{ChannelError, DeviceError, Error, Result};
use crate::session::Shell;

/// Classification of output after a flash or reboot command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flash {
    Failed,
    Accepted,
    Prompt,
}

fn flash_markers(failed: &str, accepted: &str, prompt: &str) -> MarkerSet<Flash> {
    MarkerSet::new(&[
        (Flash::Failed, failed),
        (Flash::Accepted, accepted),
        (Flash::Prompt, prompt),
    ])
    .unwrap()
}

/// Send `command` and wait for the device to acknowledge it is flashing or
/// rebooting.
///
/// These devices tear the session down as part of the reboot, so the
/// channel closing before any acknowledgement also counts as accepted.
async fn await_flash_ack<S: Shell>(
    shell: &mut S,
    command: &str,
    markers: &MarkerSet<Flash>,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    shell.send(command).await?;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let chunk = match shell.read_until(markers.combined(), remaining).await {
            Ok(chunk) => chunk,
            Err(Error::Channel(ChannelError::Closed)) => {
                warn!("'{}': session closed before acknowledgement, assuming reboot", command);
                return Ok(());
            }
            Err(Error::Channel(ChannelError::PatternTimeout { partial, .. })) => {
                return Err(DeviceError::FlashRejected {
                    message: format!(
                        "'{}' not acknowledged within {:?}: {}",
                        command,
                        timeout,
                        partial.trim()
                    ),
                }
                .into());
            }
            Err(e) => return Err(e),
        };

        match markers.classify(&chunk) {
            Some(Flash::Failed) => {
                return Err(DeviceError::FlashRejected {
                    message: chunk.trim().lines().last().unwrap_or_default().to_string(),
                }
                .into());
            }
            Some(Flash::Accepted) => {
                info!("'{}' accepted", command);
                return Ok(());
            }
            Some(Flash::Prompt) => {
                return Err(DeviceError::FlashRejected {
                    message: format!("'{}' returned to the prompt", command),
                }
                .into());
            }
            None => {}
        }
    }
}
