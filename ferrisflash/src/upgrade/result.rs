//! Outcome of an upgrade run.

use std::time::Duration;

use serde::Serialize;

use super::state::{StepAttempts, UpgradeRun, UpgradeState};
use crate::device::{ConfigBackup, DeviceInfo, Model};
use crate::error::{Error, ErrorKind};

/// What an upgrade run ended with.
///
/// `final_state` together with `failed_in` and `error_kind` tells apart
/// the outcomes an operator handles differently: the flash never started,
/// the flash started but the device never came back, and the device came
/// back on unchanged firmware.
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeResult {
    /// Device address.
    pub host: String,

    /// Device model.
    pub model: Model,

    /// `Succeeded` or `Failed`.
    pub final_state: UpgradeState,

    /// Classification of the failure, if any.
    pub error_kind: Option<ErrorKind>,

    /// Failure message, if any.
    pub error: Option<String>,

    /// State the run was in when it failed.
    pub failed_in: Option<UpgradeState>,

    /// Every state entered, in order.
    pub history: Vec<UpgradeState>,

    /// Information gathered before flashing.
    pub device_info: Option<DeviceInfo>,

    /// Whether a configuration backup was put back after the upgrade.
    pub backup_restored: bool,

    /// Non-fatal problems, in the order they happened.
    pub warnings: Vec<String>,

    /// Attempts made by the retried steps.
    pub attempts: StepAttempts,

    /// Firmware version before flashing.
    pub version_before: Option<String>,

    /// Firmware version read back after the reboot.
    pub version_after: Option<String>,

    /// Wall time of the run.
    pub elapsed: Duration,

    /// Backup taken but not restored, for the caller to keep.
    #[serde(skip)]
    pub unrestored_backup: Option<ConfigBackup>,

    #[serde(rename = "flash_started")]
    flash_acknowledged: bool,
}

impl UpgradeResult {
    pub(crate) fn from_run(run: UpgradeRun<'_>, error: Option<&Error>) -> Self {
        let target = run.target();
        let final_state = run.state();
        let failed_in = run.failed_in();
        let history = run.history().to_vec();
        let flash_acknowledged = run.flash_started();
        let elapsed = run.started_at().elapsed();
        let unrestored_backup = match run.backup {
            Some(backup) if !run.backup_restored => Some(backup),
            _ => None,
        };

        Self {
            host: target.host.clone(),
            model: target.model,
            final_state,
            error_kind: error.map(Error::kind),
            error: error.map(ToString::to_string),
            failed_in,
            history,
            device_info: run.device_info,
            backup_restored: run.backup_restored,
            warnings: run.warnings,
            attempts: run.attempts,
            version_before: run.version_before,
            version_after: run.version_after,
            elapsed,
            unrestored_backup,
            flash_acknowledged,
        }
    }

    /// Whether the run ended in `Succeeded`.
    pub fn is_success(&self) -> bool {
        self.final_state == UpgradeState::Succeeded
    }

    /// Whether the device acknowledged the flash command.
    ///
    /// When this is true on a failed run, the device may be running either
    /// firmware and needs checking before another attempt.
    pub fn flash_started(&self) -> bool {
        self.flash_acknowledged
    }
}
