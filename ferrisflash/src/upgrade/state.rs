//! Upgrade run state machine.

use std::fmt;
use std::path::PathBuf;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::DeviceTarget;
use crate::device::{ConfigBackup, DeviceInfo};
use crate::error::{Result, UpgradeError};
use crate::session::CredentialPhase;
use crate::transport::Credentials;

/// Where an upgrade run is.
///
/// States are declared in run order, so comparing two states tells which
/// comes later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpgradeState {
    Init,
    ConnectingInitial,
    GatheringInfo,
    BackingUp,
    Uploading,
    Flashing,
    AwaitingReboot,
    ReconnectingUpgraded,
    Verifying,
    Restoring,
    Succeeded,
    Failed,
}

impl UpgradeState {
    /// Whether the run is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, UpgradeState::Succeeded | UpgradeState::Failed)
    }

    /// Whether `next` may follow this state.
    ///
    /// `Failed` is reachable from every non-terminal state; `Restoring` is
    /// optional between `Verifying` and `Succeeded`.
    pub fn can_advance_to(self, next: UpgradeState) -> bool {
        use UpgradeState::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) => true,
            (Init, ConnectingInitial)
            | (ConnectingInitial, GatheringInfo)
            | (GatheringInfo, BackingUp)
            | (BackingUp, Uploading)
            | (Uploading, Flashing)
            | (Flashing, AwaitingReboot)
            | (AwaitingReboot, ReconnectingUpgraded)
            | (ReconnectingUpgraded, Verifying)
            | (Verifying, Restoring)
            | (Verifying, Succeeded)
            | (Restoring, Succeeded) => true,
            _ => false,
        }
    }

    /// Credential phase a run must be in to enter this state.
    ///
    /// `None` for `Failed`, which any phase may reach.
    pub fn required_phase(self) -> Option<CredentialPhase> {
        match self {
            UpgradeState::Failed => None,
            s if s >= UpgradeState::AwaitingReboot => Some(CredentialPhase::Upgraded),
            _ => Some(CredentialPhase::Initial),
        }
    }
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpgradeState::Init => "INIT",
            UpgradeState::ConnectingInitial => "CONNECTING_INITIAL",
            UpgradeState::GatheringInfo => "GATHERING_INFO",
            UpgradeState::BackingUp => "BACKING_UP",
            UpgradeState::Uploading => "UPLOADING",
            UpgradeState::Flashing => "FLASHING",
            UpgradeState::AwaitingReboot => "AWAITING_REBOOT",
            UpgradeState::ReconnectingUpgraded => "RECONNECTING_UPGRADED",
            UpgradeState::Verifying => "VERIFYING",
            UpgradeState::Restoring => "RESTORING",
            UpgradeState::Succeeded => "SUCCEEDED",
            UpgradeState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// How many times each retried step was attempted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepAttempts {
    /// Connection attempts with either credential set, outside the reboot poll.
    pub connect: u32,

    /// Probes made while waiting for the device to come back, recorded when
    /// the wait gives up.
    pub reconnect: u32,

    /// `upload_image` calls.
    pub upload: u32,

    /// `restore_config` calls.
    pub restore: u32,
}

/// Mutable record of one upgrade run.
///
/// Only the orchestrator mutates it. Transitions are validated, and the
/// credential hand-off is one-way: [`handoff`](Self::handoff) switches the
/// active credentials to the upgraded set once, after the flash command is
/// acknowledged, and nothing switches them back.
#[derive(Debug)]
pub struct UpgradeRun<'a> {
    target: &'a DeviceTarget,
    image_path: PathBuf,
    state: UpgradeState,
    phase: CredentialPhase,
    started_at: Instant,
    history: Vec<UpgradeState>,
    failed_in: Option<UpgradeState>,

    pub(crate) attempts: StepAttempts,
    pub(crate) warnings: Vec<String>,
    pub(crate) device_info: Option<DeviceInfo>,
    pub(crate) backup: Option<ConfigBackup>,
    pub(crate) backup_restored: bool,
    pub(crate) version_before: Option<String>,
    pub(crate) version_after: Option<String>,
}

impl<'a> UpgradeRun<'a> {
    /// Start a run for `target` in [`UpgradeState::Init`].
    pub fn new(target: &'a DeviceTarget, image_path: impl Into<PathBuf>) -> Self {
        Self {
            target,
            image_path: image_path.into(),
            state: UpgradeState::Init,
            phase: CredentialPhase::Initial,
            started_at: Instant::now(),
            history: vec![UpgradeState::Init],
            failed_in: None,
            attempts: StepAttempts::default(),
            warnings: Vec::new(),
            device_info: None,
            backup: None,
            backup_restored: false,
            version_before: None,
            version_after: None,
        }
    }

    /// Target being upgraded.
    pub fn target(&self) -> &'a DeviceTarget {
        self.target
    }

    /// Image being flashed.
    pub fn image_path(&self) -> &PathBuf {
        &self.image_path
    }

    /// Current state.
    pub fn state(&self) -> UpgradeState {
        self.state
    }

    /// Active credential phase.
    pub fn phase(&self) -> CredentialPhase {
        self.phase
    }

    /// When the run started.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Every state entered, in order.
    pub fn history(&self) -> &[UpgradeState] {
        &self.history
    }

    /// State the run was in when it failed.
    pub fn failed_in(&self) -> Option<UpgradeState> {
        self.failed_in
    }

    /// Move to `next`.
    pub fn advance(&mut self, next: UpgradeState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(UpgradeError::InvalidTransition {
                from: self.state,
                to: next,
            }
            .into());
        }
        if let Some(required) = next.required_phase() {
            if required != self.phase {
                return Err(UpgradeError::CredentialPhase { state: next }.into());
            }
        }

        info!("{}: {} -> {}", self.target.host, self.state, next);
        if next == UpgradeState::Failed {
            self.failed_in = Some(self.state);
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Switch to the upgraded credentials.
    ///
    /// Only valid while `Flashing`, i.e. after the flash command returned
    /// successfully, and only once.
    pub fn handoff(&mut self) -> Result<()> {
        if self.state != UpgradeState::Flashing || self.phase != CredentialPhase::Initial {
            return Err(UpgradeError::CredentialPhase { state: self.state }.into());
        }
        info!("{}: switching to upgraded credentials", self.target.host);
        self.phase = CredentialPhase::Upgraded;
        Ok(())
    }

    /// Credentials for `phase`, provided it is the active one.
    pub fn credentials(&self, phase: CredentialPhase) -> Result<&'a Credentials> {
        if phase != self.phase {
            return Err(UpgradeError::CredentialPhase { state: self.state }.into());
        }
        Ok(self.active_credentials())
    }

    /// Credentials for the active phase.
    pub fn active_credentials(&self) -> &'a Credentials {
        match self.phase {
            CredentialPhase::Initial => &self.target.initial_credentials,
            CredentialPhase::Upgraded => &self.target.upgraded_credentials,
        }
    }

    /// Record a non-fatal problem.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}: {}", self.target.host, message);
        self.warnings.push(message);
    }

    /// Whether the device acknowledged the flash command.
    pub fn flash_started(&self) -> bool {
        self.phase == CredentialPhase::Upgraded
    }
}
