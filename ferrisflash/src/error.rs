//! Error types for ferrisflash.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::upgrade::UpgradeState;

/// Main error type for ferrisflash operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SSH transport-level errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel operation errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Model driver errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Device registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Upgrade run errors
    #[error("Upgrade error: {0}")]
    Upgrade(#[from] UpgradeError),

    /// Local I/O error (firmware image, image hosting)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Classify this error into the kind reported to callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(e) => match e {
                TransportError::AuthenticationFailed { .. } => ErrorKind::Auth,
                TransportError::Timeout(_) => ErrorKind::Timeout,
                _ => ErrorKind::Connection,
            },
            Error::Channel(e) => match e {
                ChannelError::PatternTimeout { .. } => ErrorKind::Timeout,
                ChannelError::InvalidPattern(_) => ErrorKind::Internal,
                _ => ErrorKind::Connection,
            },
            Error::Device(e) => match e {
                DeviceError::Transfer { .. } => ErrorKind::Transfer,
                DeviceError::BackupUnsupported { .. } => ErrorKind::BackupUnsupported,
                DeviceError::FlashRejected { .. } => ErrorKind::FlashRejected,
                DeviceError::VersionUnreadable { .. } | DeviceError::VerificationUnsupported => {
                    ErrorKind::Verification
                }
                DeviceError::CommandFailed { .. } | DeviceError::UnexpectedOutput { .. } => {
                    ErrorKind::Internal
                }
            },
            Error::Registry(RegistryError::UnknownModel { .. }) => ErrorKind::UnknownModel,
            Error::Upgrade(e) => match e {
                UpgradeError::ReconnectTimeout { .. } => ErrorKind::ReconnectTimeout,
                UpgradeError::UpgradeTimedOut { .. } => ErrorKind::UpgradeTimedOut,
                UpgradeError::VerificationFailed { .. } => ErrorKind::VerificationFailed,
                UpgradeError::InvalidImage { .. } => ErrorKind::InvalidImage,
                UpgradeError::InvalidTarget { .. } => ErrorKind::InvalidTarget,
                UpgradeError::Cancelled => ErrorKind::Cancelled,
                UpgradeError::InvalidTransition { .. } | UpgradeError::CredentialPhase { .. } => {
                    ErrorKind::Internal
                }
            },
            Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether the orchestrator may retry the failed step.
    ///
    /// Authentication and unknown-model errors are caller input errors and
    /// are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Transfer
        )
    }
}

/// Coarse error classification carried by [`UpgradeResult`](crate::UpgradeResult).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Credentials rejected by the device.
    Auth,
    /// Host unreachable, connection refused or dropped.
    Connection,
    /// No prompt/pattern within the allotted time.
    Timeout,
    /// The reconnect poll exhausted its window.
    ReconnectTimeout,
    /// Flash was triggered but the device never came back.
    UpgradeTimedOut,
    /// Firmware image transfer to the device failed.
    Transfer,
    /// The model has no configuration backup command.
    BackupUnsupported,
    /// The device refused to start flashing.
    FlashRejected,
    /// The firmware version could not be read back.
    Verification,
    /// The device answered but shows no version change.
    VerificationFailed,
    /// No driver is registered for the model identifier.
    UnknownModel,
    /// The firmware image failed local validation.
    InvalidImage,
    /// The upgrade target is missing a host or credentials.
    InvalidTarget,
    /// The run was cancelled by the caller.
    Cancelled,
    /// Programming or environment error.
    Internal,
}

/// Transport layer errors (SSH connection, authentication).
#[derive(Error, Debug)]
pub enum TransportError {
    /// Failed to connect to host
    #[error("Connection failed to {host}:{port}: {source}")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// SSH handshake or protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Authentication failed
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// Host key changed since it was recorded in known_hosts
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged { host: String, port: u16, line: usize },

    /// Host not present in known_hosts under strict checking
    #[error("Host key for {host}:{port} is not in known_hosts")]
    HostKeyUnknown { host: String, port: u16 },

    /// known_hosts could not be read or written
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// Connection was closed unexpectedly
    #[error("Connection disconnected")]
    Disconnected,

    /// Operation timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Channel layer errors (pattern matching, PTY operations).
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Pattern matching timed out; carries what was read for diagnostics.
    #[error("Pattern not found within {timeout:?}")]
    PatternTimeout { timeout: Duration, partial: String },

    /// Channel closed unexpectedly or already closed
    #[error("Channel closed")]
    Closed,

    /// SSH protocol error on the channel
    #[error("Channel SSH error: {0}")]
    Ssh(russh::Error),

    /// Invalid regex pattern
    #[error("Invalid regex pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Errors raised by model drivers.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The image transfer failed or the device reported a size/checksum mismatch.
    #[error("Firmware transfer failed: {message}")]
    Transfer { message: String },

    /// The model has no configuration backup command.
    #[error("Configuration backup is not supported on {model}")]
    BackupUnsupported { model: String },

    /// The flash command was not acknowledged.
    #[error("Flash not accepted: {message}")]
    FlashRejected { message: String },

    /// The firmware version could not be parsed from the device output.
    #[error("Firmware version unreadable from output of '{command}'")]
    VersionUnreadable { command: String },

    /// The model cannot report a firmware version.
    #[error("Firmware verification is not supported on this model")]
    VerificationUnsupported,

    /// A command output matched one of the dialect's failure markers.
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The device answered with something the driver does not recognise.
    #[error("Unexpected output from '{command}': {output}")]
    UnexpectedOutput { command: String, output: String },
}

/// Device registry errors.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No driver registered under this identifier
    #[error("Unknown device model: '{name}'")]
    UnknownModel { name: String },
}

/// Upgrade run errors.
#[derive(Error, Debug)]
pub enum UpgradeError {
    /// The device did not accept an SSH login within the poll window.
    #[error("Device did not come back within {waited:?} ({attempts} attempts)")]
    ReconnectTimeout {
        waited: Duration,
        attempts: u32,
        last_error: Option<String>,
    },

    /// Flash was triggered but the device never became reachable again.
    #[error("Upgrade timed out: device unreachable {waited:?} after flash")]
    UpgradeTimedOut { waited: Duration, attempts: u32 },

    /// The device came back but reports no version change.
    #[error("Firmware version unchanged after upgrade: {version}")]
    VerificationFailed { version: String },

    /// The firmware image failed local validation.
    #[error("Invalid firmware image {path}: {reason}")]
    InvalidImage { path: String, reason: String },

    /// The upgrade target is incomplete.
    #[error("Invalid upgrade target: {reason}")]
    InvalidTarget { reason: String },

    /// The run was cancelled.
    #[error("Upgrade cancelled")]
    Cancelled,

    /// Attempted a transition the state machine does not allow.
    #[error("Invalid transition {from:?} -> {to:?}")]
    InvalidTransition { from: UpgradeState, to: UpgradeState },

    /// A credential set was used outside its phase.
    #[error("Credential phase violation in state {state:?}")]
    CredentialPhase { state: UpgradeState },
}

/// Result type alias using ferrisflash's Error.
pub type Result<T> = std::result::Result<T, Error>;
