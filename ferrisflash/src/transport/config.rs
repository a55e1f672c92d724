//! SSH connection configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Host key verification mode, analogous to OpenSSH's `StrictHostKeyChecking`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyVerification {
    /// Reject unknown and changed keys. Connection fails if the host
    /// is not already in known_hosts.
    Strict,

    /// Accept and auto-learn unknown keys, but reject changed keys.
    AcceptNew,

    /// Accept all keys without checking.
    ///
    /// This is the default: gateways regenerate their host key when flashed,
    /// so the key seen after the reboot never matches the one before it.
    #[default]
    Disabled,
}

/// Username/password pair used to log in to a device.
///
/// The password is held in a [`SecretString`] so it never shows up in
/// `Debug` output or logs.
pub struct Credentials {
    /// Login name.
    pub username: String,

    /// Login password.
    password: SecretString,
}

impl Credentials {
    /// Create a credential pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Borrow the password for authentication.
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// SSH settings shared by every connection a run makes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshOptions {
    /// SSH port (default: 22).
    pub port: u16,

    /// Terminal width for PTY.
    pub terminal_width: u32,

    /// Terminal height for PTY.
    pub terminal_height: u32,

    /// How many trailing bytes of output are searched for a prompt.
    pub search_depth: usize,

    /// Host key verification mode.
    pub host_key_verification: HostKeyVerification,

    /// Path to known_hosts file.
    pub known_hosts_path: Option<PathBuf>,

    /// Interval between SSH keepalives; doubles as the inactivity bound.
    pub keepalive: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            port: 22,
            terminal_width: 511,
            terminal_height: 24,
            search_depth: 1000,
            host_key_verification: HostKeyVerification::default(),
            known_hosts_path: None,
            keepalive: Duration::from_secs(15),
        }
    }
}

/// Fully resolved parameters for one SSH connection.
#[derive(Debug)]
pub struct SshConfig<'a> {
    /// Target host (hostname or IP address).
    pub host: &'a str,

    /// Login credentials.
    pub credentials: &'a Credentials,

    /// Connection timeout.
    pub timeout: Duration,

    /// Shared SSH settings.
    pub options: &'a SshOptions,
}

impl SshConfig<'_> {
    /// Get the socket address for connection.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.options.port)
    }
}
