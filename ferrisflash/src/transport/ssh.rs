//! SSH transport implementation using russh.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use russh::Channel;
use russh::client::{self, Handle, Msg};
use russh::keys::PublicKey;
use tokio::time::Instant;

use super::config::{HostKeyVerification, SshConfig};
use crate::error::{Result, TransportError};

/// SSH transport wrapping a russh client session.
pub struct SshTransport {
    /// The russh session handle.
    session: Handle<SshHandler>,

    /// Terminal size requested for the shell.
    terminal: (u32, u32),
}

impl SshTransport {
    /// Connect to the SSH server and authenticate with a password.
    ///
    /// Unreachable hosts surface as [`TransportError::ConnectionFailed`],
    /// rejected credentials as [`TransportError::AuthenticationFailed`].
    /// Handshake and authentication together get `config.timeout`.
    pub async fn connect(config: &SshConfig<'_>) -> Result<Self> {
        let deadline = Instant::now() + config.timeout;
        let options = config.options;
        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: Some(options.keepalive * 3),
            keepalive_interval: Some(options.keepalive),
            ..Default::default()
        });

        let host_key_error: Arc<Mutex<Option<TransportError>>> = Arc::new(Mutex::new(None));

        let handler = SshHandler {
            host: config.host.to_string(),
            port: options.port,
            host_key_verification: options.host_key_verification.clone(),
            known_hosts_path: options.known_hosts_path.clone(),
            host_key_error: host_key_error.clone(),
        };

        debug!("ssh connect {}", config.socket_addr());

        let mut session = tokio::time::timeout_at(
            deadline,
            client::connect(ssh_config, (config.host, options.port), handler),
        )
        .await
        .map_err(|_| TransportError::Timeout(config.timeout))?
        .map_err(|e| {
            // Prefer the detailed host-key error over russh's generic UnknownKey
            let stored = host_key_error.lock().ok().and_then(|mut slot| slot.take());
            match (stored, e) {
                (Some(hk_err), _) => hk_err,
                (None, russh::Error::IO(source)) => TransportError::ConnectionFailed {
                    host: config.host.to_string(),
                    port: options.port,
                    source,
                },
                (None, e) => TransportError::Ssh(e),
            }
        })?;

        let accepted = tokio::time::timeout_at(
            deadline,
            session.authenticate_password(
                config.credentials.username.as_str(),
                config.credentials.password(),
            ),
        )
        .await
        .map_err(|_| TransportError::Timeout(config.timeout))?
        .map_err(TransportError::Ssh)?
        .success();

        if !accepted {
            return Err(TransportError::AuthenticationFailed {
                user: config.credentials.username.clone(),
            }
            .into());
        }

        Ok(Self {
            session,
            terminal: (options.terminal_width, options.terminal_height),
        })
    }

    /// Open an interactive PTY shell channel on this connection.
    pub async fn open_shell(&self) -> Result<Channel<Msg>> {
        let channel = self
            .session
            .channel_open_session()
            .await
            .map_err(TransportError::Ssh)?;

        channel
            .request_pty(true, "xterm", self.terminal.0, self.terminal.1, 0, 0, &[])
            .await
            .map_err(TransportError::Ssh)?;

        channel
            .request_shell(true)
            .await
            .map_err(TransportError::Ssh)?;

        Ok(channel)
    }

    /// Whether the session's background task is still running.
    pub fn is_alive(&self) -> bool {
        !self.session.is_closed()
    }

    /// Close the connection.
    pub async fn close(self) -> Result<()> {
        self.session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(TransportError::Ssh)?;
        Ok(())
    }
}

/// SSH client handler for russh.
struct SshHandler {
    host: String,
    port: u16,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
    /// Stores a detailed host-key error so connect() can surface it
    /// instead of the generic russh::Error::UnknownKey.
    host_key_error: Arc<Mutex<Option<TransportError>>>,
}

impl SshHandler {
    /// Check the host key against known_hosts.
    ///
    /// Returns `Ok(true)` if matched, `Ok(false)` if host not found,
    /// `Err(TransportError::HostKeyChanged)` if key changed.
    fn check_known_hosts(&self, pubkey: &PublicKey) -> std::result::Result<bool, TransportError> {
        let result = if let Some(ref path) = self.known_hosts_path {
            russh::keys::check_known_hosts_path(&self.host, self.port, pubkey, path)
        } else {
            russh::keys::check_known_hosts(&self.host, self.port, pubkey)
        };

        match result {
            Ok(matched) => Ok(matched),
            Err(russh::keys::Error::KeyChanged { line }) => Err(TransportError::HostKeyChanged {
                host: self.host.clone(),
                port: self.port,
                line,
            }),
            Err(e) => Err(TransportError::KnownHosts(e.to_string())),
        }
    }

    /// Save a new host key to known_hosts.
    fn learn_host_key(&self, pubkey: &PublicKey) -> std::result::Result<(), TransportError> {
        let result = if let Some(ref path) = self.known_hosts_path {
            russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, pubkey, path)
        } else {
            russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, pubkey)
        };

        result.map_err(|e| TransportError::KnownHosts(e.to_string()))
    }

    fn reject(&self, error: TransportError) -> bool {
        if let Ok(mut slot) = self.host_key_error.lock() {
            *slot = Some(error);
        }
        false
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.host_key_verification {
            HostKeyVerification::Disabled => Ok(true),

            HostKeyVerification::AcceptNew => match self.check_known_hosts(server_public_key) {
                Ok(true) => Ok(true),
                Ok(false) => {
                    if let Err(e) = self.learn_host_key(server_public_key) {
                        warn!("Failed to save host key: {}", e);
                    }
                    Ok(true)
                }
                Err(e) => Ok(self.reject(e)),
            },

            HostKeyVerification::Strict => match self.check_known_hosts(server_public_key) {
                Ok(true) => Ok(true),
                Ok(false) => Ok(self.reject(TransportError::HostKeyUnknown {
                    host: self.host.clone(),
                    port: self.port,
                })),
                Err(e) => Ok(self.reject(e)),
            },
        }
    }
}
