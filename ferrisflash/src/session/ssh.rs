//! SSH-backed shell sessions.

use std::time::Duration;

use log::{debug, trace};
use regex::bytes::Regex;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::time::Instant;

use super::{ConnectRequest, Connector, CredentialPhase, Shell};
use crate::channel::PatternBuffer;
use crate::error::{ChannelError, Result, TransportError};
use crate::transport::{SshConfig, SshOptions, SshTransport};

/// Interactive shell over an SSH PTY channel.
pub struct SshSession {
    /// Host this session is connected to.
    host: String,

    /// Credential phase used to authenticate.
    phase: CredentialPhase,

    /// SSH transport (None once closed).
    transport: Option<SshTransport>,

    /// Shell channel (None once closed).
    channel: Option<Channel<Msg>>,

    /// Output not yet consumed by a read.
    buffer: PatternBuffer,
}

impl SshSession {
    fn new(
        host: &str,
        phase: CredentialPhase,
        transport: SshTransport,
        channel: Channel<Msg>,
        search_depth: usize,
    ) -> Self {
        Self {
            host: host.to_string(),
            phase,
            transport: Some(transport),
            channel: Some(channel),
            buffer: PatternBuffer::new(search_depth),
        }
    }

    /// Host this session is connected to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Drop the channel after the device hung up; the transport is
    /// released on the next `close()`.
    fn mark_closed(&mut self) {
        self.channel = None;
    }
}

impl Shell for SshSession {
    async fn send(&mut self, input: &str) -> Result<()> {
        let channel = self.channel.as_ref().ok_or(ChannelError::Closed)?;
        trace!("{} <- {:?}", self.host, input);
        let line = format!("{}\n", input);
        channel
            .data(line.as_bytes())
            .await
            .map_err(ChannelError::Ssh)?;
        Ok(())
    }

    async fn read_until(&mut self, pattern: &Regex, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(end) = self.buffer.search_tail(pattern) {
                let data = self.buffer.take_through(end);
                return Ok(String::from_utf8_lossy(&data).into_owned());
            }

            let channel = self.channel.as_mut().ok_or(ChannelError::Closed)?;
            let msg = match tokio::time::timeout_at(deadline, channel.wait()).await {
                Ok(msg) => msg,
                Err(_) => {
                    let partial = String::from_utf8_lossy(&self.buffer.take()).into_owned();
                    debug!(
                        "{}: pattern {:?} not seen within {:?}",
                        self.host,
                        pattern.as_str(),
                        timeout
                    );
                    return Err(ChannelError::PatternTimeout { timeout, partial }.into());
                }
            };

            match msg {
                Some(ChannelMsg::Data { ref data }) => {
                    trace!("{} -> {} bytes", self.host, data.len());
                    self.buffer.extend(&data[..]);
                }
                Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                    self.buffer.extend(&data[..]);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    debug!("{}: shell channel closed by device", self.host);
                    self.mark_closed();
                    return Err(ChannelError::Closed.into());
                }
                Some(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.take() {
            // A rebooting device often drops the link first
            if let Err(e) = channel.close().await {
                debug!("{}: channel close: {}", self.host, e);
            }
        }
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("{}: disconnect: {}", self.host, e);
            }
        }
        self.buffer.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.is_some() && self.transport.as_ref().is_some_and(SshTransport::is_alive)
    }

    fn phase(&self) -> CredentialPhase {
        self.phase
    }
}

/// Connector that opens real SSH sessions.
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    options: SshOptions,
}

impl SshConnector {
    /// Create a connector with the given SSH settings.
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    /// SSH settings used for every connection.
    pub fn options(&self) -> &SshOptions {
        &self.options
    }
}

impl Connector for SshConnector {
    type Session = SshSession;

    async fn connect(&self, request: &ConnectRequest<'_>) -> Result<SshSession> {
        let start = Instant::now();
        let config = SshConfig {
            host: request.host,
            credentials: request.credentials,
            timeout: request.timeout,
            options: &self.options,
        };

        let transport = SshTransport::connect(&config).await?;
        let deadline = start + request.timeout;
        let opened = match tokio::time::timeout_at(deadline, transport.open_shell()).await {
            Ok(opened) => opened,
            Err(_) => Err(TransportError::Timeout(request.timeout).into()),
        };
        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                let _ = transport.close().await;
                return Err(e);
            }
        };

        let mut session = SshSession::new(
            request.host,
            request.phase,
            transport,
            channel,
            self.options.search_depth,
        );

        // Drain the login banner up to the first prompt
        let remaining = request.timeout.saturating_sub(start.elapsed());
        match session.read_until(request.prompt, remaining).await {
            Ok(banner) => {
                debug!(
                    "{}: shell ready as {} ({:?}), banner {} bytes",
                    request.host,
                    request.credentials.username,
                    request.phase,
                    banner.len()
                );
                Ok(session)
            }
            Err(e) => {
                session.close().await?;
                Err(e)
            }
        }
    }
}
