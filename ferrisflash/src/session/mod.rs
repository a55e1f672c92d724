//! Interactive shell sessions against a device.
//!
//! A [`Shell`] is a single-owner, live shell channel bound to one host and
//! one credential phase. Sessions are produced by a [`Connector`]; the
//! production connector is [`SshConnector`], tests plug in a scripted one.
//!
//! Commands are written with [`Shell::send`] and output is consumed with
//! [`Shell::read_until`], which blocks until a pattern shows up or the
//! timeout elapses. Nothing in this layer retries a command; the only
//! tolerance for an unreachable device is [`wait_for_reconnect`].

mod reconnect;
mod response;
mod ssh;

#[cfg(test)]
pub(crate) mod script;

pub use reconnect::{ReconnectPolicy, wait_for_reconnect};
pub use response::Response;
pub use ssh::{SshConnector, SshSession};

use std::future::Future;
use std::time::Duration;

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::Result;
use crate::transport::Credentials;

/// Which credential set a session was opened with.
///
/// A run starts in `Initial` and switches to `Upgraded` exactly once, after
/// the flash command has been acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialPhase {
    /// Factory/default credentials, valid before the flash.
    Initial,
    /// Credentials valid once the new firmware is running.
    Upgraded,
}

/// Parameters for one connection attempt.
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest<'a> {
    /// Host to connect to.
    pub host: &'a str,

    /// Credentials to authenticate with.
    pub credentials: &'a Credentials,

    /// Phase the credentials belong to; recorded on the session.
    pub phase: CredentialPhase,

    /// Prompt that marks the shell as ready.
    pub prompt: &'a Regex,

    /// Bound on transport setup plus the first prompt.
    pub timeout: Duration,
}

/// A live interactive shell on a device.
pub trait Shell: Send {
    /// Write one line of input to the shell. Does not wait for output.
    fn send(&mut self, input: &str) -> impl Future<Output = Result<()>> + Send;

    /// Read until `pattern` matches or `timeout` elapses.
    ///
    /// Returns the output up to and including the match; anything after it
    /// stays buffered for the next read. On timeout the error carries the
    /// partial output.
    fn read_until(
        &mut self,
        pattern: &Regex,
        timeout: Duration,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Close the shell and its transport.
    ///
    /// Idempotent: closing an already-closed session is a no-op.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Whether the session is still usable.
    fn is_open(&self) -> bool;

    /// Credential phase the session was authenticated with.
    fn phase(&self) -> CredentialPhase;

    /// Send a command and wait for the prompt.
    fn send_command(
        &mut self,
        command: &str,
        prompt: &Regex,
        timeout: Duration,
    ) -> impl Future<Output = Result<Response>> + Send {
        async move {
            let start = Instant::now();
            self.send(command).await?;
            let raw = self.read_until(prompt, timeout).await?;
            Ok(Response::from_raw(command, raw, prompt, start.elapsed()))
        }
    }
}

/// Opens shells on devices.
pub trait Connector: Send + Sync {
    /// Session type produced by this connector.
    type Session: Shell;

    /// Open transport and interactive shell, then wait for the first prompt.
    ///
    /// Fails with an authentication error on rejected credentials (distinct
    /// from a connection error for an unreachable host) and with a timeout
    /// if no prompt appears within `request.timeout`.
    fn connect(
        &self,
        request: &ConnectRequest<'_>,
    ) -> impl Future<Output = Result<Self::Session>> + Send;
}
