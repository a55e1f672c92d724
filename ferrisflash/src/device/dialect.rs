//! Prompt and failure markers for one CLI dialect.

use std::time::Duration;

use log::{debug, warn};
use regex::bytes::Regex;

use crate::channel::compile_prompt_pattern;
use crate::error::{ChannelError, DeviceError, Error, Result};
use crate::session::{Response, Shell};

/// Longest wait for the prompt when resynchronising.
const RESYNC_WAIT: Duration = Duration::from_secs(10);

/// What a model's CLI looks like: its idle prompt and the strings that mark
/// a command as failed.
#[derive(Debug, Clone)]
pub struct Dialect {
    /// Idle prompt.
    prompt: Regex,

    /// Substrings that indicate command failure.
    failed_when_contains: Vec<String>,
}

impl Dialect {
    /// Create a dialect from a prompt pattern.
    pub fn new(prompt: &str) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            prompt: compile_prompt_pattern(prompt)?,
            failed_when_contains: vec![],
        })
    }

    /// Add a failure pattern.
    pub fn with_failure_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.failed_when_contains.push(pattern.into());
        self
    }

    /// Idle prompt.
    pub fn prompt(&self) -> &Regex {
        &self.prompt
    }

    /// First failure pattern found in `output`.
    pub fn failure_in(&self, output: &str) -> Option<&str> {
        self.failed_when_contains
            .iter()
            .find(|pattern| output.contains(pattern.as_str()))
            .map(String::as_str)
    }

    /// Run a command to the prompt, marking the response failed if the
    /// output contains a failure pattern.
    pub async fn exec<S: Shell>(
        &self,
        shell: &mut S,
        command: &str,
        timeout: Duration,
    ) -> Result<Response> {
        let response = shell.send_command(command, &self.prompt, timeout).await?;
        debug!(
            "'{}' -> {} bytes in {:?}",
            command,
            response.result.len(),
            response.elapsed
        );
        match self.failure_in(&response.result) {
            Some(pattern) => {
                let message = pattern.to_string();
                Ok(response.with_failure(message))
            }
            None => Ok(response),
        }
    }

    /// Like [`exec`](Self::exec), but a failed response is an error.
    pub async fn exec_ok<S: Shell>(
        &self,
        shell: &mut S,
        command: &str,
        timeout: Duration,
    ) -> Result<Response> {
        let response = self.exec(shell, command, timeout).await?;
        match &response.failure_message {
            Some(message) => Err(DeviceError::CommandFailed {
                command: command.to_string(),
                message: message.clone(),
            }
            .into()),
            None => Ok(response),
        }
    }

    /// Discard output through the next prompt.
    ///
    /// Called after a command ends on a failure line, while the CLI may
    /// still be printing. If no prompt shows up the session is closed, so
    /// the next step reconnects instead of reading leftovers.
    pub async fn resync<S: Shell>(&self, shell: &mut S, timeout: Duration) {
        let timeout = timeout.min(RESYNC_WAIT);
        match shell.read_until(&self.prompt, timeout).await {
            Ok(discarded) => debug!("resync: skipped {} bytes", discarded.len()),
            Err(Error::Channel(ChannelError::Closed)) => debug!("resync: session already closed"),
            Err(e) => {
                warn!("no prompt after failed command ({}), dropping session", e);
                if let Err(e) = shell.close().await {
                    debug!("resync: close: {}", e);
                }
            }
        }
    }
}
