//! Scripted shells for driving drivers and the orchestrator without hardware.
//!
//! A [`ScriptedShell`] answers commands from a rule table: the first rule
//! whose key prefixes the input supplies the reply. Replies for one rule are
//! consumed in order, with the last one repeating. Every connect, send and
//! close is recorded in a shared event log so tests can assert on the exact
//! command sequence and the credential phase each command ran under.
//!
//! By default a reply lands in the read buffer as soon as its command is
//! sent. A [`buffered`](ScriptedShell::buffered) shell instead holds the
//! echo and reply back until everything read so far fails to match, as a
//! live channel does when the device answers after the read has started.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::bytes::Regex;

use super::{ConnectRequest, Connector, CredentialPhase, Shell};
use crate::error::{ChannelError, Result, TransportError};

/// Something a scripted device observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Connect {
        host: String,
        username: String,
        phase: CredentialPhase,
        ok: bool,
    },
    Send {
        phase: CredentialPhase,
        input: String,
    },
    Close {
        phase: CredentialPhase,
    },
}

pub(crate) type EventLog = Arc<Mutex<Vec<Event>>>;

fn record(log: &EventLog, event: Event) {
    if let Ok(mut events) = log.lock() {
        events.push(event);
    }
}

#[derive(Debug, Clone)]
struct Reply {
    text: String,
    prompt: bool,
    hangup: bool,
}

#[derive(Debug)]
struct Rule {
    key: String,
    replies: VecDeque<Reply>,
}

/// A fake device shell.
#[derive(Debug)]
pub(crate) struct ScriptedShell {
    prompt: String,
    rules: Vec<Rule>,
    pending: String,
    in_flight: String,
    buffered: bool,
    open: bool,
    hung_up: bool,
    phase: CredentialPhase,
    log: EventLog,
}

impl ScriptedShell {
    /// A shell that greets with `prompt` and echoes unknown commands.
    pub(crate) fn new(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            rules: Vec::new(),
            pending: prompt.to_string(),
            in_flight: String::new(),
            buffered: false,
            open: true,
            hung_up: false,
            phase: CredentialPhase::Initial,
            log: EventLog::default(),
        }
    }

    /// Greet with `text` and no prompt at all.
    pub(crate) fn garbled(mut self, text: &str) -> Self {
        self.pending = text.to_string();
        self
    }

    /// Deliver each reply only after older unread output has been searched.
    pub(crate) fn buffered(mut self) -> Self {
        self.buffered = true;
        self
    }

    /// Answer `key` with `reply` followed by the prompt.
    pub(crate) fn on(self, key: &str, reply: &str) -> Self {
        self.push(key, reply, true, false)
    }

    /// Answer `key` with `reply` verbatim; no prompt follows.
    pub(crate) fn on_raw(self, key: &str, reply: &str) -> Self {
        self.push(key, reply, false, false)
    }

    /// Answer `key` with `reply`, then drop the connection.
    pub(crate) fn on_hangup(self, key: &str, reply: &str) -> Self {
        self.push(key, reply, false, true)
    }

    fn push(mut self, key: &str, text: &str, prompt: bool, hangup: bool) -> Self {
        let reply = Reply {
            text: text.to_string(),
            prompt,
            hangup,
        };
        match self.rules.iter_mut().find(|rule| rule.key == key) {
            Some(rule) => rule.replies.push_back(reply),
            None => self.rules.push(Rule {
                key: key.to_string(),
                replies: VecDeque::from([reply]),
            }),
        }
        self
    }

    fn reply_for(&mut self, input: &str) -> Option<Reply> {
        let rule = self
            .rules
            .iter_mut()
            .find(|rule| input.starts_with(rule.key.as_str()))?;
        if rule.replies.len() > 1 {
            rule.replies.pop_front()
        } else {
            rule.replies.front().cloned()
        }
    }
}

impl Shell for ScriptedShell {
    async fn send(&mut self, input: &str) -> Result<()> {
        if !self.open || self.hung_up {
            return Err(ChannelError::Closed.into());
        }
        record(
            &self.log,
            Event::Send {
                phase: self.phase,
                input: input.to_string(),
            },
        );

        let reply = self.reply_for(input).unwrap_or(Reply {
            text: String::new(),
            prompt: true,
            hangup: false,
        });

        let mut output = format!("{}\r\n", input);
        if !reply.text.is_empty() {
            output.push_str(&reply.text);
            if reply.prompt {
                output.push_str("\r\n");
            }
        }
        if reply.prompt {
            output.push_str(&self.prompt);
        }

        if self.buffered {
            self.in_flight.push_str(&output);
        } else {
            self.pending.push_str(&output);
        }
        self.hung_up = reply.hangup;
        Ok(())
    }

    async fn read_until(&mut self, pattern: &Regex, timeout: Duration) -> Result<String> {
        if !self.open {
            return Err(ChannelError::Closed.into());
        }
        loop {
            if let Some(m) = pattern.find(self.pending.as_bytes()) {
                let rest = self.pending.split_off(m.end());
                return Ok(std::mem::replace(&mut self.pending, rest));
            }
            if self.in_flight.is_empty() {
                break;
            }
            let arrived = std::mem::take(&mut self.in_flight);
            self.pending.push_str(&arrived);
        }
        if self.hung_up {
            self.open = false;
            return Err(ChannelError::Closed.into());
        }
        tokio::time::sleep(timeout).await;
        let partial = std::mem::take(&mut self.pending);
        Err(ChannelError::PatternTimeout { timeout, partial }.into())
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.in_flight.clear();
            record(&self.log, Event::Close { phase: self.phase });
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open && !self.hung_up
    }

    fn phase(&self) -> CredentialPhase {
        self.phase
    }
}

enum Outcome {
    Shell(ScriptedShell),
    Refused,
    AuthFailure,
    Hang,
}

/// Connector that hands out scripted shells and failures in order.
///
/// Once the queue is exhausted every connect is refused.
pub(crate) struct ScriptedConnector {
    outcomes: Mutex<VecDeque<Outcome>>,
    log: EventLog,
}

impl ScriptedConnector {
    pub(crate) fn new() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            log: EventLog::default(),
        }
    }

    fn push(self, outcome: Outcome) -> Self {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push_back(outcome);
        }
        self
    }

    /// Next connect succeeds with `shell`.
    pub(crate) fn shell(self, shell: ScriptedShell) -> Self {
        self.push(Outcome::Shell(shell))
    }

    /// Next connect is refused.
    pub(crate) fn refused(self) -> Self {
        self.push(Outcome::Refused)
    }

    /// Next connect has its credentials rejected.
    pub(crate) fn auth_failure(self) -> Self {
        self.push(Outcome::AuthFailure)
    }

    /// Next connect hangs until its timeout.
    pub(crate) fn hang(self) -> Self {
        self.push(Outcome::Hang)
    }

    /// Snapshot of everything the scripted devices observed.
    pub(crate) fn events(&self) -> Vec<Event> {
        self.log.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Number of connect calls made so far.
    pub(crate) fn connect_attempts(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, Event::Connect { .. }))
            .count()
    }

    /// Inputs sent under `phase`, in order.
    pub(crate) fn sent(&self, phase: CredentialPhase) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Send { phase: p, input } if p == phase => Some(input),
                _ => None,
            })
            .collect()
    }

    fn next_outcome(&self) -> Outcome {
        self.outcomes
            .lock()
            .ok()
            .and_then(|mut outcomes| outcomes.pop_front())
            .unwrap_or(Outcome::Refused)
    }

    fn record_connect(&self, request: &ConnectRequest<'_>, ok: bool) {
        record(
            &self.log,
            Event::Connect {
                host: request.host.to_string(),
                username: request.credentials.username.clone(),
                phase: request.phase,
                ok,
            },
        );
    }
}

impl Connector for ScriptedConnector {
    type Session = ScriptedShell;

    async fn connect(&self, request: &ConnectRequest<'_>) -> Result<ScriptedShell> {
        let outcome = self.next_outcome();
        let error = match outcome {
            Outcome::Shell(mut shell) => {
                shell.phase = request.phase;
                shell.log = self.log.clone();
                match shell.read_until(request.prompt, request.timeout).await {
                    Ok(_) => {
                        self.record_connect(request, true);
                        return Ok(shell);
                    }
                    Err(e) => e,
                }
            }
            Outcome::Refused => TransportError::ConnectionFailed {
                host: request.host.to_string(),
                port: 22,
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            }
            .into(),
            Outcome::AuthFailure => TransportError::AuthenticationFailed {
                user: request.credentials.username.clone(),
            }
            .into(),
            Outcome::Hang => {
                tokio::time::sleep(request.timeout).await;
                TransportError::Timeout(request.timeout).into()
            }
        };
        self.record_connect(request, false);
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Credentials;

    #[tokio::test]
    async fn test_scripted_command_round() {
        let prompt = Regex::new(r"(?m)^gw>\s?$").unwrap();
        let mut shell = ScriptedShell::new("gw> ")
            .on("show version", "Firmware: 1.0")
            .on("show version", "Firmware: 2.0");
        shell.read_until(&prompt, Duration::from_secs(1)).await.unwrap();

        let first = shell
            .send_command("show version", &prompt, Duration::from_secs(1))
            .await
            .unwrap();
        let second = shell
            .send_command("show version", &prompt, Duration::from_secs(1))
            .await
            .unwrap();
        let third = shell
            .send_command("show version", &prompt, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(first.result, "Firmware: 1.0");
        assert_eq!(second.result, "Firmware: 2.0");
        assert_eq!(third.result, "Firmware: 2.0");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let creds = Credentials::new("admin", "admin");
        let prompt = Regex::new(r"(?m)^gw>\s?$").unwrap();
        let connector = ScriptedConnector::new().shell(ScriptedShell::new("gw> "));
        let request = ConnectRequest {
            host: "192.168.1.1",
            credentials: &creds,
            phase: CredentialPhase::Initial,
            prompt: &prompt,
            timeout: Duration::from_secs(1),
        };

        let mut shell = connector.connect(&request).await.unwrap();
        shell.close().await.unwrap();
        let after_first = connector.events();
        shell.close().await.unwrap();

        assert!(!shell.is_open());
        assert_eq!(connector.events(), after_first);
        assert!(shell.send("show version").await.is_err());
    }

    #[tokio::test]
    async fn test_buffered_shell_serves_unread_output_first() {
        let prompt = Regex::new(r"(?m)^gw>\s?$").unwrap();
        let failed = Regex::new(r"(?i)[^\n]*error[^\n]*\n").unwrap();
        let mut shell = ScriptedShell::new("gw> ")
            .buffered()
            .on("fetch", "error: timed out")
            .on("show version", "Firmware: 2.0");
        shell.read_until(&prompt, Duration::from_secs(1)).await.unwrap();

        shell.send("fetch").await.unwrap();
        let chunk = shell.read_until(&failed, Duration::from_secs(1)).await.unwrap();
        assert_eq!(chunk, "fetch\r\nerror: timed out\r\n");

        // The prompt printed after the error is still waiting to be read
        shell.send("show version").await.unwrap();
        let stale = shell.read_until(&prompt, Duration::from_secs(1)).await.unwrap();
        assert_eq!(stale.trim(), "gw>");

        let fresh = shell.read_until(&prompt, Duration::from_secs(1)).await.unwrap();
        assert!(fresh.contains("Firmware: 2.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_closes_after_pending_output() {
        let prompt = Regex::new(r"(?m)^gw>\s?$").unwrap();
        let done = Regex::new(r"(?i)rebooting").unwrap();
        let mut shell = ScriptedShell::new("gw> ").on_hangup("reboot", "Rebooting...");
        shell.read_until(&prompt, Duration::from_secs(1)).await.unwrap();

        shell.send("reboot").await.unwrap();
        let out = shell.read_until(&done, Duration::from_secs(1)).await.unwrap();
        assert!(out.ends_with("Rebooting"));

        let err = shell
            .read_until(&prompt, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Channel(ChannelError::Closed)));
        assert!(!shell.is_open());
    }
}
