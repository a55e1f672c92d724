//! Response type for command execution results.

use std::time::Duration;

use regex::bytes::Regex;

/// Response from a command execution.
#[derive(Debug, Clone)]
pub struct Response {
    /// The command that was executed.
    pub command: String,

    /// The command output (normalized - command echo and trailing prompt removed).
    pub result: String,

    /// The raw output before normalization.
    pub raw_result: String,

    /// The prompt that was matched at the end.
    pub prompt: String,

    /// Time taken to execute the command.
    pub elapsed: Duration,

    /// Failure message if the command failed (based on failure patterns).
    pub failure_message: Option<String>,
}

impl Response {
    /// Build a response from raw shell output ending in `prompt`.
    pub fn from_raw(command: &str, raw: String, prompt: &Regex, elapsed: Duration) -> Self {
        let raw = raw.replace('\r', "");

        let (body, matched_prompt) = match prompt.find(raw.as_bytes()) {
            Some(m) => (&raw[..m.start()], raw[m.start()..m.end()].trim().to_string()),
            None => (raw.as_str(), String::new()),
        };

        // Strip the echoed command line
        let body = match body.split_once('\n') {
            Some((first, rest)) if first.trim().ends_with(command.trim()) => rest,
            None if body.trim().ends_with(command.trim()) => "",
            _ => body,
        };

        Self {
            command: command.to_string(),
            result: body.trim_end().to_string(),
            raw_result: raw.clone(),
            prompt: matched_prompt,
            elapsed,
            failure_message: None,
        }
    }

    /// Mark the response as failed.
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure_message = Some(message.into());
        self
    }

    /// Get the result lines as an iterator.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.result.lines()
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.result)
    }
}
