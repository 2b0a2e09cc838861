//! Home battery interlock
//!
//! The battery system is controlled through operator-supplied command lines
//! (typically a curl call or a vendor CLI). Commands are spaced by a minimum
//! interval, bounded by a timeout, and their output is logged with credentials
//! masked.

use crate::config::BatteryConfig;
use crate::error::{HeliosError, Result};
use crate::logging::{StructuredLogger, get_logger};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterlockAction {
    LockDischarge,
    UnlockDischarge,
    EnableGridCharge,
    DisableGridCharge,
}

impl InterlockAction {
    pub fn as_str(self) -> &'static str {
        match self {
            InterlockAction::LockDischarge => "lock_discharge",
            InterlockAction::UnlockDischarge => "unlock_discharge",
            InterlockAction::EnableGridCharge => "enable_grid_charge",
            InterlockAction::DisableGridCharge => "disable_grid_charge",
        }
    }
}

impl fmt::Display for InterlockAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterlockOutcome {
    /// Command ran and exited zero; output is already redacted
    Executed { output: String },
    /// No command line configured for the action
    Skipped,
}

/// Battery system control
#[async_trait]
pub trait BatteryInterlock: Send + Sync {
    async fn execute(&self, action: InterlockAction) -> Result<InterlockOutcome>;
}

/// Runs the configured shell command lines
pub struct CommandInterlock {
    config: BatteryConfig,
    last_command: Mutex<Option<Instant>>,
    logger: StructuredLogger,
}

impl CommandInterlock {
    pub fn new(config: &BatteryConfig) -> Self {
        Self {
            config: config.clone(),
            last_command: Mutex::new(None),
            logger: get_logger("interlock"),
        }
    }

    fn command_for(&self, action: InterlockAction) -> Result<&str> {
        let line = match action {
            InterlockAction::LockDischarge => &self.config.lock_discharge_command,
            InterlockAction::UnlockDischarge => &self.config.unlock_discharge_command,
            InterlockAction::EnableGridCharge => &self.config.enable_grid_charge_command,
            InterlockAction::DisableGridCharge => &self.config.disable_grid_charge_command,
        };
        let line = line.trim();
        if line.is_empty() {
            Err(HeliosError::interlock_not_configured(action.as_str()))
        } else {
            Ok(line)
        }
    }

    async fn run(&self, action: InterlockAction, line: &str) -> Result<InterlockOutcome> {
        self.logger
            .info(&format!("Running {} command: {}", action, redact_credentials(line)));

        let limit = Duration::from_secs(self.config.command_timeout_seconds.max(1));
        let child = Command::new("sh")
            .arg("-c")
            .arg(line)
            .kill_on_drop(true)
            .output();
        let output = timeout(limit, child)
            .await
            .map_err(|_| {
                HeliosError::interlock_failed(format!(
                    "{} did not finish within {}s",
                    action,
                    limit.as_secs()
                ))
            })?
            .map_err(|e| HeliosError::interlock_failed(format!("{} could not start: {}", action, e)))?;

        let stdout = redact_credentials(String::from_utf8_lossy(&output.stdout).trim());
        let stderr = redact_credentials(String::from_utf8_lossy(&output.stderr).trim());

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let detail = if stderr.is_empty() { &stdout } else { &stderr };
            return Err(HeliosError::interlock_failed(format!(
                "{} exited with {}: {}",
                action, code, detail
            )));
        }

        if !stdout.is_empty() {
            self.logger.debug(&format!("{} output: {}", action, stdout));
        }
        Ok(InterlockOutcome::Executed { output: stdout })
    }
}

#[async_trait]
impl BatteryInterlock for CommandInterlock {
    async fn execute(&self, action: InterlockAction) -> Result<InterlockOutcome> {
        let line = match self.command_for(action) {
            Ok(line) => line.to_string(),
            Err(e) => {
                self.logger.debug(&format!("{}, skipping", e));
                return Ok(InterlockOutcome::Skipped);
            }
        };

        // Held across the run so commands never overlap either
        let mut last = self.last_command.lock().await;
        let spacing = Duration::from_secs(self.config.min_command_interval_seconds);
        if let Some(previous) = *last {
            let wait = spacing.saturating_sub(previous.elapsed());
            if !wait.is_zero() {
                self.logger
                    .debug(&format!("Delaying {} by {}ms", action, wait.as_millis()));
                sleep(wait).await;
            }
        }

        let result = self.run(action, &line).await;
        *last = Some(Instant::now());
        if let Err(ref e) = result {
            self.logger.error(&e.to_string());
        }
        result
    }
}

const SECRET_KEYS: [&str; 7] = [
    "api_key", "apikey", "password", "passwd", "pwd", "token", "secret",
];
const MASK: &str = "***";

fn is_value_end(b: u8) -> bool {
    b.is_ascii_whitespace() || matches!(b, b'&' | b';' | b',' | b'"' | b'\'')
}

/// Mask credential-looking substrings: `key=value` / `key: value` pairs for
/// common secret keys, `--password value` flags, bearer tokens and the
/// password part of URL user info.
pub fn redact_credentials(text: &str) -> String {
    redact_key_values(&redact_bearer(&redact_userinfo(text)))
}

fn redact_userinfo(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(scheme) = rest.find("://") {
        let start = scheme + 3;
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        let authority_end = rest
            .find(|c: char| c == '/' || c.is_whitespace())
            .unwrap_or(rest.len());
        let authority = &rest[..authority_end];
        if let Some(at) = authority.rfind('@')
            && let Some(colon) = authority[..at].find(':')
        {
            out.push_str(&authority[..=colon]);
            out.push_str(MASK);
            out.push_str(&authority[at..]);
            rest = &rest[authority_end..];
        }
    }
    out.push_str(rest);
    out
}

fn redact_bearer(text: &str) -> String {
    let lower = text.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    while let Some(found) = lower[cursor..].find("bearer ") {
        let token_start = cursor + found + "bearer ".len();
        let token_end = text[token_start..]
            .bytes()
            .position(is_value_end)
            .map(|p| token_start + p)
            .unwrap_or(text.len());
        out.push_str(&text[cursor..token_start]);
        if token_end > token_start {
            out.push_str(MASK);
        }
        cursor = token_end;
    }
    out.push_str(&text[cursor..]);
    out
}

fn redact_key_values(text: &str) -> String {
    let lower = text.to_ascii_lowercase();
    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut out = String::with_capacity(len);
    let mut i = 0;

    while i < len {
        let word_start = i == 0 || !bytes[i - 1].is_ascii_alphanumeric();
        if word_start && let Some(key) = SECRET_KEYS.iter().find(|k| lower[i..].starts_with(**k)) {
            let is_flag = i >= 2 && &bytes[i - 2..i] == b"--";
            let mut j = i + key.len();
            while j < len && matches!(bytes[j], b'"' | b'\'') {
                j += 1;
            }
            while j < len && bytes[j] == b' ' {
                j += 1;
            }
            let separated = if j < len && matches!(bytes[j], b'=' | b':') {
                j += 1;
                true
            } else {
                is_flag && j > i + key.len()
            };
            if separated {
                while j < len && matches!(bytes[j], b' ' | b'"' | b'\'') {
                    j += 1;
                }
                let value_end = bytes[j..]
                    .iter()
                    .position(|b| is_value_end(*b))
                    .map(|p| j + p)
                    .unwrap_or(len);
                if value_end > j {
                    out.push_str(&text[i..j]);
                    out.push_str(MASK);
                    i = value_end;
                    continue;
                }
            }
        }
        let ch_len = text[i..].chars().next().map(char::len_utf8).unwrap_or(1);
        out.push_str(&text[i..i + ch_len]);
        i += ch_len;
    }
    out
}
