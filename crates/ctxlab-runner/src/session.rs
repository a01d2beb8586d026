use std::path::PathBuf;
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::proc::run_with_deadline;

/// Bounded retry attempts for transient backend failures.
pub const MAX_RETRIES: u32 = 3;

/// Cumulative token usage over the lifetime of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl SessionUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn fill_percent(&self, capacity_tokens: u64) -> f64 {
        if capacity_tokens == 0 {
            return 0.0;
        }
        self.total() as f64 / capacity_tokens as f64 * 100.0
    }
}

/// Outcome of one backend interaction. Ordinary failures (timeout, non-zero
/// exit, rate limit) are `success = false` with a populated error, never a
/// Rust error.
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub success: bool,
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// True when token counts came from the chars/divisor fallback rather
    /// than the backend's own accounting.
    pub usage_estimated: bool,
}

impl SessionResult {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    fn failure(error: String, duration_ms: u64) -> Self {
        Self {
            success: false,
            content: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            session_id: None,
            error: Some(error),
            duration_ms,
            usage_estimated: false,
        }
    }
}

#[derive(Debug, Error)]
enum SessionError {
    #[error("assistant command not found: {0}")]
    CommandNotFound(String),
    #[error("timeout after {0}s")]
    Timeout(u64),
    #[error("failed to start assistant command: {0}")]
    Spawn(std::io::Error),
}

/// One interactive coding-assistant backend: send a prompt, get text and
/// usage back, with cumulative usage tracked until `reset`.
pub trait AssistantSession {
    fn send(&mut self, prompt: &str, timeout: Duration) -> SessionResult;
    fn reset(&mut self);
    fn usage(&self) -> SessionUsage;
    fn fill_percent(&self) -> f64;
}

/// Whether a failed send is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Fail,
}

pub fn classify_error(error: &str) -> RetryDecision {
    let lower = error.to_lowercase();
    if lower.contains("rate") || lower.contains("timeout") || lower.contains("overloaded") {
        RetryDecision::Retry
    } else {
        RetryDecision::Fail
    }
}

/// Bounded retry loop around `send`. The sleep function is injected so tests
/// observe backoff without real delays. Exhaustion tags the error with the
/// attempt count.
pub fn send_with_retry<S: AssistantSession + ?Sized>(
    session: &mut S,
    prompt: &str,
    timeout: Duration,
    max_retries: u32,
    sleep: &mut dyn FnMut(Duration),
) -> SessionResult {
    let mut last = session.send(prompt, timeout);
    for attempt in 1..max_retries {
        if last.success {
            return last;
        }
        let error = last.error.clone().unwrap_or_default();
        match classify_error(&error) {
            RetryDecision::Fail => return last,
            RetryDecision::Retry => {
                warn!(attempt, error = %error, "transient backend failure, retrying");
                sleep(Duration::from_secs(5 * attempt as u64));
                last = session.send(prompt, timeout);
            }
        }
    }
    if !last.success {
        let error = last.error.take().unwrap_or_else(|| "send failed".to_string());
        last.error = Some(format!("{} (after {} attempts)", error, max_retries));
    }
    last
}

/// Session adapter over an interactive CLI backend. Continuation uses
/// `--resume <session_id>` once an id is known; each send appends to the
/// cumulative usage counters.
pub struct CliSession {
    command: Vec<String>,
    workdir: PathBuf,
    capacity_tokens: u64,
    estimate_divisor: u64,
    session_id: Option<String>,
    message_count: u32,
    usage: SessionUsage,
}

impl CliSession {
    pub fn new(
        command: Vec<String>,
        workdir: PathBuf,
        capacity_tokens: u64,
        estimate_divisor: u64,
    ) -> Self {
        Self {
            command,
            workdir,
            capacity_tokens,
            estimate_divisor: estimate_divisor.max(1),
            session_id: None,
            message_count: 0,
            usage: SessionUsage::default(),
        }
    }

    pub fn message_count(&self) -> u32 {
        self.message_count
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn run_backend(&self, prompt: &str, timeout: Duration) -> Result<crate::proc::ProcOutput, SessionError> {
        let program = self
            .command
            .first()
            .ok_or_else(|| SessionError::CommandNotFound("<empty>".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..]);
        if let Some(id) = &self.session_id {
            cmd.args(["--resume", id]);
        }
        cmd.args(["-p", prompt]);
        cmd.current_dir(&self.workdir);

        let out = run_with_deadline(cmd, timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SessionError::CommandNotFound(program.clone())
            } else {
                SessionError::Spawn(e)
            }
        })?;
        if out.timed_out {
            return Err(SessionError::Timeout(timeout.as_secs()));
        }
        Ok(out)
    }
}

impl AssistantSession for CliSession {
    fn send(&mut self, prompt: &str, timeout: Duration) -> SessionResult {
        let out = match self.run_backend(prompt, timeout) {
            Ok(out) => out,
            Err(e) => return SessionResult::failure(e.to_string(), 0),
        };
        let duration_ms = out.duration.as_millis() as u64;
        let content = out.stdout;

        // Prefer the backend's own JSON accounting; fall back to a labeled
        // character-count estimate.
        let mut usage_estimated = true;
        let mut input_tokens = 0;
        let mut output_tokens = 0;
        if let Some(parsed) = last_json_line(&content) {
            if let Some(id) = parsed.get("session_id").and_then(|v| v.as_str()) {
                self.session_id = Some(id.to_string());
            }
            if let Some(usage) = parsed.get("usage") {
                input_tokens = usage
                    .get("input_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                output_tokens = usage
                    .get("output_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                usage_estimated = false;
            }
        }
        if self.session_id.is_none() {
            if let Some(id) = scan_session_id(&content) {
                self.session_id = Some(id);
            }
        }
        if usage_estimated {
            input_tokens = prompt.chars().count() as u64 / self.estimate_divisor;
            output_tokens = content.chars().count() as u64 / self.estimate_divisor;
        }

        let exit_ok = out.status.map(|s| s.success()).unwrap_or(false);
        if self.session_id.is_none() && exit_ok {
            self.session_id = Some(format!("session_{}", Utc::now().timestamp()));
        }

        self.message_count += 1;
        self.usage.input_tokens += input_tokens;
        self.usage.output_tokens += output_tokens;
        debug!(
            message = self.message_count,
            input_tokens, output_tokens, usage_estimated, "backend send complete"
        );

        if !exit_ok {
            let code = out.status.and_then(|s| s.code());
            let error = if out.stderr.trim().is_empty() {
                format!("exit code: {}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))
            } else {
                out.stderr.clone()
            };
            return SessionResult {
                success: false,
                content,
                input_tokens,
                output_tokens,
                session_id: self.session_id.clone(),
                error: Some(error),
                duration_ms,
                usage_estimated,
            };
        }

        SessionResult {
            success: true,
            content,
            input_tokens,
            output_tokens,
            session_id: self.session_id.clone(),
            error: None,
            duration_ms,
            usage_estimated,
        }
    }

    fn reset(&mut self) {
        self.session_id = None;
        self.message_count = 0;
        self.usage = SessionUsage::default();
    }

    fn usage(&self) -> SessionUsage {
        self.usage
    }

    fn fill_percent(&self) -> f64 {
        self.usage.fill_percent(self.capacity_tokens)
    }
}

fn last_json_line(output: &str) -> Option<Value> {
    let line = output.lines().rev().find(|l| !l.trim().is_empty())?;
    serde_json::from_str::<Value>(line.trim())
        .ok()
        .filter(|v| v.is_object())
}

fn scan_session_id(output: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#"(?i)session[_-]?id["\s:]+([a-f0-9-]+)"#).expect("literal regex")
    });
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
