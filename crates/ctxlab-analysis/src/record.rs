use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One immutable record per trial attempt. Created with placeholder fields at
/// trial start, fully populated by the runner, persisted exactly once to
/// `trial_{id}.json`, never mutated afterwards.
///
/// Every field carries a default so that partial records written by an
/// aborted trial (id, level, error, timestamp only) still load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialResult {
    pub trial_id: String,
    pub context_level: String,
    pub target_context_percent: f64,
    pub actual_context_percent: f64,
    pub chunks_used: usize,
    pub prompt_chars: usize,
    pub estimated_tokens: u64,
    pub timestamp: String,
    pub elapsed_seconds: f64,
    pub implementation_seconds: f64,
    pub use_incremental: bool,
    pub session_id: Option<String>,
    pub cli_success: bool,
    pub cli_error: Option<String>,
    pub cli_stderr: Option<String>,
    pub cli_stdout_preview: Option<String>,
    pub code_extracted: bool,
    pub artifact_digest: Option<String>,
    pub test_passed: bool,
    pub tests_total: u32,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub secret_header: bool,
    pub secret_footer: bool,
    pub secret_refs: u32,
    pub secret_score: f64,
    /// Per-hidden-check outcomes keyed by check id.
    pub hidden_checks: BTreeMap<String, bool>,
    pub hidden_score: f64,
    /// Per-required-declaration existence keyed by declaration name.
    pub func_results: BTreeMap<String, bool>,
    pub error: Option<String>,
}

impl TrialResult {
    /// A placeholder record for a trial that failed before producing any
    /// scores. Scores stay at their zero defaults so pass-rate denominators
    /// remain accurate.
    pub fn errored(trial_id: &str, context_level: &str, timestamp: String, error: String) -> Self {
        Self {
            trial_id: trial_id.to_string(),
            context_level: context_level.to_string(),
            timestamp,
            error: Some(error),
            ..Self::default()
        }
    }
}
