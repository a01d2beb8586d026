use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use ctxlab_analysis::TrialResult;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::{ExperimentConfig, LevelSpec};
use crate::context::ContextController;
use crate::corpus::NoiseCorpus;
use crate::extract::extract_code;
use crate::fsio::{atomic_write_bytes, atomic_write_json_pretty};
use crate::session::AssistantSession;
use crate::validate::{
    declaration_name, run_tests, validate_declarations, validate_hidden, validate_secrets, Rubric,
    TestOutcome,
};

const OUTPUT_PREVIEW_CHARS: usize = 4000;

/// Middle-elided truncation that preserves both ends of the text.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    let half = max_chars / 2;
    let head: String = chars[..half].iter().collect();
    let tail: String = chars[chars.len() - half..].iter().collect();
    format!(
        "{}\n\n... [truncated {} chars] ...\n\n{}",
        head,
        chars.len() - max_chars,
        tail
    )
}

/// Runs one trial end to end: cleanup, context setup, task send, artifact
/// extraction, scoring, persistence. Failures at any step land in the result
/// record; only a failed persist is an error.
pub struct TrialRunner<S: AssistantSession, C: NoiseCorpus> {
    controller: ContextController<S, C>,
    rubric: Rubric,
    artifact_path: PathBuf,
    results_dir: PathBuf,
    test_command: Vec<String>,
    test_timeout: Duration,
    workdir: PathBuf,
    capacity_tokens: u64,
    estimate_divisor: u64,
    incremental_cutover_percent: f64,
}

impl<S: AssistantSession, C: NoiseCorpus> TrialRunner<S, C> {
    pub fn new(controller: ContextController<S, C>, config: &ExperimentConfig) -> Self {
        Self {
            controller,
            rubric: config.rubric.clone(),
            artifact_path: config.artifact_path.clone(),
            results_dir: config.results_dir.clone(),
            test_command: config.test_command.clone(),
            test_timeout: Duration::from_secs(config.test_timeout_secs),
            workdir: config.workdir.clone(),
            capacity_tokens: config.capacity_tokens,
            estimate_divisor: config.estimate_divisor.max(1),
            incremental_cutover_percent: config.incremental_cutover_percent,
        }
    }

    pub fn run_trial(&mut self, trial_id: &str, level: &LevelSpec) -> Result<TrialResult> {
        let timestamp = Utc::now().to_rfc3339();
        let start = Instant::now();

        self.cleanup_artifact();
        self.controller.reset();

        let use_incremental = level.target_percent >= self.incremental_cutover_percent;
        let full_prompt = self.controller.build_full_prompt(level.chunks)?;
        let prompt_chars = full_prompt.chars().count();
        let estimated_tokens = prompt_chars as u64 / self.estimate_divisor;
        let actual_context_percent =
            round2(estimated_tokens as f64 / self.capacity_tokens as f64 * 100.0);

        info!(
            trial_id,
            chunks = level.chunks,
            prompt_chars,
            estimated_tokens,
            context = format!("{:.1}%", actual_context_percent),
            target = level.target_percent,
            use_incremental,
            "sending task"
        );

        let impl_start = Instant::now();
        let (cli_success, response, cli_error, cli_stderr, session_id) = if use_incremental {
            let outcome = self.controller.run_batched(level.chunks);
            (
                outcome.success,
                outcome.response,
                outcome.error,
                None,
                outcome.session_id,
            )
        } else {
            let result = self.controller.send_task(&full_prompt);
            let stderr = if result.success {
                None
            } else {
                result.error.clone()
            };
            (
                result.success,
                result.content,
                result.error,
                stderr,
                result.session_id,
            )
        };
        let implementation_seconds = impl_start.elapsed().as_secs_f64();

        let mut code_extracted = false;
        let mut artifact_digest = None;
        if cli_success {
            match extract_code(&response, self.rubric.primary_declaration()) {
                Some(code) => {
                    atomic_write_bytes(&self.artifact_path, code.as_bytes())?;
                    artifact_digest = Some(hex::encode(Sha256::digest(code.as_bytes())));
                    code_extracted = true;
                    info!(trial_id, "artifact extracted and saved");
                }
                None => warn!(trial_id, "could not extract artifact from response"),
            }
        }

        let elapsed_seconds = start.elapsed().as_secs_f64();

        let (tests, secrets, declarations, hidden) = if code_extracted {
            let content = fs::read_to_string(&self.artifact_path).unwrap_or_default();
            (
                run_tests(&self.test_command, &self.workdir, self.test_timeout),
                validate_secrets(
                    &content,
                    &self.rubric.secret,
                    self.rubric.required_declarations.len(),
                ),
                validate_declarations(&content, &self.rubric.required_declarations),
                validate_hidden(&content, &self.rubric.hidden_checks),
            )
        } else {
            info!(trial_id, "skipping validation, no artifact");
            let declarations: BTreeMap<String, bool> = self
                .rubric
                .required_declarations
                .iter()
                .map(|d| (declaration_name(d), false))
                .collect();
            let hidden_checks: BTreeMap<String, bool> = self
                .rubric
                .hidden_checks
                .iter()
                .map(|c| (c.id.clone(), false))
                .collect();
            (
                TestOutcome::default(),
                Default::default(),
                declarations,
                crate::validate::HiddenValidation {
                    checks: hidden_checks,
                    hidden_score: 0.0,
                },
            )
        };

        let result = TrialResult {
            trial_id: trial_id.to_string(),
            context_level: level.label.clone(),
            target_context_percent: level.target_percent,
            actual_context_percent,
            chunks_used: level.chunks,
            prompt_chars,
            estimated_tokens,
            timestamp,
            elapsed_seconds: round2(elapsed_seconds),
            implementation_seconds: round2(implementation_seconds),
            use_incremental,
            session_id,
            cli_success,
            cli_error,
            cli_stderr: cli_stderr.map(|s| truncate_output(&s, OUTPUT_PREVIEW_CHARS)),
            cli_stdout_preview: if response.is_empty() {
                None
            } else {
                Some(truncate_output(&response, OUTPUT_PREVIEW_CHARS))
            },
            code_extracted,
            artifact_digest,
            test_passed: tests.passed,
            tests_total: tests.tests_total,
            tests_passed: tests.tests_passed,
            tests_failed: tests.tests_failed,
            secret_header: secrets.has_header,
            secret_footer: secrets.has_footer,
            secret_refs: secrets.ref_count,
            secret_score: secrets.secret_score,
            hidden_checks: hidden.checks,
            hidden_score: hidden.hidden_score,
            func_results: declarations,
            error: tests.error,
        };

        let trial_file = self.results_dir.join(format!("trial_{}.json", trial_id));
        atomic_write_json_pretty(&trial_file, &result)?;
        Ok(result)
    }

    fn cleanup_artifact(&self) {
        if self.artifact_path.exists() {
            let _ = fs::remove_file(&self.artifact_path);
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ControllerSettings;
    use crate::corpus::NoiseCorpus;
    use crate::session::{AssistantSession, SessionResult, SessionUsage};
    use std::path::Path;

    struct CannedSession {
        response: String,
        succeed: bool,
    }

    impl AssistantSession for CannedSession {
        fn send(&mut self, _prompt: &str, _timeout: Duration) -> SessionResult {
            SessionResult {
                success: self.succeed,
                content: if self.succeed {
                    self.response.clone()
                } else {
                    String::new()
                },
                input_tokens: 100,
                output_tokens: 50,
                session_id: Some("trial-session".to_string()),
                error: if self.succeed {
                    None
                } else {
                    Some("invalid request".to_string())
                },
                duration_ms: 10,
                usage_estimated: false,
            }
        }
        fn reset(&mut self) {}
        fn usage(&self) -> SessionUsage {
            SessionUsage::default()
        }
        fn fill_percent(&self) -> f64 {
            0.0
        }
    }

    struct MemCorpus;

    impl NoiseCorpus for MemCorpus {
        fn exists(&self, id: usize) -> bool {
            id < 4
        }
        fn read(&self, _id: usize) -> Result<String> {
            Ok("noise".to_string())
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "ctxlab_trial_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn config_in(dir: &Path) -> ExperimentConfig {
        let yaml = format!(
            "\
levels:
  - {{ label: \"30%\", target_percent: 30, chunks: 2 }}
trials_per_level: 1
results_dir: {dir}/results
chunks_dir: {dir}/chunks
spec_path: {dir}/spec.md
prompt_path: {dir}/prompt.txt
artifact_path: {dir}/fizzbuzz.py
workdir: {dir}
test_command: [sh, -c, \"echo ' PASSED'; exit 0\"]
assistant_command: [\"true\"]
",
            dir = dir.display()
        );
        let path = dir.join("ctxlab.yaml");
        fs::write(&path, yaml).expect("write config");
        ExperimentConfig::load(&path).expect("load config")
    }

    fn runner(dir: &Path, session: CannedSession) -> TrialRunner<CannedSession, MemCorpus> {
        let config = config_in(dir);
        let settings = ControllerSettings {
            ack_template: "{noise_content}".to_string(),
            batch_size: 20,
            max_chunks: 100,
            send_timeout: Duration::from_secs(1),
            task_timeout: Duration::from_secs(1),
        };
        let controller = ContextController::new(
            session,
            MemCorpus,
            "SPEC".to_string(),
            "PROMPT".to_string(),
            settings,
        )
        .with_sleep(Box::new(|_| {}));
        TrialRunner::new(controller, &config)
    }

    #[test]
    fn successful_trial_extracts_scores_and_persists() {
        let dir = temp_dir("success");
        let response = "\
```python
# EXPERIMENT-ID: MAGIC-7392
def fizzbuzz(n):  # ref: XYZ-999
    pass
def fizzbuzz_range(a, b):  # ref: XYZ-999
    pass
# Verified: BLUE-ELEPHANT
```";
        let mut runner = runner(
            &dir,
            CannedSession {
                response: response.to_string(),
                succeed: true,
            },
        );
        let level = LevelSpec {
            label: "30%".to_string(),
            target_percent: 30.0,
            chunks: 2,
            band: None,
        };
        let result = runner.run_trial("30%_001", &level).expect("trial");
        assert!(result.cli_success);
        assert!(result.code_extracted);
        assert!(result.artifact_digest.is_some());
        assert!(result.test_passed);
        assert!(result.secret_header && result.secret_footer);
        assert_eq!(result.secret_refs, 2);
        assert!(result.func_results["fizzbuzz"]);
        assert!(!result.func_results["fizzbuzz_custom"]);
        assert!(!result.use_incremental);

        let persisted = fs::read_to_string(dir.join("results").join("trial_30%_001.json"))
            .expect("trial file");
        assert!(persisted.contains("\"trial_id\": \"30%_001\""));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unextractable_response_zeroes_all_scores() {
        let dir = temp_dir("noextract");
        let mut runner = runner(
            &dir,
            CannedSession {
                response: "Sorry, I cannot help with that.".to_string(),
                succeed: true,
            },
        );
        let level = LevelSpec {
            label: "30%".to_string(),
            target_percent: 30.0,
            chunks: 2,
            band: None,
        };
        let result = runner.run_trial("30%_002", &level).expect("trial");
        assert!(result.cli_success);
        assert!(!result.code_extracted);
        assert_eq!(result.secret_score, 0.0);
        assert_eq!(result.hidden_score, 0.0);
        assert!(!result.test_passed);
        assert!(result.func_results.values().all(|v| !v));
        assert_eq!(result.hidden_checks.len(), 8);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn backend_failure_is_recorded_not_raised() {
        let dir = temp_dir("clifail");
        let mut runner = runner(
            &dir,
            CannedSession {
                response: String::new(),
                succeed: false,
            },
        );
        let level = LevelSpec {
            label: "30%".to_string(),
            target_percent: 30.0,
            chunks: 2,
            band: None,
        };
        let result = runner.run_trial("30%_003", &level).expect("trial");
        assert!(!result.cli_success);
        assert!(!result.code_extracted);
        assert!(result.cli_error.is_some());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn high_target_selects_incremental_strategy() {
        let dir = temp_dir("incremental");
        let mut runner = runner(
            &dir,
            CannedSession {
                response: "```python\ndef fizzbuzz(n):\n    pass\n```".to_string(),
                succeed: true,
            },
        );
        let level = LevelSpec {
            label: "90%".to_string(),
            target_percent: 90.0,
            chunks: 4,
            band: None,
        };
        let result = runner.run_trial("90%_001", &level).expect("trial");
        assert!(result.use_incremental);
        assert!(result.code_extracted);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn truncation_elides_the_middle_only() {
        let text = format!("{}{}{}", "a".repeat(3000), "MIDDLE", "b".repeat(3000));
        let out = truncate_output(&text, 4000);
        assert!(out.starts_with(&"a".repeat(2000)));
        assert!(out.ends_with(&"b".repeat(2000)));
        assert!(out.contains("... [truncated 2006 chars] ..."));
        assert!(!out.contains("MIDDLE"));

        let short = "short text";
        assert_eq!(truncate_output(short, 4000), short);
    }
}
