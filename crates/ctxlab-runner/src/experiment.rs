use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use ctxlab_analysis::{calculate_summary, generate_report, TrialResult};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{error, info};

use crate::config::{ExperimentConfig, LevelSpec};
use crate::corpus::NoiseCorpus;
use crate::fsio::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir};
use crate::session::AssistantSession;
use crate::trial::TrialRunner;

/// One scheduled trial. The full order is persisted before any trial runs so
/// an interrupted run can be reconstructed.
#[derive(Debug, Clone, Serialize)]
pub struct TrialPlan {
    pub trial_id: String,
    pub level: String,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub total_trials: usize,
    pub passed: usize,
    pub results_file: PathBuf,
    pub report_file: PathBuf,
    pub summary_file: PathBuf,
}

/// Runs the full trial matrix: every level crossed with every repetition, in
/// seeded-shuffled order so level effects are not confounded with drift over
/// the run. Results are re-persisted after every trial; a crash loses at most
/// the trial in flight.
pub struct ExperimentDriver<S: AssistantSession, C: NoiseCorpus> {
    runner: TrialRunner<S, C>,
    levels: Vec<LevelSpec>,
    trials_per_level: usize,
    random_seed: u64,
    results_dir: PathBuf,
}

impl<S: AssistantSession, C: NoiseCorpus> ExperimentDriver<S, C> {
    pub fn new(runner: TrialRunner<S, C>, config: &ExperimentConfig) -> Self {
        Self {
            runner,
            levels: config.levels.clone(),
            trials_per_level: config.trials_per_level,
            random_seed: config.random_seed,
            results_dir: config.results_dir.clone(),
        }
    }

    /// The shuffled cross product of levels and repetition indices.
    pub fn plan(&self) -> Vec<TrialPlan> {
        let mut plans = Vec::with_capacity(self.levels.len() * self.trials_per_level);
        for level in &self.levels {
            for index in 1..=self.trials_per_level {
                plans.push(TrialPlan {
                    trial_id: format!("{}_{:03}", level.label, index),
                    level: level.label.clone(),
                });
            }
        }
        let mut rng = StdRng::seed_from_u64(self.random_seed);
        plans.shuffle(&mut rng);
        plans
    }

    pub fn run(&mut self) -> Result<RunOutcome> {
        ensure_dir(&self.results_dir)?;
        let plans = self.plan();
        atomic_write_json_pretty(&self.results_dir.join("trial_order.json"), &plans)?;
        info!(total = plans.len(), "trial order fixed");

        let mut results: Vec<TrialResult> = Vec::with_capacity(plans.len());
        let results_file = self.results_dir.join("results.json");
        for (i, plan) in plans.iter().enumerate() {
            info!(
                trial = i + 1,
                total = plans.len(),
                trial_id = %plan.trial_id,
                "starting trial"
            );
            let level = match self.levels.iter().find(|l| l.label == plan.level) {
                Some(level) => level.clone(),
                None => continue,
            };
            let result = match self.runner.run_trial(&plan.trial_id, &level) {
                Ok(result) => result,
                Err(e) => {
                    error!(trial_id = %plan.trial_id, error = %e, "trial aborted");
                    let record = TrialResult::errored(
                        &plan.trial_id,
                        &plan.level,
                        Utc::now().to_rfc3339(),
                        e.to_string(),
                    );
                    let trial_file = self
                        .results_dir
                        .join(format!("trial_{}.json", plan.trial_id));
                    atomic_write_json_pretty(&trial_file, &record)?;
                    record
                }
            };
            results.push(result);
            atomic_write_json_pretty(&results_file, &results)?;
        }

        let report_file = self.results_dir.join("analysis_report.txt");
        atomic_write_bytes(&report_file, generate_report(&results).as_bytes())?;
        let summary_file = self.results_dir.join("analysis_summary.json");
        atomic_write_json_pretty(&summary_file, &calculate_summary(&results))?;

        let passed = results.iter().filter(|r| r.test_passed).count();
        info!(total = results.len(), passed, "experiment complete");
        Ok(RunOutcome {
            total_trials: results.len(),
            passed,
            results_file,
            report_file,
            summary_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextController, ControllerSettings};
    use crate::session::{SessionResult, SessionUsage};
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    struct CannedSession;

    impl AssistantSession for CannedSession {
        fn send(&mut self, _prompt: &str, _timeout: Duration) -> SessionResult {
            SessionResult {
                success: true,
                content: "```python\ndef fizzbuzz(n):\n    pass\n```".to_string(),
                input_tokens: 10,
                output_tokens: 5,
                session_id: Some("drv-1".to_string()),
                error: None,
                duration_ms: 1,
                usage_estimated: true,
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
            "ctxlab_experiment_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn config_in(dir: &Path, trials_per_level: usize, seed: u64) -> ExperimentConfig {
        let yaml = format!(
            "\
levels:
  - {{ label: \"30%\", target_percent: 30, chunks: 2 }}
  - {{ label: \"80%\", target_percent: 80, chunks: 3 }}
trials_per_level: {trials}
random_seed: {seed}
results_dir: {dir}/results
chunks_dir: {dir}/chunks
spec_path: {dir}/spec.md
prompt_path: {dir}/prompt.txt
artifact_path: {dir}/fizzbuzz.py
workdir: {dir}
test_command: [sh, -c, \"echo ' PASSED'; exit 0\"]
assistant_command: [\"true\"]
",
            trials = trials_per_level,
            seed = seed,
            dir = dir.display()
        );
        let path = dir.join("ctxlab.yaml");
        fs::write(&path, yaml).expect("write config");
        ExperimentConfig::load(&path).expect("load config")
    }

    fn driver(dir: &Path, trials_per_level: usize, seed: u64) -> ExperimentDriver<CannedSession, MemCorpus> {
        let config = config_in(dir, trials_per_level, seed);
        let settings = ControllerSettings {
            ack_template: "{noise_content}".to_string(),
            batch_size: 20,
            max_chunks: 100,
            send_timeout: Duration::from_secs(1),
            task_timeout: Duration::from_secs(1),
        };
        let controller = ContextController::new(
            CannedSession,
            MemCorpus,
            "SPEC".to_string(),
            "PROMPT".to_string(),
            settings,
        )
        .with_sleep(Box::new(|_| {}));
        let runner = TrialRunner::new(controller, &config);
        ExperimentDriver::new(runner, &config)
    }

    #[test]
    fn plan_is_the_full_cross_product_and_seed_deterministic() {
        let dir = temp_dir("plan");
        let drv = driver(&dir, 3, 42);
        let plan_a = drv.plan();
        let plan_b = drv.plan();
        assert_eq!(plan_a.len(), 6);
        let ids_a: Vec<&str> = plan_a.iter().map(|p| p.trial_id.as_str()).collect();
        let ids_b: Vec<&str> = plan_b.iter().map(|p| p.trial_id.as_str()).collect();
        assert_eq!(ids_a, ids_b);

        let mut sorted = ids_a.clone();
        sorted.sort();
        assert_eq!(
            sorted,
            vec!["30%_001", "30%_002", "30%_003", "80%_001", "80%_002", "80%_003"]
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn different_seeds_give_different_orders() {
        let dir = temp_dir("seeds");
        let a: Vec<String> = driver(&dir, 5, 1).plan().into_iter().map(|p| p.trial_id).collect();
        let b: Vec<String> = driver(&dir, 5, 2).plan().into_iter().map(|p| p.trial_id).collect();
        assert_ne!(a, b);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn run_persists_order_results_report_and_summary() {
        let dir = temp_dir("run");
        let mut drv = driver(&dir, 2, 7);
        let outcome = drv.run().expect("run");
        assert_eq!(outcome.total_trials, 4);
        assert_eq!(outcome.passed, 4);

        let results_dir = dir.join("results");
        assert!(results_dir.join("trial_order.json").exists());
        assert!(outcome.results_file.exists());
        assert!(outcome.report_file.exists());
        assert!(outcome.summary_file.exists());
        assert!(results_dir.join("trial_30%_001.json").exists());
        assert!(results_dir.join("trial_80%_002.json").exists());

        let aggregate: Vec<TrialResult> = serde_json::from_slice(
            &fs::read(&outcome.results_file).expect("read results"),
        )
        .expect("parse results");
        assert_eq!(aggregate.len(), 4);

        let report = fs::read_to_string(&outcome.report_file).expect("report");
        assert!(report.contains("[Per-level summary]"));
        let _ = fs::remove_dir_all(dir);
    }
}
