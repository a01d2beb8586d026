use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::validate::Rubric;

/// One configured context-fill level: a label, its target percentage, the
/// fixed chunk count used by the single-shot strategy, and an optional
/// acceptance band for the incremental strategy.
#[derive(Debug, Clone, Deserialize)]
pub struct LevelSpec {
    pub label: String,
    pub target_percent: f64,
    pub chunks: usize,
    #[serde(default)]
    pub band: Option<[f64; 2]>,
}

/// Experiment configuration, loaded once at startup from YAML. Missing static
/// inputs (spec text, instruction template) are fatal before any trial runs.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default = "default_capacity_tokens")]
    pub capacity_tokens: u64,
    #[serde(default = "default_estimate_divisor")]
    pub estimate_divisor: u64,
    pub levels: Vec<LevelSpec>,
    pub trials_per_level: usize,
    #[serde(default)]
    pub random_seed: u64,
    #[serde(default = "default_incremental_cutover")]
    pub incremental_cutover_percent: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_chunks")]
    pub max_chunks_per_trial: usize,
    #[serde(default = "default_calibration_ceiling")]
    pub calibration_ceiling_percent: f64,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
    #[serde(default)]
    pub rubric: Rubric,
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    pub results_dir: PathBuf,
    pub chunks_dir: PathBuf,
    pub spec_path: PathBuf,
    pub prompt_path: PathBuf,
    pub artifact_path: PathBuf,
    pub test_command: Vec<String>,
    pub assistant_command: Vec<String>,
    #[serde(default = "default_ack_template")]
    pub ack_template: String,
}

fn default_capacity_tokens() -> u64 {
    200_000
}
fn default_estimate_divisor() -> u64 {
    4
}
fn default_incremental_cutover() -> f64 {
    85.0
}
fn default_batch_size() -> usize {
    20
}
fn default_max_chunks() -> usize {
    100
}
fn default_calibration_ceiling() -> f64 {
    85.0
}
fn default_send_timeout() -> u64 {
    120
}
fn default_task_timeout() -> u64 {
    300
}
fn default_test_timeout() -> u64 {
    60
}
fn default_workdir() -> PathBuf {
    PathBuf::from(".")
}
fn default_ack_template() -> String {
    "Please read and acknowledge the following reference material. \
     Just respond with 'Acknowledged' after reading:\n\n{noise_content}"
        .to_string()
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        let json: Value = serde_json::to_value(yaml)?;
        validate_required_fields(&json)?;
        let config: ExperimentConfig = serde_json::from_value(json)
            .with_context(|| format!("interpreting config {}", path.display()))?;
        config.rubric.validate()?;
        Ok(config)
    }

    /// Fatal configuration error if the file is absent.
    pub fn load_spec_text(&self) -> Result<String> {
        fs::read_to_string(&self.spec_path)
            .with_context(|| format!("task specification not found at {}", self.spec_path.display()))
    }

    pub fn load_prompt_text(&self) -> Result<String> {
        fs::read_to_string(&self.prompt_path).with_context(|| {
            format!(
                "instruction template not found at {}",
                self.prompt_path.display()
            )
        })
    }

    /// Strategy selection is pure configuration: at or above the cutover the
    /// batched-incremental strategy is used, below it single-shot.
    pub fn use_incremental(&self, target_percent: f64) -> bool {
        target_percent >= self.incremental_cutover_percent
    }

    pub fn total_trials(&self) -> usize {
        self.levels.len() * self.trials_per_level
    }

    pub fn level(&self, label: &str) -> Option<&LevelSpec> {
        self.levels.iter().find(|l| l.label == label)
    }
}

/// Check every required field and report all missing ones in one error.
fn validate_required_fields(json: &Value) -> Result<()> {
    let required: &[&str] = &[
        "/levels",
        "/trials_per_level",
        "/results_dir",
        "/chunks_dir",
        "/spec_path",
        "/prompt_path",
        "/artifact_path",
        "/test_command",
        "/assistant_command",
    ];
    let mut missing = Vec::new();
    for pointer in required {
        let value = json.pointer(pointer);
        let is_missing = match value {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Array(a)) => a.is_empty(),
            Some(Value::Number(n)) => {
                n.as_u64() == Some(0) && *pointer == "/trials_per_level"
            }
            _ => false,
        };
        if is_missing {
            missing.push(*pointer);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "config missing required fields:\n{}",
            missing
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    }
}
