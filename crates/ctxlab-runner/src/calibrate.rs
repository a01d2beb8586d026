use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::context::ContextController;
use crate::corpus::NoiseCorpus;
use crate::fsio::atomic_write_json_pretty;
use crate::session::AssistantSession;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("no measurements collected")]
    NoMeasurements,
}

/// One chunk injection's before/after measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMeasurement {
    pub chunk_id: usize,
    pub before_percent: f64,
    pub after_percent: f64,
    pub increase_percent: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub success: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub context_percent: f64,
}

/// Persisted calibration output: the full per-chunk measurement list plus the
/// aggregate averages the context controller consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub timestamp: String,
    pub baseline: f64,
    pub num_samples: usize,
    pub successful_samples: usize,
    pub measurements: Vec<ChunkMeasurement>,
    pub average_increase_percent: f64,
    pub average_input_tokens_per_chunk: f64,
    pub average_output_tokens_per_chunk: f64,
    pub average_total_tokens_per_chunk: f64,
    pub final_usage: FinalUsage,
}

/// Empirically measures context-fill cost per noise chunk.
pub struct Calibrator<S: AssistantSession, C: NoiseCorpus> {
    controller: ContextController<S, C>,
    results_path: PathBuf,
    ceiling_percent: f64,
    capacity_tokens: u64,
}

impl<S: AssistantSession, C: NoiseCorpus> Calibrator<S, C> {
    pub fn new(
        controller: ContextController<S, C>,
        results_dir: &Path,
        ceiling_percent: f64,
        capacity_tokens: u64,
    ) -> Self {
        Self {
            controller,
            results_path: results_dir.join("calibration.json"),
            ceiling_percent,
            capacity_tokens,
        }
    }

    /// Inject up to `num_samples` chunks from a clean session, recording the
    /// fill delta of each. Stops early on an exhausted corpus or when fill
    /// crosses the safety ceiling. Averages cover successful samples only.
    pub fn calibrate(&mut self, num_samples: usize) -> Result<CalibrationRecord> {
        self.controller.reset();
        let baseline = self.controller.fill_percent();
        let mut measurements = Vec::new();

        for chunk_id in 0..num_samples {
            if !self.controller.has_chunk(chunk_id) {
                info!(chunk_id, "noise corpus exhausted, stopping calibration");
                break;
            }
            let before = self.controller.fill_percent();
            let result = self.controller.inject_chunk(chunk_id)?;
            let after = self.controller.fill_percent();

            if !result.success {
                warn!(chunk_id, error = ?result.error, "calibration injection failed");
            }
            info!(
                chunk_id,
                before = format!("{:.1}%", before),
                after = format!("{:.1}%", after),
                "calibration sample"
            );

            measurements.push(ChunkMeasurement {
                chunk_id,
                before_percent: round2(before),
                after_percent: round2(after),
                increase_percent: round2(after - before),
                input_tokens: result.input_tokens,
                output_tokens: result.output_tokens,
                total_tokens: result.total_tokens(),
                success: result.success,
                duration_ms: result.duration_ms,
            });

            if after > self.ceiling_percent {
                info!(
                    fill = format!("{:.1}%", after),
                    ceiling = self.ceiling_percent,
                    "context ceiling reached, stopping calibration"
                );
                break;
            }
        }

        if measurements.is_empty() {
            return Err(CalibrationError::NoMeasurements.into());
        }

        let successful: Vec<&ChunkMeasurement> =
            measurements.iter().filter(|m| m.success).collect();
        let n = successful.len() as f64;
        let (avg_increase, avg_input, avg_output, avg_total) = if successful.is_empty() {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            (
                successful.iter().map(|m| m.increase_percent).sum::<f64>() / n,
                successful.iter().map(|m| m.input_tokens as f64).sum::<f64>() / n,
                successful.iter().map(|m| m.output_tokens as f64).sum::<f64>() / n,
                successful.iter().map(|m| m.total_tokens as f64).sum::<f64>() / n,
            )
        };

        let usage = self.controller.usage();
        let record = CalibrationRecord {
            timestamp: Utc::now().to_rfc3339(),
            baseline,
            num_samples: measurements.len(),
            successful_samples: successful.len(),
            measurements,
            average_increase_percent: round3(avg_increase),
            average_input_tokens_per_chunk: avg_input.round(),
            average_output_tokens_per_chunk: avg_output.round(),
            average_total_tokens_per_chunk: avg_total.round(),
            final_usage: FinalUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                total_tokens: usage.total(),
                context_percent: usage.fill_percent(self.capacity_tokens),
            },
        };

        self.save(&record)?;
        Ok(record)
    }

    fn save(&self, record: &CalibrationRecord) -> Result<()> {
        atomic_write_json_pretty(&self.results_path, record)?;
        info!(path = %self.results_path.display(), "calibration record saved");
        Ok(())
    }

    pub fn load(&self) -> Result<Option<CalibrationRecord>> {
        if !self.results_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.results_path)
            .with_context(|| format!("reading {}", self.results_path.display()))?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ControllerSettings;
    use crate::session::{SessionResult, SessionUsage};
    use std::time::Duration;

    /// Session whose fill percentage follows a scripted trajectory, one entry
    /// per send.
    struct TrajectorySession {
        fills: Vec<f64>,
        capacity: u64,
        sends: usize,
        usage: SessionUsage,
    }

    impl TrajectorySession {
        fn new(fills: Vec<f64>) -> Self {
            Self {
                fills,
                capacity: 200_000,
                sends: 0,
                usage: SessionUsage::default(),
            }
        }
    }

    impl AssistantSession for TrajectorySession {
        fn send(&mut self, _prompt: &str, _timeout: Duration) -> SessionResult {
            let target = self.fills[self.sends.min(self.fills.len() - 1)];
            self.sends += 1;
            let want = (target / 100.0 * self.capacity as f64) as u64;
            let delta = want.saturating_sub(self.usage.total());
            self.usage.input_tokens += delta;
            SessionResult {
                success: true,
                content: "Acknowledged".to_string(),
                input_tokens: delta,
                output_tokens: 0,
                session_id: Some("cal-1".to_string()),
                error: None,
                duration_ms: 5,
                usage_estimated: true,
            }
        }
        fn reset(&mut self) {
            self.usage = SessionUsage::default();
        }
        fn usage(&self) -> SessionUsage {
            self.usage
        }
        fn fill_percent(&self) -> f64 {
            self.usage.fill_percent(self.capacity)
        }
    }

    struct MemCorpus {
        count: usize,
    }

    impl NoiseCorpus for MemCorpus {
        fn exists(&self, id: usize) -> bool {
            id < self.count
        }
        fn read(&self, id: usize) -> Result<String> {
            Ok(format!("chunk {}", id))
        }
    }

    fn temp_results_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "ctxlab_calibrate_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    fn calibrator(
        fills: Vec<f64>,
        corpus_size: usize,
        dir: &Path,
    ) -> Calibrator<TrajectorySession, MemCorpus> {
        let settings = ControllerSettings {
            ack_template: "{noise_content}".to_string(),
            batch_size: 20,
            max_chunks: 100,
            send_timeout: Duration::from_secs(1),
            task_timeout: Duration::from_secs(1),
        };
        let controller = ContextController::new(
            TrajectorySession::new(fills),
            MemCorpus { count: corpus_size },
            String::new(),
            String::new(),
            settings,
        );
        Calibrator::new(controller, dir, 85.0, 200_000)
    }

    #[test]
    fn stops_at_safety_ceiling_and_never_tries_the_next_chunk() {
        let dir = temp_results_dir("ceiling");
        // Fill jumps to 90% on the fifth injection (chunk id 4), crossing
        // the 85% ceiling; chunk 5 must never be attempted.
        let mut cal = calibrator(vec![10.0, 20.0, 30.0, 40.0, 90.0], 6, &dir);
        let record = cal.calibrate(6).expect("calibrate");
        assert_eq!(record.num_samples, 5);
        assert_eq!(record.successful_samples, 5);
        assert_eq!(record.measurements.last().map(|m| m.chunk_id), Some(4));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn stops_on_exhausted_corpus() {
        let dir = temp_results_dir("exhausted");
        let mut cal = calibrator(vec![5.0, 10.0, 15.0], 2, &dir);
        let record = cal.calibrate(6).expect("calibrate");
        assert_eq!(record.num_samples, 2);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn averages_and_persistence_round_trip() {
        let dir = temp_results_dir("roundtrip");
        let mut cal = calibrator(vec![5.0, 10.0, 15.0], 10, &dir);
        let record = cal.calibrate(3).expect("calibrate");
        assert_eq!(record.num_samples, 3);
        assert!((record.average_increase_percent - 5.0).abs() < 1e-9);
        assert!(record.final_usage.total_tokens > 0);

        let loaded = cal.load().expect("load").expect("present");
        assert_eq!(loaded.num_samples, 3);
        assert_eq!(loaded.measurements.len(), 3);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn zero_samples_is_an_explicit_error() {
        let dir = temp_results_dir("empty");
        let mut cal = calibrator(vec![5.0], 0, &dir);
        let err = cal.calibrate(6).expect_err("must fail");
        assert!(err.to_string().contains("no measurements"));
        let _ = fs::remove_dir_all(dir);
    }
}
