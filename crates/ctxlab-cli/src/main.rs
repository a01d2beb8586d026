use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use ctxlab_analysis::{calculate_summary, generate_report, ResultsRepository};
use ctxlab_runner::{
    atomic_write_bytes, atomic_write_json_pretty, estimate_chunks_needed, Calibrator, CliSession,
    ContextController, ControllerSettings, DirCorpus, ExperimentConfig, ExperimentDriver,
    TrialRunner,
};

#[derive(Parser)]
#[command(name = "ctxlab", version = "0.2.0", about = "Context-degradation experiment CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the trial plan an experiment config describes, without running it.
    Describe {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Measure context-fill cost per noise chunk against the live backend.
    Calibrate {
        config: PathBuf,
        #[arg(long, default_value_t = 10)]
        samples: usize,
        #[arg(long)]
        json: bool,
    },
    /// Run the full trial matrix.
    Run {
        config: PathBuf,
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        json: bool,
    },
    /// Re-analyze persisted results without touching the backend.
    Analyze {
        #[arg(long)]
        results_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write a starter config template to ./ctxlab.yaml.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Remove the generated artifact and, optionally, the results directory.
    Clean {
        config: PathBuf,
        #[arg(long)]
        results: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Describe { config, json } => {
            let cfg = ExperimentConfig::load(&config)?;
            let corpus = DirCorpus::new(&cfg.chunks_dir);
            let available = corpus.available();
            if json {
                let levels: Vec<Value> = cfg
                    .levels
                    .iter()
                    .map(|l| {
                        json!({
                            "label": l.label,
                            "target_percent": l.target_percent,
                            "chunks": l.chunks,
                            "band": l.band,
                            "strategy": strategy_name(&cfg, l.target_percent)
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "levels": levels,
                    "trials_per_level": cfg.trials_per_level,
                    "total_trials": cfg.total_trials(),
                    "capacity_tokens": cfg.capacity_tokens,
                    "chunks_available": available,
                    "results_dir": cfg.results_dir.display().to_string()
                })));
            }
            for level in &cfg.levels {
                println!(
                    "level {}: target {}%, {} chunks, strategy {}",
                    level.label,
                    level.target_percent,
                    level.chunks,
                    strategy_name(&cfg, level.target_percent)
                );
            }
            println!("trials_per_level: {}", cfg.trials_per_level);
            println!("total_trials: {}", cfg.total_trials());
            println!("capacity_tokens: {}", cfg.capacity_tokens);
            println!("chunks_available: {}", available);
            println!("results_dir: {}", cfg.results_dir.display());
        }
        Commands::Calibrate {
            config,
            samples,
            json,
        } => {
            let cfg = ExperimentConfig::load(&config)?;
            let controller = build_controller(&cfg)?;
            let mut calibrator = Calibrator::new(
                controller,
                &cfg.results_dir,
                cfg.calibration_ceiling_percent,
                cfg.capacity_tokens,
            );
            let record = calibrator.calibrate(samples)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "calibrate",
                    "num_samples": record.num_samples,
                    "successful_samples": record.successful_samples,
                    "average_increase_percent": record.average_increase_percent,
                    "average_total_tokens_per_chunk": record.average_total_tokens_per_chunk,
                    "final_context_percent": record.final_usage.context_percent,
                    "estimates": level_estimates(&cfg, record.average_increase_percent)
                })));
            }
            println!("samples: {}", record.num_samples);
            println!("successful: {}", record.successful_samples);
            println!("avg_increase_percent: {}", record.average_increase_percent);
            println!(
                "avg_tokens_per_chunk: {}",
                record.average_total_tokens_per_chunk
            );
            println!(
                "final_context_percent: {:.2}",
                record.final_usage.context_percent
            );
            for level in &cfg.levels {
                println!(
                    "level {}: ~{} chunks to reach {}%",
                    level.label,
                    estimate_chunks_needed(level.target_percent, record.average_increase_percent),
                    level.target_percent
                );
            }
        }
        Commands::Run { config, yes, json } => {
            let cfg = ExperimentConfig::load(&config)?;
            if !yes && !confirm_start(&cfg)? {
                println!("aborted");
                return Ok(None);
            }
            let controller = build_controller(&cfg)?;
            let runner = TrialRunner::new(controller, &cfg);
            let mut driver = ExperimentDriver::new(runner, &cfg);
            let outcome = driver.run()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "total_trials": outcome.total_trials,
                    "passed": outcome.passed,
                    "results_file": outcome.results_file.display().to_string(),
                    "report_file": outcome.report_file.display().to_string(),
                    "summary_file": outcome.summary_file.display().to_string()
                })));
            }
            println!("total_trials: {}", outcome.total_trials);
            println!("passed: {}", outcome.passed);
            println!("results_file: {}", outcome.results_file.display());
            println!("report_file: {}", outcome.report_file.display());
            println!("summary_file: {}", outcome.summary_file.display());
        }
        Commands::Analyze { results_dir, json } => {
            let repo = ResultsRepository::new(&results_dir);
            let results = repo.load()?;
            if results.is_empty() {
                return Err(anyhow::anyhow!(format!(
                    "no results found in {}",
                    results_dir.display()
                )));
            }
            let report = generate_report(&results);
            let summary = calculate_summary(&results);
            let report_file = results_dir.join("analysis_report.txt");
            let summary_file = results_dir.join("analysis_summary.json");
            atomic_write_bytes(&report_file, report.as_bytes())?;
            atomic_write_json_pretty(&summary_file, &summary)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "analyze",
                    "trials": results.len(),
                    "report_file": report_file.display().to_string(),
                    "summary_file": summary_file.display().to_string(),
                    "summary": serde_json::to_value(&summary)?
                })));
            }
            println!("{}", report);
            println!("report_file: {}", report_file.display());
            println!("summary_file: {}", summary_file.display());
        }
        Commands::Init { force } => {
            let path = std::env::current_dir()?.join("ctxlab.yaml");
            if !force && path.exists() {
                return Err(anyhow::anyhow!(format!(
                    "config already exists (use --force): {}",
                    path.display()
                )));
            }
            let template = "\
levels:
  - { label: '30%', target_percent: 30, chunks: 48 }
  - { label: '50%', target_percent: 50, chunks: 80 }
  - { label: '80%', target_percent: 80, chunks: 128 }
  - { label: '90%', target_percent: 90, chunks: 144 }
trials_per_level: 10
random_seed: 42
results_dir: results
chunks_dir: noise_chunks
spec_path: ''                         # REQUIRED: task specification markdown
prompt_path: ''                       # REQUIRED: instruction template text
artifact_path: ''                     # REQUIRED: where the generated code lands
workdir: .
test_command: []                      # REQUIRED: e.g. [pytest, tests/test_task.py, -v]
assistant_command: []                 # REQUIRED: e.g. [claude, --print, --output-format, json]
# capacity_tokens: 200000
# estimate_divisor: 4
# incremental_cutover_percent: 85
# batch_size: 20
# max_chunks_per_trial: 100
# calibration_ceiling_percent: 85
# send_timeout_secs: 120
# task_timeout_secs: 300
# test_timeout_secs: 60
";
            std::fs::write(&path, template)?;
            println!("wrote: {}", path.display());
            println!("next: edit {} and fill in all fields marked REQUIRED", path.display());
            println!("next: ctxlab describe {}", path.display());
        }
        Commands::Clean { config, results } => {
            let cfg = ExperimentConfig::load(&config)?;
            if cfg.artifact_path.exists() {
                std::fs::remove_file(&cfg.artifact_path)?;
                println!("removed: {}", cfg.artifact_path.display());
            }
            if results && cfg.results_dir.exists() {
                std::fs::remove_dir_all(&cfg.results_dir)?;
                println!("removed: {}", cfg.results_dir.display());
            }
        }
    }
    Ok(None)
}

fn build_controller(cfg: &ExperimentConfig) -> Result<ContextController<CliSession, DirCorpus>> {
    let spec_text = cfg.load_spec_text()?;
    let prompt_text = cfg.load_prompt_text()?;
    let session = CliSession::new(
        cfg.assistant_command.clone(),
        cfg.workdir.clone(),
        cfg.capacity_tokens,
        cfg.estimate_divisor,
    );
    let corpus = DirCorpus::new(&cfg.chunks_dir);
    let settings = ControllerSettings {
        ack_template: cfg.ack_template.clone(),
        batch_size: cfg.batch_size,
        max_chunks: cfg.max_chunks_per_trial,
        send_timeout: Duration::from_secs(cfg.send_timeout_secs),
        task_timeout: Duration::from_secs(cfg.task_timeout_secs),
    };
    Ok(ContextController::new(
        session,
        corpus,
        spec_text,
        prompt_text,
        settings,
    ))
}

fn confirm_start(cfg: &ExperimentConfig) -> Result<bool> {
    println!(
        "about to run {} trials across {} levels",
        cfg.total_trials(),
        cfg.levels.len()
    );
    print!("Start experiment? (y/N) ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn strategy_name(cfg: &ExperimentConfig, target_percent: f64) -> &'static str {
    if cfg.use_incremental(target_percent) {
        "batched"
    } else {
        "single_shot"
    }
}

fn level_estimates(cfg: &ExperimentConfig, increase_rate: f64) -> Value {
    let estimates: Vec<Value> = cfg
        .levels
        .iter()
        .map(|l| {
            json!({
                "label": l.label,
                "target_percent": l.target_percent,
                "estimated_chunks": estimate_chunks_needed(l.target_percent, increase_rate)
            })
        })
        .collect();
    Value::Array(estimates)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. }
        | Commands::Calibrate { json, .. }
        | Commands::Run { json, .. }
        | Commands::Analyze { json, .. } => *json,
        _ => false,
    }
}
