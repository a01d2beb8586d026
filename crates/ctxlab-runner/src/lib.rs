//! Execution engine for context-degradation experiments: a scripted coding
//! task is posed to an interactive assistant backend at varying context-fill
//! levels, and every attempt is scored and persisted for analysis.

mod calibrate;
mod config;
mod context;
mod corpus;
mod experiment;
mod extract;
mod fsio;
mod proc;
mod session;
mod trial;
mod validate;

pub use calibrate::{CalibrationError, CalibrationRecord, Calibrator, ChunkMeasurement, FinalUsage};
pub use config::{ExperimentConfig, LevelSpec};
pub use context::{estimate_chunks_needed, ContextController, ControllerSettings, IncrementalOutcome};
pub use corpus::{DirCorpus, NoiseCorpus};
pub use experiment::{ExperimentDriver, RunOutcome, TrialPlan};
pub use extract::extract_code;
pub use fsio::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir};
pub use session::{
    classify_error, send_with_retry, AssistantSession, CliSession, RetryDecision, SessionResult,
    SessionUsage, MAX_RETRIES,
};
pub use trial::{truncate_output, TrialRunner};
pub use validate::{
    declaration_name, run_tests, validate_declarations, validate_hidden, validate_secrets,
    HiddenCheck, HiddenValidation, Matcher, Rubric, SecretSpec, SecretValidation, TestOutcome,
};
