//! Analysis of context-degradation experiment results: loading persisted
//! trial records, per-level descriptive statistics, pairwise inferential
//! tests, and the human-readable report.

mod record;
mod report;
mod repository;
mod stats;

pub use record::TrialResult;
pub use report::generate_report;
pub use repository::{LoadStrategy, ResultsRepository};
pub use stats::{
    calculate_summary, chi_square_test, group_by_level, welch_t_test, ChiSquareResult,
    GroupRate, LevelSummary, WelchTResult, CHI_SQUARE_CRITICAL_1DF,
};
