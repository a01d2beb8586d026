use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::record::TrialResult;

/// How a run's result set is laid out on disk. Per-trial files are the
/// primary representation (crash-safe, one file per completed trial); the
/// single aggregate file is the legacy fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    PerTrialFiles,
    AggregateFile,
}

/// Loads persisted trial records from a results directory. The strategy is
/// selected by probing file existence, never by sniffing content.
pub struct ResultsRepository {
    results_dir: PathBuf,
}

impl ResultsRepository {
    pub fn new(results_dir: &Path) -> Self {
        Self {
            results_dir: results_dir.to_path_buf(),
        }
    }

    /// The strategy that `load` would use, or None when the directory holds
    /// no results at all.
    pub fn probe(&self) -> Option<LoadStrategy> {
        if !self.trial_files().unwrap_or_default().is_empty() {
            return Some(LoadStrategy::PerTrialFiles);
        }
        if self.results_dir.join("results.json").exists() {
            return Some(LoadStrategy::AggregateFile);
        }
        None
    }

    /// Load all records. Returns an empty vector when no results exist.
    pub fn load(&self) -> Result<Vec<TrialResult>> {
        match self.probe() {
            Some(LoadStrategy::PerTrialFiles) => {
                let files = self.trial_files()?;
                let mut results = Vec::with_capacity(files.len());
                for path in &files {
                    let bytes = fs::read(path)
                        .with_context(|| format!("reading trial file {}", path.display()))?;
                    let record: TrialResult = serde_json::from_slice(&bytes)
                        .with_context(|| format!("parsing trial file {}", path.display()))?;
                    results.push(record);
                }
                info!(count = results.len(), "loaded trial results from individual files");
                Ok(results)
            }
            Some(LoadStrategy::AggregateFile) => {
                let path = self.results_dir.join("results.json");
                let bytes = fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let results: Vec<TrialResult> = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing {}", path.display()))?;
                info!(count = results.len(), "loaded trial results from results.json");
                Ok(results)
            }
            None => Ok(Vec::new()),
        }
    }

    fn trial_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.results_dir.exists() {
            return Ok(files);
        }
        for entry in fs::read_dir(&self.results_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("trial_") && name.ends_with(".json") {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}
