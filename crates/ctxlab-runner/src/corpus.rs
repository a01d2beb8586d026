use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Pre-generated filler text addressed by dense zero-based integer ids.
/// Absence of id N means the corpus is exhausted at N.
pub trait NoiseCorpus {
    fn exists(&self, id: usize) -> bool;
    fn read(&self, id: usize) -> Result<String>;
}

/// Corpus backed by a directory of `chunk_{id}.txt` files.
pub struct DirCorpus {
    dir: PathBuf,
}

impl DirCorpus {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn chunk_path(&self, id: usize) -> PathBuf {
        self.dir.join(format!("chunk_{}.txt", id))
    }

    /// Count of dense ids starting at 0.
    pub fn available(&self) -> usize {
        let mut id = 0;
        while self.exists(id) {
            id += 1;
        }
        id
    }
}

impl NoiseCorpus for DirCorpus {
    fn exists(&self, id: usize) -> bool {
        self.chunk_path(id).exists()
    }

    fn read(&self, id: usize) -> Result<String> {
        let path = self.chunk_path(id);
        fs::read_to_string(&path).with_context(|| format!("reading noise chunk {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_corpus(tag: &str, chunks: &[&str]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "ctxlab_corpus_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        for (i, text) in chunks.iter().enumerate() {
            fs::write(dir.join(format!("chunk_{}.txt", i)), text).expect("write chunk");
        }
        dir
    }

    #[test]
    fn reads_dense_ids_and_reports_exhaustion() {
        let dir = temp_corpus("dense", &["first", "second"]);
        let corpus = DirCorpus::new(&dir);
        assert!(corpus.exists(0));
        assert!(corpus.exists(1));
        assert!(!corpus.exists(2));
        assert_eq!(corpus.read(1).expect("read"), "second");
        assert_eq!(corpus.available(), 2);
        assert!(corpus.read(2).is_err());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn empty_directory_is_exhausted_at_zero() {
        let dir = temp_corpus("empty", &[]);
        let corpus = DirCorpus::new(&dir);
        assert!(!corpus.exists(0));
        assert_eq!(corpus.available(), 0);
        let _ = fs::remove_dir_all(dir);
    }
}
