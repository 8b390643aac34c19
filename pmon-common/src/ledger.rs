//! Completed-sample ledger
//!
//! An append-only record of fully evaluated sample identities, consulted
//! during input discovery so finished samples are never re-admitted. The file
//! format is one identifier per line, newline-terminated, UTF-8. Single
//! writer, single process.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::Result;

/// Append-only key store used for completed-sample de-duplication.
///
/// Kept behind a trait so the file-backed store can be swapped for a proper
/// store without touching the coordinator.
pub trait CompletedLedger: Send {
    /// Whether `key` has been recorded.
    fn contains(&self, key: &str) -> Result<bool>;
    /// Record `key`; appending an already-present key is permitted.
    fn add(&mut self, key: &str) -> Result<()>;
}

/// File-backed ledger.
pub struct FileLedger {
    path: PathBuf,
}

impl FileLedger {
    /// Open a ledger file, creating it empty when missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Create completed-sample ledger");
            File::create(&path)?;
        }
        Ok(FileLedger { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CompletedLedger for FileLedger {
    fn contains(&self, key: &str) -> Result<bool> {
        let content = std::fs::read_to_string(&self.path)?;
        Ok(content.lines().any(|line| line.trim() == key))
    }

    fn add(&mut self, key: &str) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{key}")?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn add_then_contains() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("evaluated_samples.txt");

        let mut ledger = FileLedger::open(&path).unwrap();
        assert!(!ledger.contains("20230910100003_0012345678").unwrap());

        ledger.add("20230910100003_0012345678").unwrap();
        assert!(ledger.contains("20230910100003_0012345678").unwrap());
        assert!(!ledger.contains("20230910100003_0012345679").unwrap());
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("evaluated_samples.txt");

        {
            let mut ledger = FileLedger::open(&path).unwrap();
            ledger.add("sample-a").unwrap();
        }

        let ledger = FileLedger::open(&path).unwrap();
        assert!(ledger.contains("sample-a").unwrap());
    }
}
