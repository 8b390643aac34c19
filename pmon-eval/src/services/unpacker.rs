//! Archive handling via the system's zip tools
//!
//! Archive extraction and creation are external collaborators: they are
//! driven through the `unzip`/`zip` command-line tools and never
//! reimplemented here. Kept behind a trait so tests can substitute a fake.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use uuid::Uuid;

use pmon_common::Result;

/// Archive tool errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// zip/unzip binary not found in PATH
    #[error("Archive tool not found: {0}")]
    ToolNotFound(String),

    /// Tool invocation failed
    #[error("{0} failed: {1}")]
    ToolFailed(String, String),

    /// Archive content did not match the expected sample layout
    #[error("Unexpected archive layout: {0}")]
    UnexpectedLayout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<ArchiveError> for pmon_common::Error {
    fn from(e: ArchiveError) -> Self {
        match e {
            ArchiveError::ToolNotFound(msg) => pmon_common::Error::Config(msg),
            ArchiveError::IoError(io) => pmon_common::Error::Io(io),
            other => pmon_common::Error::Integrity(other.to_string()),
        }
    }
}

/// Archive extraction and creation for sample folders.
pub trait Archiver: Send + Sync {
    /// Whether the archive carries a sample folder (a top-level directory
    /// with an `analysis/` member).
    fn contains_sample(&self, archive: &Path) -> Result<bool>;

    /// Unpack the archive into a fresh temporary directory and return the
    /// single top-level sample folder inside it.
    fn unpack(&self, archive: &Path) -> Result<PathBuf>;

    /// Pack `dir` into a zip archive at `dest`.
    fn pack(&self, dir: &Path, dest: &Path) -> Result<()>;
}

/// System `zip`/`unzip` backed archiver.
pub struct CommandArchiver {
    unzip: String,
    zip: String,
}

impl CommandArchiver {
    pub fn new() -> Self {
        CommandArchiver {
            unzip: "unzip".to_string(),
            zip: "zip".to_string(),
        }
    }

    fn run(command: &str, args: &[&str]) -> std::result::Result<Vec<u8>, ArchiveError> {
        Self::run_in(command, args, None)
    }

    fn run_in(
        command: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> std::result::Result<Vec<u8>, ArchiveError> {
        let mut invocation = Command::new(command);
        invocation.args(args);
        if let Some(cwd) = cwd {
            invocation.current_dir(cwd);
        }
        let output = invocation.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArchiveError::ToolNotFound(format!("{command} not found in PATH"))
            } else {
                ArchiveError::ToolFailed(command.to_string(), e.to_string())
            }
        })?;
        if !output.status.success() {
            return Err(ArchiveError::ToolFailed(
                command.to_string(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(output.stdout)
    }
}

impl Default for CommandArchiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Archiver for CommandArchiver {
    fn contains_sample(&self, archive: &Path) -> Result<bool> {
        let listing = Self::run(&self.unzip, &["-Z1", &archive.to_string_lossy()])
            .map_err(pmon_common::Error::from)?;
        let listing = String::from_utf8_lossy(&listing);
        Ok(listing.lines().any(|line| {
            let mut parts = line.split('/');
            matches!(
                (parts.next(), parts.next()),
                (Some(top), Some("analysis")) if !top.is_empty()
            )
        }))
    }

    fn unpack(&self, archive: &Path) -> Result<PathBuf> {
        tracing::info!(archive = %archive.display(), "Unzip sample");
        let target = std::env::temp_dir().join(format!("pmon-unpack-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&target)?;

        Self::run(
            &self.unzip,
            &[
                "-o",
                &archive.to_string_lossy(),
                "-d",
                &target.to_string_lossy(),
            ],
        )
        .map_err(pmon_common::Error::from)?;

        let subfolders: Vec<PathBuf> = std::fs::read_dir(&target)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        if subfolders.len() != 1 {
            return Err(ArchiveError::UnexpectedLayout(format!(
                "expected one sample folder in {}, found {}",
                archive.display(),
                subfolders.len()
            ))
            .into());
        }
        Ok(subfolders.into_iter().next().unwrap())
    }

    fn pack(&self, dir: &Path, dest: &Path) -> Result<()> {
        Self::run_in(
            &self.zip,
            &["-r", "-q", &dest.to_string_lossy(), "."],
            Some(dir),
        )
        .map_err(pmon_common::Error::from)?;
        Ok(())
    }
}
