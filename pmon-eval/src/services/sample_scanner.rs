//! Sample input discovery
//!
//! Scans the input directory for newly arrived sample material: streamed
//! region files, pre-segmented sample folders, or zipped sample folders.
//! Also detects samples interrupted mid-processing by spotting their
//! orphaned checkpoint directory under the evaluation output root.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use pmon_common::ledger::CompletedLedger;
use pmon_common::pathname::ArtifactName;
use pmon_common::{Error, Result};

use crate::models::sample::{SampleIdentity, SampleSource};
use crate::services::checkpoint;
use crate::services::unpacker::Archiver;

/// Outcome of one discovery pass. At most one admission per call.
#[derive(Debug)]
pub enum Discovery {
    /// A previously unseen input unit.
    New {
        source: SampleSource,
        entry: PathBuf,
    },
    /// New material for an already-open, waiting sample.
    Reactivate(SampleIdentity),
    /// An orphaned checkpoint: resume directly from it.
    Resume { sample_name: String },
}

pub struct SampleScanner<'a> {
    input_dir: &'a Path,
    eval_out: &'a Path,
    archiver: &'a dyn Archiver,
}

impl<'a> SampleScanner<'a> {
    pub fn new(input_dir: &'a Path, eval_out: &'a Path, archiver: &'a dyn Archiver) -> Self {
        SampleScanner {
            input_dir,
            eval_out,
            archiver,
        }
    }

    /// Check for new sample input. Returns at most one discovery per call.
    ///
    /// Malformed artifact names abort admission of that one input unit with
    /// a logged, non-fatal skip; scanning continues.
    pub fn scan(
        &self,
        ledger: &dyn CompletedLedger,
        open: &[SampleIdentity],
    ) -> Result<Option<Discovery>> {
        if !self.input_dir.is_dir() {
            tracing::error!(dir = %self.input_dir.display(), "Cannot read input dir");
            return Ok(None);
        }

        let paths: Vec<PathBuf> = WalkDir::new(self.input_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.into_path()),
                Err(e) => {
                    tracing::warn!(error = %e, "Error accessing input entry");
                    None
                }
            })
            .collect();

        for path in paths {
            let file_name = match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };

            // Corrupted scanner output carries mangled name fragments.
            if file_name.contains('\u{FFFD}') || file_name.contains("_______") {
                continue;
            }

            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_name.clone());
            if ledger.contains(&stem)? {
                continue;
            }

            if path.is_dir() {
                if let Some(discovery) = self.check_folder(&path)? {
                    return Ok(Some(discovery));
                }
            } else if file_name.ends_with(".tif") || file_name.ends_with("asc.txt") {
                if let Some(discovery) = self.check_stream_file(&path, &file_name, ledger, open)? {
                    return Ok(Some(discovery));
                }
            } else if file_name.ends_with(".zip") {
                match self.archiver.contains_sample(&path) {
                    Ok(true) => {
                        return Ok(Some(Discovery::New {
                            source: SampleSource::Archive,
                            entry: path,
                        }))
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(archive = %file_name, error = %e, "Cannot inspect archive");
                    }
                }
            }
        }

        Ok(None)
    }

    /// A folder is a sample only with an `analysis/` status file and an
    /// `images/` directory.
    fn check_folder(&self, path: &Path) -> Result<Option<Discovery>> {
        let analysis = path.join("analysis");
        if !analysis.is_dir() {
            return Ok(None);
        }

        let has_status = std::fs::read_dir(&analysis)?
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().ends_with("asc.txt"));
        if !has_status {
            tracing::debug!(folder = %path.display(), "Sample without analysis file. Could not evaluate!");
            return Ok(None);
        }

        if !path.join("images").is_dir() {
            tracing::debug!(folder = %path.display(), "Sample without images folder. Could not evaluate!");
            return Ok(None);
        }

        Ok(Some(Discovery::New {
            source: SampleSource::Folder,
            entry: path.to_path_buf(),
        }))
    }

    /// A streamed region or end-marker file: may belong to an open sample,
    /// an interrupted one, or start a new one.
    fn check_stream_file(
        &self,
        path: &Path,
        file_name: &str,
        ledger: &dyn CompletedLedger,
        open: &[SampleIdentity],
    ) -> Result<Option<Discovery>> {
        let name = match ArtifactName::decode(file_name) {
            Ok(name) => name,
            Err(Error::Format(tail)) => {
                tracing::info!(artifact = %tail, "Wrong string format, skipping input unit");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let identity = SampleIdentity {
            device: name.device().to_string(),
            barcode: name.barcode().to_string(),
            date_time: name.date_time().to_string(),
        };

        // Part of an unfinished open sample?
        if let Some(matched) = open.iter().find(|id| **id == identity) {
            tracing::info!(sample = %matched.name(), "Continue evaluation of sample");
            return Ok(Some(Discovery::Reactivate(identity)));
        }

        // Already fully evaluated?
        if ledger.contains(&identity.name())? {
            tracing::debug!(sample = %identity.name(), "Sample already evaluated, skipping");
            return Ok(None);
        }

        // Interrupted by an unexpected shutdown?
        tracing::debug!("Check for interrupted sample");
        let sample_name = identity.name();
        if checkpoint::has_checkpoint(self.eval_out, &sample_name) {
            return Ok(Some(Discovery::Resume { sample_name }));
        }

        Ok(Some(Discovery::New {
            source: SampleSource::LiveStream,
            entry: path.to_path_buf(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmon_common::ledger::FileLedger;
    use tempfile::TempDir;

    struct NoArchives;
    impl Archiver for NoArchives {
        fn contains_sample(&self, _archive: &Path) -> Result<bool> {
            Ok(false)
        }
        fn unpack(&self, _archive: &Path) -> Result<PathBuf> {
            unreachable!()
        }
        fn pack(&self, _dir: &Path, _dest: &Path) -> Result<()> {
            unreachable!()
        }
    }

    const REGION: &str = "polle-ad_35_05_07-20230910100003-pmon-bar01-0012345678-tiff.tif";

    fn ledger(dir: &TempDir) -> FileLedger {
        FileLedger::open(dir.path().join("evaluated_samples.txt")).unwrap()
    }

    #[test]
    fn admits_stream_file() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        let out = dir.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(input.join(REGION), b"").unwrap();

        let scanner = SampleScanner::new(&input, &out, &NoArchives);
        let discovery = scanner.scan(&ledger(&dir), &[]).unwrap();
        match discovery {
            Some(Discovery::New {
                source: SampleSource::LiveStream,
                ..
            }) => {}
            other => panic!("unexpected discovery: {other:?}"),
        }
    }

    #[test]
    fn skips_malformed_names() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        let out = dir.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&out).unwrap();
        // not enough fields: a format error, skipped non-fatally
        std::fs::write(input.join("broken-name.tif"), b"").unwrap();

        let scanner = SampleScanner::new(&input, &out, &NoArchives);
        assert!(scanner.scan(&ledger(&dir), &[]).unwrap().is_none());
    }

    #[test]
    fn reactivates_open_sample() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        let out = dir.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(input.join(REGION), b"").unwrap();

        let open = vec![SampleIdentity {
            device: "bar01".into(),
            barcode: "0012345678".into(),
            date_time: "20230910100003".into(),
        }];

        let scanner = SampleScanner::new(&input, &out, &NoArchives);
        match scanner.scan(&ledger(&dir), &open).unwrap() {
            Some(Discovery::Reactivate(identity)) => {
                assert_eq!(identity, open[0]);
            }
            other => panic!("unexpected discovery: {other:?}"),
        }
    }

    #[test]
    fn detects_orphaned_checkpoint() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        let out = dir.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        // an interrupted run left its checkpoint directory behind
        std::fs::create_dir_all(out.join("20230910100003_0012345678").join("temp")).unwrap();
        std::fs::write(input.join(REGION), b"").unwrap();

        let scanner = SampleScanner::new(&input, &out, &NoArchives);
        match scanner.scan(&ledger(&dir), &[]).unwrap() {
            Some(Discovery::Resume { sample_name }) => {
                assert_eq!(sample_name, "20230910100003_0012345678");
            }
            other => panic!("unexpected discovery: {other:?}"),
        }
    }

    #[test]
    fn skips_evaluated_folder_sample() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        let out = dir.path().join("out");
        let folder = input.join("20230910100003_0012345678");
        std::fs::create_dir_all(folder.join("analysis")).unwrap();
        std::fs::create_dir_all(folder.join("images")).unwrap();
        std::fs::write(
            folder.join("analysis").join("polle-status-asc.txt"),
            b"Probenahmezeit;600\n",
        )
        .unwrap();
        std::fs::create_dir_all(&out).unwrap();

        let mut ledger = ledger(&dir);
        let scanner = SampleScanner::new(&input, &out, &NoArchives);

        // first pass admits the folder
        assert!(matches!(
            scanner.scan(&ledger, &[]).unwrap(),
            Some(Discovery::New {
                source: SampleSource::Folder,
                ..
            })
        ));

        // once in the ledger, it is never re-admitted
        ledger.add("20230910100003_0012345678").unwrap();
        assert!(scanner.scan(&ledger, &[]).unwrap().is_none());
    }
}
