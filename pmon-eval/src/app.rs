//! Sample coordinator
//!
//! Owns the set of in-flight samples and drives the single logical thread of
//! control: poll for new input, give every active sample one region turn,
//! sleep when nothing is ready. There is no parallel execution across
//! samples or regions; recovery from interruption is restart plus checkpoint
//! reload, never in-process retry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pmon_common::config::{EvalConfig, RetryConfig};
use pmon_common::ledger::CompletedLedger;
use pmon_common::pathname::{modify, ArtifactName, ElemKind, PathField};
use pmon_common::species::SpeciesTable;
use pmon_common::{Error, Result};

use crate::capability::{ClassifierHandle, DetectorHandle};
use crate::imaging::with_retry;
use crate::models::sample::{
    Sample, SampleBuilder, SampleIdentity, SampleSource, SampleState,
};
use crate::services::checkpoint;
use crate::services::dynamic_threshold;
use crate::services::region_processor::RegionProcessor;
use crate::services::report;
use crate::services::sample_scanner::{Discovery, SampleScanner};
use crate::services::status_doc::StatusDoc;
use crate::services::unpacker::Archiver;

/// Outcome of asking a sample for its next region.
enum NextRegion {
    /// A region is ready for processing.
    Ready(PathBuf),
    /// The end marker was observed and all pending regions are consumed.
    EndOfSample,
    /// The source has no next region yet and no end marker either.
    Waiting,
}

/// The evaluation service: coordinator state plus its collaborators.
pub struct EvalApp {
    config: EvalConfig,
    species: Arc<SpeciesTable>,
    detector: DetectorHandle,
    classifier: ClassifierHandle,
    ledger: Box<dyn CompletedLedger>,
    archiver: Box<dyn Archiver>,
    open_samples: Vec<Sample>,
    software_version: String,
    waiting_logged: bool,
}

impl EvalApp {
    pub fn new(
        config: EvalConfig,
        detector: DetectorHandle,
        classifier: ClassifierHandle,
        ledger: Box<dyn CompletedLedger>,
        archiver: Box<dyn Archiver>,
    ) -> Result<Self> {
        let species = Arc::new(config.species_table()?);

        std::fs::create_dir_all(&config.main.path_eval_out)?;
        std::fs::create_dir_all(&config.main.path_out_analysis)?;

        let software_version = env!("CARGO_PKG_VERSION").to_string();
        tracing::info!(version = %software_version, "Initialize evaluation service");

        Ok(EvalApp {
            config,
            species,
            detector,
            classifier,
            ledger,
            archiver,
            open_samples: Vec::new(),
            software_version,
            waiting_logged: false,
        })
    }

    pub fn open_samples(&self) -> &[Sample] {
        &self.open_samples
    }

    /// Main polling loop. Runs until an unrecoverable error propagates.
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("Starting mainloop");
        loop {
            while self.poll_new_sample().await?.is_some() {}

            let progressed = self.process_pass().await?;

            if self.open_samples.is_empty() {
                if !self.waiting_logged {
                    tracing::info!("Waiting for new sample");
                    self.waiting_logged = true;
                }
                tokio::time::sleep(Duration::from_secs(self.config.main.sleep_seconds)).await;
            } else if !progressed {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }

    /// Check for new sample input.
    ///
    /// Returns at most one new-sample admission per call, or `None`.
    /// Interrupted samples found via an orphaned checkpoint are re-hydrated
    /// directly into `Active` state; re-activations of waiting samples are
    /// handled in place. Neither counts as an admission.
    pub async fn poll_new_sample(&mut self) -> Result<Option<SampleIdentity>> {
        let open_identities: Vec<SampleIdentity> = self
            .open_samples
            .iter()
            .map(|s| s.identity.clone())
            .collect();

        let scanner = SampleScanner::new(
            &self.config.main.path_samples_in,
            &self.config.main.path_eval_out,
            self.archiver.as_ref(),
        );

        match scanner.scan(self.ledger.as_ref(), &open_identities)? {
            None => Ok(None),
            Some(Discovery::Reactivate(identity)) => {
                if let Some(sample) = self
                    .open_samples
                    .iter_mut()
                    .find(|s| s.identity == identity)
                {
                    sample.transition_to(SampleState::Active);
                }
                Ok(None)
            }
            Some(Discovery::Resume { sample_name }) => {
                let sample = checkpoint::reload(
                    &self.config.main.path_eval_out,
                    &sample_name,
                    self.detector.clone(),
                    self.classifier.clone(),
                )?;
                self.open_samples.push(sample);
                self.waiting_logged = false;
                Ok(None)
            }
            Some(Discovery::New { source, entry }) => self.admit(source, entry).await,
        }
    }

    /// Admit one new input unit as a sample.
    ///
    /// A malformed identifier aborts admission of this one unit with a
    /// logged, non-fatal skip.
    async fn admit(
        &mut self,
        source: SampleSource,
        entry: PathBuf,
    ) -> Result<Option<SampleIdentity>> {
        let ledger_key = entry
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let sample = match source {
            SampleSource::LiveStream => self.admit_stream(&entry)?,
            SampleSource::Folder => {
                self.admit_folder(source, entry.clone(), Some(entry), None, ledger_key)
                    .await?
            }
            SampleSource::Archive => {
                let unpacked = self.archiver.unpack(&entry)?;
                self.admit_folder(source, unpacked.clone(), None, Some(unpacked), ledger_key)
                    .await?
            }
        };

        let Some(mut sample) = sample else {
            return Ok(None);
        };

        sample.create_output_dirs()?;

        // Pre-segmented samples carry their status document from the start;
        // copy it next to the results and apply its metadata overrides.
        if let Some(found_status) = sample.status_path.take() {
            let status = StatusDoc::read(&found_status, &self.config.retry).await?;
            status.apply_overrides(&mut sample);

            let file_name = found_status.file_name().unwrap_or_default().to_os_string();
            let dest = sample.analysis_dir().join(&file_name);
            std::fs::copy(&found_status, &dest)?;
            sample.status_path = Some(dest);
        }

        checkpoint::save_sample(&sample)?;

        let identity = sample.identity.clone();
        tracing::info!(sample = %sample.name(), "Starting evaluation of sample");
        self.open_samples.push(sample);
        self.waiting_logged = false;
        Ok(Some(identity))
    }

    /// A streamed region file starts a new live sample. Live streams are
    /// ledgered under the identity name, not the region file that triggered
    /// admission.
    fn admit_stream(&self, entry: &Path) -> Result<Option<Sample>> {
        let tail = entry
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let identity = match identity_from_name(&tail) {
            Some(identity) => identity,
            None => {
                tracing::info!(artifact = %tail, "Wrong string format, skipping input unit");
                return Ok(None);
            }
        };

        Ok(Some(self.build_sample(
            identity.clone(),
            SampleSource::LiveStream,
            self.config.main.path_samples_in.clone(),
            identity.name(),
        )))
    }

    /// A pre-segmented sample folder (or unpacked archive).
    async fn admit_folder(
        &self,
        source: SampleSource,
        folder: PathBuf,
        consumed_input: Option<PathBuf>,
        unpacked_dir: Option<PathBuf>,
        ledger_key: String,
    ) -> Result<Option<Sample>> {
        let images_dir = folder.join("images");

        let mut region_names: Vec<String> = std::fs::read_dir(&images_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with("SYN.png") || name.ends_with("SYN._FP.png"))
            .collect();
        region_names.sort();

        let Some(first) = region_names.first() else {
            return Err(Error::Integrity(format!(
                "sample folder {} has no region images",
                folder.display()
            )));
        };

        let identity = match identity_from_name(first) {
            Some(identity) => identity,
            None => {
                tracing::info!(artifact = %first, "Wrong string format, skipping input unit");
                return Ok(None);
            }
        };

        let status_path = std::fs::read_dir(folder.join("analysis"))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .find(|p| p.to_string_lossy().ends_with("asc.txt"));

        let mut sample = self.build_sample(identity, source, images_dir, ledger_key);
        sample.expected_regions = region_names.len();
        sample.queued_regions = Some(region_names);
        sample.status_path = status_path;
        sample.consumed_input = consumed_input;
        sample.unpacked_dir = unpacked_dir;
        Ok(Some(sample))
    }

    fn build_sample(
        &self,
        identity: SampleIdentity,
        source: SampleSource,
        region_dir: PathBuf,
        ledger_key: String,
    ) -> Sample {
        let output_root = self.config.main.path_eval_out.join(identity.name());
        SampleBuilder {
            identity,
            source,
            detector: self.detector.clone(),
            classifier: self.classifier.clone(),
            software_version: self.software_version.clone(),
            flow_rate: self.config.main.flow_rate,
            carrier_type: self.config.main.carrier_type().to_string(),
            device_type: self.config.main.device_type.clone(),
            device_name: self.config.main.device_name.clone(),
            serial_number: self.config.main.serial_number.clone(),
            region_dir,
            output_root,
            ledger_key,
            save_little_stacks: self.config.main.save_little_stacks,
            eval_synth_only: self.config.main.eval_synth_only,
            save_stacks: self.config.main.save_stacks,
        }
        .build()
    }

    /// One pass over the in-flight samples: each active sample gets exactly
    /// one region turn. Returns whether any region was processed or any
    /// sample finalized.
    pub async fn process_pass(&mut self) -> Result<bool> {
        let mut progressed = false;
        let mut index = 0;

        while index < self.open_samples.len() {
            if !self.open_samples[index].is_active() {
                index += 1;
                continue;
            }

            let retry = self.config.retry.clone();
            match Self::next_region(&retry, &mut self.open_samples[index]).await? {
                NextRegion::Ready(path) => {
                    self.process_one_region(index, &path).await?;
                    progressed = true;
                    index += 1;
                }
                NextRegion::EndOfSample => {
                    self.finalize(index).await?;
                    progressed = true;
                    // the sample was removed; do not advance the index
                }
                NextRegion::Waiting => {
                    let sample = &mut self.open_samples[index];
                    tracing::info!(sample = %sample.name(), "Sample set to inactive");
                    tracing::info!("Waiting for new sample or new img region");
                    sample.transition_to(SampleState::Waiting);
                    index += 1;
                }
            }
        }

        Ok(progressed)
    }

    /// Process a single region and checkpoint the result, so a crash loses
    /// at most this one region's worth of work.
    async fn process_one_region(&mut self, index: usize, source: &Path) -> Result<()> {
        let sample = &mut self.open_samples[index];

        let processor = RegionProcessor::new(&self.species, &self.config.retry);
        let region = processor.process(sample, source).await?;

        checkpoint::save_region(sample, &region)?;
        sample.regions.push(region);
        checkpoint::save_sample(sample)?;

        // Streamed input is consumed: the region file is deleted once its
        // results are durable.
        if sample.source == SampleSource::LiveStream {
            tracing::info!("Remove img region from sample input folder");
            std::fs::remove_file(source)?;
        }
        Ok(())
    }

    /// Pull the next region for a sample, or detect its end.
    async fn next_region(retry: &RetryConfig, sample: &mut Sample) -> Result<NextRegion> {
        if sample.queued_regions.is_none() {
            return Self::next_stream_region(retry, sample).await;
        }

        let next = sample.queued_regions.as_mut().and_then(|queue| {
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        });
        let Some(name) = next else {
            sample.end_of_sample = true;
            return Ok(NextRegion::EndOfSample);
        };

        // Prefer the raw stack over the synthesized image unless configured
        // otherwise.
        let mut chosen = name.clone();
        if !sample.eval_synth_only {
            match modify(&name, PathField::ElemType, ElemKind::Stack.suffix()) {
                Ok(stack_name) => {
                    if sample.region_dir.join(&stack_name).is_file() {
                        chosen = stack_name;
                    } else {
                        tracing::debug!(
                            region = %name,
                            "Could not find stack of region. Using synth img instead"
                        );
                    }
                }
                Err(_) => {
                    tracing::error!(region = %name, "Wrong string format");
                }
            }
        }
        Ok(NextRegion::Ready(sample.region_dir.join(chosen)))
    }

    /// Live streams discover their next region by scanning the input
    /// directory; the status document doubles as the end marker.
    async fn next_stream_region(retry: &RetryConfig, sample: &mut Sample) -> Result<NextRegion> {
        let mut names: Vec<String> = std::fs::read_dir(&sample.region_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tif") || name.ends_with("asc.txt"))
            .collect();
        names.sort();

        let identity = sample.identity.clone();
        let belongs_to_sample = move |name: &str| -> Option<ArtifactName> {
            let decoded = ArtifactName::decode(name).ok()?;
            (decoded.barcode() == identity.barcode && decoded.date_time() == identity.date_time)
                .then_some(decoded)
        };

        for name in &names {
            let Some(_decoded) = belongs_to_sample(name) else {
                if ArtifactName::decode(name).is_err() {
                    tracing::info!(artifact = %name, "Wrong string format");
                }
                continue;
            };

            if name.ends_with("asc.txt") {
                // The end marker is consumed only after every region of this
                // sample has been processed.
                let regions_left = names
                    .iter()
                    .filter(|other| other.ends_with(".tif"))
                    .any(|other| belongs_to_sample(other).is_some());
                if regions_left {
                    continue;
                }

                let source = sample.region_dir.join(name);
                let dest = sample.analysis_dir().join(name);
                let source_for_move = source.clone();
                let dest_for_move = dest.clone();
                with_retry(&source.to_string_lossy(), retry, move || {
                    std::fs::copy(&source_for_move, &dest_for_move)?;
                    std::fs::remove_file(&source_for_move)
                })
                .await?;

                sample.status_path = Some(dest);
                sample.end_of_sample = true;
                return Ok(NextRegion::EndOfSample);
            }

            return Ok(NextRegion::Ready(sample.region_dir.join(name)));
        }

        Ok(NextRegion::Waiting)
    }

    /// Finalize a completed sample: dynamic threshold pass, reports, input
    /// cleanup, checkpoint removal, archiving, ledger entry.
    async fn finalize(&mut self, index: usize) -> Result<()> {
        let mut sample = self.open_samples.remove(index);
        tracing::info!(sample = %sample.name(), "End of sample reached");

        dynamic_threshold::apply(&mut sample)?;

        let status_path = sample.status_path.clone().ok_or_else(|| {
            Error::Integrity(format!("sample {} has no status document", sample.name()))
        })?;
        let status = StatusDoc::read(&status_path, &self.config.retry).await?;
        status.apply_overrides(&mut sample);

        report::write_reports(&sample, &status)?;

        // Consumed input folder is deleted once results exist.
        if let Some(input) = &sample.consumed_input {
            if input.is_dir() {
                std::fs::remove_dir_all(input)?;
            }
        }

        // Checkpoint removal is the last state-bearing step: a crash beyond
        // this point at worst re-archives.
        checkpoint::clear(&sample)?;

        // Archive the evaluation output into the analysis drop location.
        let zip_name = format!("{}.zip", sample.name());
        let zip_path = self.config.main.path_eval_out.join(&zip_name);
        self.archiver.pack(&sample.output_root, &zip_path)?;

        let dest = self.config.main.path_out_analysis.join(&zip_name);
        move_file(&zip_path, &dest)?;
        std::fs::remove_dir_all(&sample.output_root)?;

        if let Some(unpacked) = &sample.unpacked_dir {
            if let Err(e) = std::fs::remove_dir_all(unpacked) {
                tracing::debug!(dir = %unpacked.display(), error = %e, "Could not remove unpack dir");
            }
        }

        sample.transition_to(SampleState::Ended);
        self.ledger.add(&sample.ledger_key)?;

        tracing::info!(
            sample = %sample.name(),
            archive = %dest.display(),
            "Sample archived and moved to analysis output"
        );
        Ok(())
    }
}

/// Resolve a sample identity from an artifact name; `None` for names outside
/// the grammar.
fn identity_from_name(name: &str) -> Option<SampleIdentity> {
    let decoded = ArtifactName::decode(name).ok()?;
    Some(SampleIdentity {
        device: decoded.device().to_string(),
        barcode: decoded.barcode().to_string(),
        date_time: decoded.date_time().to_string(),
    })
}

/// Rename, falling back to copy+remove across filesystems.
fn move_file(source: &Path, dest: &Path) -> Result<()> {
    if std::fs::rename(source, dest).is_ok() {
        return Ok(());
    }
    std::fs::copy(source, dest)?;
    std::fs::remove_file(source)?;
    Ok(())
}
