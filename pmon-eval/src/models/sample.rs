//! Sample model and lifecycle state
//!
//! A sample is one physical carrier under evaluation, identified by
//! (device, barcode, capture time). At most one live sample exists per
//! identity; the identity never changes after construction.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pmon_common::{Error, Result};

use crate::capability::{CapabilitySlot, ClassifierHandle, DetectorHandle};
use crate::models::region::Region;

/// Sample lifecycle state.
///
/// `Discovering` is instantaneous: identity resolution from the first input
/// unit or from a restored checkpoint. `Active` samples have a region
/// available; `Waiting` samples are skipped until new input arrives; `Ended`
/// is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SampleState {
    Discovering,
    Active,
    Waiting,
    Ended,
}

/// Where a sample's regions come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleSource {
    /// Regions stream into the input directory one file at a time.
    LiveStream,
    /// A pre-segmented sample folder with `images/` and `analysis/`.
    Folder,
    /// A zipped sample folder; unpacked before evaluation.
    Archive,
}

/// Stable sample identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleIdentity {
    pub device: String,
    pub barcode: String,
    /// Capture timestamp as the instrument encodes it (`YYYYMMDDhhmmss`).
    pub date_time: String,
}

impl SampleIdentity {
    /// Canonical sample name used for output directories, checkpoints and
    /// the ledger.
    pub fn name(&self) -> String {
        format!("{}_{}", self.date_time, self.barcode)
    }
}

/// Audit entry for one species adjusted by the dynamic threshold engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DytRecord {
    pub species: String,
    pub count: u32,
    pub min_score: f64,
    pub base_score: f64,
    pub ceiling_score: f64,
    pub population_cap: u32,
    pub slope: f64,
    pub computed_at: DateTime<Utc>,
}

/// One sample under evaluation.
///
/// Serializable as checkpoint state: capability slots serialize as model
/// paths only, and regions are checkpointed separately (one file per region).
#[derive(Clone, Serialize, Deserialize)]
pub struct Sample {
    pub identity: SampleIdentity,
    pub source: SampleSource,
    pub state: SampleState,
    /// The input source delivered its end marker; the sample finalizes once
    /// all pending regions are consumed.
    pub end_of_sample: bool,

    pub detector: CapabilitySlot<DetectorHandle>,
    pub classifier: CapabilitySlot<ClassifierHandle>,
    /// Capability versions recorded at construction; kept as-is across a
    /// reload, since the checkpointed results were produced by them.
    pub detector_version: String,
    pub classifier_version: String,
    pub software_version: String,

    /// Processed regions. Not part of the sample checkpoint; each region is
    /// checkpointed in its own file and re-read on reload.
    #[serde(skip)]
    pub regions: Vec<Region>,

    pub dust_total: u32,
    pub dyt_records: Vec<DytRecord>,

    // Instrument metadata; may be overridden by a status document found
    // during scan.
    pub flow_rate: u32,
    pub carrier_type: String,
    pub device_type: String,
    pub device_name: String,
    pub serial_number: String,
    pub station_number: Option<String>,
    pub sampling_start: Option<String>,
    pub sampling_end: Option<String>,

    /// Directory region images are read from.
    pub region_dir: PathBuf,
    /// Sample output directory (`<eval_out>/<name>`).
    pub output_root: PathBuf,
    /// Copied status document location, once discovered.
    pub status_path: Option<PathBuf>,
    /// Input folder consumed by this sample, deleted at finalization.
    pub consumed_input: Option<PathBuf>,
    /// Unpack directory for archive input, removed at finalization.
    pub unpacked_dir: Option<PathBuf>,

    /// Remaining region names for pre-segmented input; `None` for live
    /// streams, which discover regions by scanning.
    pub queued_regions: Option<Vec<String>>,
    /// Number of regions listed up-front (0 when unknown).
    pub expected_regions: usize,

    /// Species bucket folders already created under the classification
    /// output.
    pub created_buckets: Vec<String>,

    /// Key recorded in the completed-sample ledger: the input folder or
    /// archive stem for pre-segmented samples, the identity name for live
    /// streams.
    pub ledger_key: String,

    // Evaluation flags copied from configuration at admission.
    pub save_little_stacks: bool,
    pub eval_synth_only: bool,
    pub save_stacks: u8,
}

impl Sample {
    /// Transition the lifecycle state.
    pub fn transition_to(&mut self, new_state: SampleState) {
        if self.state != new_state {
            tracing::debug!(
                sample = %self.name(),
                from = ?self.state,
                to = ?new_state,
                "Sample state transition"
            );
            self.state = new_state;
        }
    }

    pub fn name(&self) -> String {
        self.identity.name()
    }

    pub fn is_active(&self) -> bool {
        self.state == SampleState::Active
    }

    // Capture-time components for the tabular report.
    pub fn date_year(&self) -> &str {
        self.date_slice(0, 4)
    }
    pub fn date_month(&self) -> &str {
        self.date_slice(4, 6)
    }
    pub fn date_day(&self) -> &str {
        self.date_slice(6, 8)
    }
    pub fn date_hour(&self) -> &str {
        self.date_slice(8, 10)
    }
    pub fn date_minute(&self) -> &str {
        self.date_slice(10, 12)
    }

    fn date_slice(&self, from: usize, to: usize) -> &str {
        self.identity.date_time.get(from..to).unwrap_or("")
    }

    // Output directory layout.
    pub fn images_dir(&self) -> PathBuf {
        self.output_root.join("images")
    }
    pub fn classif_dir(&self) -> PathBuf {
        self.output_root.join("pollen_DL")
    }
    pub fn analysis_dir(&self) -> PathBuf {
        self.output_root.join("analysis")
    }
    pub fn csv_dir(&self) -> PathBuf {
        self.output_root.join("csv")
    }
    pub fn little_stacks_dir(&self) -> PathBuf {
        self.output_root.join("LittleStacks")
    }
    /// Checkpoint directory; exists only while the sample is incomplete.
    pub fn temp_dir(&self) -> PathBuf {
        self.output_root.join("temp")
    }

    /// Create the sample output directory tree, replacing any leftover tree
    /// from an interrupted earlier run.
    ///
    /// A leftover tree that cannot be removed (open file handle elsewhere)
    /// is fatal and needs operator intervention.
    pub fn create_output_dirs(&self) -> Result<()> {
        if self.output_root.is_dir() {
            tracing::info!(path = %self.output_root.display(), "Deleting existing output dir");
            std::fs::remove_dir_all(&self.output_root).map_err(|e| {
                tracing::error!(
                    path = %self.output_root.display(),
                    error = %e,
                    "Could not delete sample folder. Please close all files!"
                );
                Error::ResourceLocked(format!(
                    "could not delete sample output {}: {e}",
                    self.output_root.display()
                ))
            })?;
        }

        std::fs::create_dir_all(&self.output_root)?;
        std::fs::create_dir(self.images_dir())?;
        std::fs::create_dir(self.classif_dir())?;
        std::fs::create_dir(self.analysis_dir())?;
        std::fs::create_dir(self.csv_dir())?;
        std::fs::create_dir(self.temp_dir())?;
        if self.save_little_stacks {
            std::fs::create_dir(self.little_stacks_dir())?;
        }
        Ok(())
    }

    /// Re-attach live capability handles after a checkpoint reload.
    ///
    /// A model-version difference is logged but does not block resumption;
    /// the checkpointed results are trusted as-is.
    pub fn attach_capabilities(&mut self, detector: DetectorHandle, classifier: ClassifierHandle) {
        if self.detector.model_path() != detector.model_path() {
            tracing::debug!(
                sample = %self.name(),
                checkpointed = %self.detector.model_path().display(),
                loaded = %detector.model_path().display(),
                "Continue with different detection model"
            );
        }
        if self.classifier.model_path() != classifier.model_path() {
            tracing::debug!(
                sample = %self.name(),
                checkpointed = %self.classifier.model_path().display(),
                loaded = %classifier.model_path().display(),
                "Continue with different classification model"
            );
        }
        let detector_path = detector.model_path().to_path_buf();
        let classifier_path = classifier.model_path().to_path_buf();
        self.detector.load(detector, detector_path);
        self.classifier.load(classifier, classifier_path);
    }

    /// All objects across all processed regions.
    pub fn objects(&self) -> impl Iterator<Item = &crate::models::region::DetectedObject> {
        self.regions.iter().flat_map(|r| r.objects.iter())
    }

    /// Find the region holding an object, by object handle.
    pub fn region_of(&self, object_id: uuid::Uuid) -> Option<&Region> {
        self.regions
            .iter()
            .find(|r| r.objects.iter().any(|o| o.id == object_id))
    }
}

impl std::fmt::Debug for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sample")
            .field("identity", &self.identity)
            .field("source", &self.source)
            .field("state", &self.state)
            .field("end_of_sample", &self.end_of_sample)
            .field("regions", &self.regions.len())
            .field("output_root", &self.output_root)
            .finish()
    }
}

/// Build a [`Sample`] in `Active` state with empty accumulators.
///
/// Identity resolution and input layout live in the coordinator; this keeps
/// the field soup in one place.
pub struct SampleBuilder {
    pub identity: SampleIdentity,
    pub source: SampleSource,
    pub detector: DetectorHandle,
    pub classifier: ClassifierHandle,
    pub software_version: String,
    pub flow_rate: u32,
    pub carrier_type: String,
    pub device_type: String,
    pub device_name: String,
    pub serial_number: String,
    pub region_dir: PathBuf,
    pub output_root: PathBuf,
    pub ledger_key: String,
    pub save_little_stacks: bool,
    pub eval_synth_only: bool,
    pub save_stacks: u8,
}

impl SampleBuilder {
    pub fn build(self) -> Sample {
        let detector_version = self.detector.version().to_string();
        let classifier_version = self.classifier.version().to_string();
        let detector_path = self.detector.model_path().to_path_buf();
        let classifier_path = self.classifier.model_path().to_path_buf();

        Sample {
            identity: self.identity,
            source: self.source,
            state: SampleState::Active,
            end_of_sample: false,
            detector: CapabilitySlot::loaded(detector_path, self.detector),
            classifier: CapabilitySlot::loaded(classifier_path, self.classifier),
            detector_version,
            classifier_version,
            software_version: self.software_version,
            regions: Vec::new(),
            dust_total: 0,
            dyt_records: Vec::new(),
            flow_rate: self.flow_rate,
            carrier_type: self.carrier_type,
            device_type: self.device_type,
            device_name: self.device_name,
            serial_number: self.serial_number,
            station_number: None,
            sampling_start: None,
            sampling_end: None,
            region_dir: self.region_dir,
            output_root: self.output_root,
            status_path: None,
            consumed_input: None,
            unpacked_dir: None,
            queued_regions: None,
            expected_regions: 0,
            created_buckets: Vec::new(),
            ledger_key: self.ledger_key,
            save_little_stacks: self.save_little_stacks,
            eval_synth_only: self.eval_synth_only,
            save_stacks: self.save_stacks,
        }
    }
}
