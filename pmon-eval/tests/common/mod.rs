//! Shared fixtures for integration tests: mock capabilities, a fake
//! archiver and sample factories.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use pmon_common::config::{CapabilityConfig, EvalConfig, MainConfig, RetryConfig};
use pmon_common::species::{SpeciesInfo, SpeciesThreshold};
use pmon_common::Result;

use pmon_eval::capability::{
    Classification, Classifier, ClassifierHandle, Detection, Detector, DetectorHandle,
};
use pmon_eval::imaging::{CropImage, RegionImage};
use pmon_eval::models::region::{BoundingBox, DetectedObject};
use pmon_eval::models::sample::{Sample, SampleBuilder, SampleIdentity, SampleSource};
use pmon_eval::services::unpacker::Archiver;

pub const DEVICE: &str = "bar01";
pub const BARCODE: &str = "0012345678";
pub const DATE_TIME: &str = "20230910100003";

/// Detector that answers every call with the same detections.
pub struct StaticDetector {
    pub detections: Vec<Detection>,
    model_path: PathBuf,
}

impl StaticDetector {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self::with_model(detections, "/models/v2.1_seg.onnx")
    }

    pub fn with_model(detections: Vec<Detection>, model_path: &str) -> Self {
        StaticDetector {
            detections,
            model_path: PathBuf::from(model_path),
        }
    }
}

impl Detector for StaticDetector {
    fn detect(&self, _image: &RegionImage) -> Result<Vec<Detection>> {
        Ok(self.detections.clone())
    }
    fn version(&self) -> &str {
        "v2.1"
    }
    fn model_path(&self) -> &Path {
        &self.model_path
    }
}

/// Classifier that pops queued results, one per submitted crop.
pub struct QueueClassifier {
    results: Mutex<VecDeque<Classification>>,
    model_path: PathBuf,
}

impl QueueClassifier {
    pub fn new(results: Vec<Classification>) -> Self {
        QueueClassifier {
            results: Mutex::new(results.into()),
            model_path: PathBuf::from("/models/v1.34_classif.onnx"),
        }
    }
}

impl Classifier for QueueClassifier {
    fn classify(&self, crops: &[CropImage]) -> Result<Vec<Classification>> {
        let mut queue = self.results.lock().unwrap();
        Ok((0..crops.len()).filter_map(|_| queue.pop_front()).collect())
    }
    fn version(&self) -> &str {
        "v1.34"
    }
    fn model_path(&self) -> &Path {
        &self.model_path
    }
}

/// Archiver stand-in: "packing" copies the directory tree to the
/// destination path, so tests can inspect archived outputs.
pub struct FakeArchiver;

impl Archiver for FakeArchiver {
    fn contains_sample(&self, _archive: &Path) -> Result<bool> {
        Ok(false)
    }
    fn unpack(&self, _archive: &Path) -> Result<PathBuf> {
        unreachable!("tests do not unpack archives")
    }
    fn pack(&self, dir: &Path, dest: &Path) -> Result<()> {
        copy_tree(dir, dest)?;
        Ok(())
    }
}

pub fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

pub fn classification(species: &str, score: f64) -> Classification {
    Classification {
        species: species.to_string(),
        score,
        second_species: species.to_string(),
        second_score: 0.0,
    }
}

pub fn pollen_detection(x: u32, score: f64) -> Detection {
    Detection {
        class_label: "pollen".to_string(),
        score,
        x,
        y: 10,
        width: 30,
        height: 30,
        z: 35,
        mask: "0110".to_string(),
    }
}

pub fn species_info(
    name_de: &str,
    name_lat: &str,
    cap: u32,
    base: f64,
    ceiling: f64,
) -> SpeciesInfo {
    SpeciesInfo {
        name_de: name_de.to_string(),
        name_lat: name_lat.to_string(),
        name_en: name_de.to_string(),
        sub_class: String::new(),
        threshold: SpeciesThreshold {
            population_cap: cap,
            base_score: base,
            ceiling_score: ceiling,
        },
    }
}

/// Object already classified into `species` with `score`.
pub fn classified_object(species: &SpeciesInfo, score: f64, x: u32) -> DetectedObject {
    let mut obj = DetectedObject::from_detection(
        BoundingBox {
            x,
            y: 10,
            z: 35,
            width: 30,
            height: 30,
        },
        "pollen".to_string(),
        0.9,
        "0110".to_string(),
    );
    obj.species = species.clone();
    obj.classification_score = score;
    obj.bucket = species.name_de.clone();
    obj
}

pub fn identity() -> SampleIdentity {
    SampleIdentity {
        device: DEVICE.to_string(),
        barcode: BARCODE.to_string(),
        date_time: DATE_TIME.to_string(),
    }
}

pub fn mock_handles() -> (DetectorHandle, ClassifierHandle) {
    (
        std::sync::Arc::new(StaticDetector::new(Vec::new())),
        std::sync::Arc::new(QueueClassifier::new(Vec::new())),
    )
}

/// Bare sample rooted in a temp directory, for engine-level tests.
pub fn bare_sample(output_root: &Path) -> Sample {
    let (detector, classifier) = mock_handles();
    SampleBuilder {
        identity: identity(),
        source: SampleSource::Folder,
        detector,
        classifier,
        software_version: "0.1.0".to_string(),
        flow_rate: 5,
        carrier_type: "Glass".to_string(),
        device_type: "BAA500".to_string(),
        device_name: DEVICE.to_string(),
        serial_number: "SN-1".to_string(),
        region_dir: output_root.join("unused-input"),
        output_root: output_root.to_path_buf(),
        ledger_key: format!("{DATE_TIME}_{BARCODE}"),
        save_little_stacks: false,
        eval_synth_only: true,
        save_stacks: 0,
    }
    .build()
}

/// Service configuration rooted in a temp directory.
pub fn test_config(root: &Path, thresholds: &[(&str, &str)]) -> EvalConfig {
    EvalConfig {
        main: MainConfig {
            path_samples_in: root.join("in"),
            path_eval_out: root.join("out"),
            path_out_analysis: root.join("analysis"),
            sleep_seconds: 1,
            save_little_stacks: false,
            eval_synth_only: true,
            save_stacks: 0,
            flow_rate: 5,
            carrier_type_plastic: false,
            device_type: "BAA500".to_string(),
            device_name: DEVICE.to_string(),
            serial_number: "SN-1".to_string(),
        },
        retry: RetryConfig {
            initial_delay_ms: 1,
            max_backoff_ms: 2,
            max_wait_secs: Some(1),
        },
        detector: CapabilityConfig {
            command: "pmon-detect".to_string(),
            model_path: PathBuf::from("/models/v2.1_seg.onnx"),
            min_confidence: Some(0.7),
        },
        classifier: CapabilityConfig {
            command: "pmon-classify".to_string(),
            model_path: PathBuf::from("/models/v1.34_classif.onnx"),
            min_confidence: None,
        },
        thresholds: thresholds
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

/// Lay out a pre-segmented sample folder with `region_count` synthesized
/// PNG regions and a status document.
pub fn write_folder_sample(input_dir: &Path, region_count: usize, duration_secs: u64) {
    let folder = input_dir.join(format!("{DATE_TIME}_{BARCODE}"));
    let images = folder.join("images");
    let analysis = folder.join("analysis");
    std::fs::create_dir_all(&images).unwrap();
    std::fs::create_dir_all(&analysis).unwrap();

    for i in 1..=region_count {
        let name = format!(
            "polle-ad_35_{i:02}_01-{DATE_TIME}-pmon-{DEVICE}-{BARCODE}-tiffSYN.png"
        );
        image::GrayImage::from_pixel(100, 100, image::Luma([128]))
            .save(images.join(name))
            .unwrap();
    }

    std::fs::write(
        analysis.join(format!("polle-ad_01-{DATE_TIME}-pmon-{DEVICE}-{BARCODE}-asc.txt")),
        format!(
            "Probenahmezeit;{duration_secs}\nAnzahl_gescannte_Bilder;{region_count}\nSeriennummer;SN-override\n"
        ),
    )
    .unwrap();
}
