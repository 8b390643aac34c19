//! Report generation
//!
//! Aggregates a finalized sample into concentration figures and two
//! artifacts: the semicolon-separated tabular file (one row per non-exempt
//! object, fixed column set consumed downstream) and the structured JSON
//! analysis document. Generation is side-effect-free on the in-memory model;
//! it only writes into the sample's output locations.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use serde::Serialize;

use pmon_common::{Error, Result};

use crate::imaging::offset_value;
use crate::models::region::{is_exempt_bucket, BUCKET_NO_POLLEN};
use crate::models::sample::{DytRecord, Sample};
use crate::services::status_doc::StatusDoc;

/// Software name stamped into both artifacts.
pub const SOFTWARE_NAME: &str = "pmon-eval";

/// Border used for the viewer cut-out references in the tabular artifact.
const VIEW_BORDER: u32 = 10;

/// Scanned carrier area is divided into 490 nominal regions; together with
/// the 0.6 * 0.8 counting-frame factor this fixes the concentration
/// denominators.
const TOTAL_REGIONS: f64 = 490.0;
const FRAME_FACTOR: f64 = 0.6 * 0.8;

/// Analysed sample volume in litres.
pub fn analysed_volume(duration_secs: u64, flow_rate: u32, region_count: usize) -> f64 {
    (duration_secs as f64 * flow_rate as f64 * region_count as f64) / (60.0 * TOTAL_REGIONS)
}

/// Total intake volume in litres.
pub fn intake_volume(duration_secs: u64, flow_rate: u32) -> f64 {
    (duration_secs as f64 / 60.0) * flow_rate as f64
}

/// Particles per cubic metre; the caller handles the zero-volume case.
pub fn concentration(count: u32, analysed_volume: f64) -> f64 {
    (count as f64 * 1000.0) / (FRAME_FACTOR * analysed_volume)
}

/// Round to 4 decimals, the artifact contract's precision.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[derive(Debug, Clone, Serialize)]
pub struct ConcentrationInfo {
    pub species: String,
    pub species_latin: String,
    pub count: u32,
    pub concentration: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectEntry {
    /// Stack image reference of the region the object was found in.
    pub image: String,
    pub score: f64,
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeciesObjects {
    pub species_latin: String,
    pub objects: Vec<ObjectEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SoftwareInfo {
    pub name: String,
    pub version: String,
    pub detector_version: String,
    pub classifier_version: String,
}

/// The structured hierarchical analysis document.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub sample: String,
    pub concentrations: Vec<ConcentrationInfo>,
    pub species: Vec<SpeciesObjects>,
    pub dynamic_threshold: Vec<DytRecord>,
    pub status: Vec<StatusEntry>,
    pub flow_rate: u32,
    pub intake_volume: f64,
    pub analysed_volume: f64,
    pub particle_count: u32,
    pub device: String,
    pub serial_number: String,
    pub device_type: String,
    pub carrier_type: String,
    pub station_number: Option<String>,
    pub sampling_start: Option<String>,
    pub sampling_end: Option<String>,
    pub software: SoftwareInfo,
}

/// Per-species tally of non-exempt buckets, in name order.
fn species_counts(sample: &Sample) -> BTreeMap<String, u32> {
    let mut counts = BTreeMap::new();
    for obj in sample.objects() {
        if !is_exempt_bucket(&obj.bucket) {
            *counts.entry(obj.bucket.clone()).or_insert(0) += 1;
        }
    }
    counts
}

/// Build the structured report for a finalized sample.
pub fn build_report(sample: &Sample, status: &StatusDoc) -> Result<AnalysisReport> {
    let duration = status.sampling_duration_secs().ok_or_else(|| {
        Error::Integrity("status document is missing the sampling duration".to_string())
    })?;

    if let Some(scanned) = status.scanned_images() {
        if scanned != sample.regions.len() {
            tracing::info!(
                scanned,
                evaluated = sample.regions.len(),
                "Differences in number of evaluated images and number in status file"
            );
        }
    }

    let volume = analysed_volume(duration, sample.flow_rate, sample.regions.len());
    let intake = intake_volume(duration, sample.flow_rate);

    let mut concentrations = Vec::new();
    let mut species_lists = Vec::new();

    for (species, &count) in &species_counts(sample) {
        let objects: Vec<_> = sample
            .objects()
            .filter(|o| &o.bucket == species)
            .collect();
        let latin = objects
            .first()
            .map(|o| o.species.name_lat.clone())
            .unwrap_or_default();

        let conc = if volume > 0.0 {
            round4(concentration(count, volume))
        } else {
            tracing::error!(species = %species, "Could not determine concentration");
            0.0
        };

        concentrations.push(ConcentrationInfo {
            species: species.clone(),
            species_latin: latin.clone(),
            count,
            concentration: conc,
        });

        let entries = objects
            .iter()
            .map(|obj| {
                let image = sample
                    .region_of(obj.id)
                    .and_then(|r| r.stack_image.clone())
                    .unwrap_or_default();
                ObjectEntry {
                    image,
                    score: round4(obj.classification_score),
                    x: obj.bbox.x,
                    y: obj.bbox.y,
                    z: obj.bbox.z,
                }
            })
            .collect();

        species_lists.push(SpeciesObjects {
            species_latin: latin,
            objects: entries,
        });
    }

    Ok(AnalysisReport {
        sample: sample.name(),
        concentrations,
        species: species_lists,
        dynamic_threshold: sample.dyt_records.clone(),
        status: status
            .iter()
            .map(|(k, v)| StatusEntry {
                key: k.to_string(),
                value: v.to_string(),
            })
            .collect(),
        flow_rate: sample.flow_rate,
        intake_volume: round4(intake),
        analysed_volume: round4(volume),
        particle_count: sample.dust_total,
        device: sample.device_name.clone(),
        serial_number: sample.serial_number.clone(),
        device_type: sample.device_type.clone(),
        carrier_type: sample.carrier_type.clone(),
        station_number: sample.station_number.clone(),
        sampling_start: sample.sampling_start.clone(),
        sampling_end: sample.sampling_end.clone(),
        software: SoftwareInfo {
            name: SOFTWARE_NAME.to_string(),
            version: sample.software_version.clone(),
            detector_version: sample.detector_version.clone(),
            classifier_version: sample.classifier_version.clone(),
        },
    })
}

/// Render the tabular artifact, one row per non-exempt object.
pub fn render_csv(sample: &Sample) -> String {
    let mut out = String::new();
    out.push_str(
        "x;y;z;Width;Height;YearRecorded;MonthRecorded;DayRecorded;\
         HourRecorded;MinuteRecorded;ProbeDirName;ImageName;\
         Synthetic_Image;GraphCut_Image;ImageStackProgrammCall;\
         SegMask;SegPrediction;SegScore;SegManuel;\
         PredictedPollenSpecies;PredictedPollenSpeciesLatin;SortedOut;\
         PredictionReliability;PollenSpecies;SubClass;PredictedSubClass;\
         NameSW;PollenMonitorVersion;SegVersion;ClassifVersion;\
         Device;SerialNumber;DeviceType;CarrierType;Comment\n",
    );

    for region in &sample.regions {
        for obj in &region.objects {
            if obj.bucket == BUCKET_NO_POLLEN {
                continue;
            }

            let x_off = offset_value(obj.bbox.x, -(VIEW_BORDER as i64), 0);
            let y_off = offset_value(obj.bbox.y, -(VIEW_BORDER as i64), 0);
            let w_off = offset_value(obj.bbox.width, 2 * VIEW_BORDER as i64, region.width);
            let h_off = offset_value(obj.bbox.height, 2 * VIEW_BORDER as i64, region.height);

            let synth = region.synth_image.as_deref().unwrap_or("");
            let seg = region.seg_image.as_deref().unwrap_or("");
            let stack = region.stack_image.as_deref().unwrap_or("");

            let synth_ref = format!("%..\\images\\{synth}?{x_off},{y_off},{w_off},{h_off}");
            let seg_ref = format!("%..\\images\\{seg}?{x_off},{y_off},{w_off},{h_off}");
            let viewer_call = format!(
                "~|Bildstapel|D:\\Pollenmonitor\\VisualisationProgramm\\PollenVisualisation.exe\
                 |..\\images\\{synth} {x_off} {y_off} {w_off} {h_off}|"
            );

            let sorted_out = obj.sorted_out.map(|s| s.as_str()).unwrap_or("--");
            let sub_class = if obj.species.sub_class.is_empty() {
                "--"
            } else {
                obj.species.sub_class.as_str()
            };

            let _ = writeln!(
                out,
                "{};{};{};{};{};{};{};{};{};{};{};{};{};{};{};{};{};{:.4};--;{};{};{};{:.4};--;{};--;{};{};{};{};{};{};{};{};--",
                obj.bbox.x,
                obj.bbox.y,
                obj.bbox.z,
                obj.bbox.width,
                obj.bbox.height,
                sample.date_year(),
                sample.date_month(),
                sample.date_day(),
                sample.date_hour(),
                sample.date_minute(),
                sample.name(),
                stack,
                synth_ref,
                seg_ref,
                viewer_call,
                obj.mask,
                obj.detection_class,
                obj.detection_score,
                obj.species.name_de,
                obj.species.name_lat,
                sorted_out,
                obj.classification_score,
                sub_class,
                SOFTWARE_NAME,
                sample.software_version,
                sample.detector_version,
                sample.classifier_version,
                sample.device_name,
                sample.serial_number,
                sample.device_type,
                sample.carrier_type,
            );
        }
    }
    out
}

/// Write both artifacts into the sample's output locations.
pub fn write_reports(sample: &Sample, status: &StatusDoc) -> Result<(PathBuf, PathBuf)> {
    tracing::info!(sample = %sample.name(), "Create analysis files");

    let csv_path = sample.csv_dir().join(format!(
        "{}_{}_01.csv",
        sample.identity.date_time, sample.identity.barcode
    ));
    std::fs::write(&csv_path, render_csv(sample))?;

    let report = build_report(sample, status)?;
    let json_path = sample.analysis_dir().join(format!(
        "polle-ad_01-{}-pmon-{}-{}-json.json",
        sample.identity.date_time, sample.identity.device, sample.identity.barcode
    ));
    let json = serde_json::to_vec_pretty(&report)
        .map_err(|e| Error::Integrity(format!("cannot serialize analysis report: {e}")))?;
    std::fs::write(&json_path, json)?;

    Ok((csv_path, json_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysed_volume_reference_case() {
        // 600 s at 5 l/min over 49 regions → exactly 5 litres
        assert_eq!(analysed_volume(600, 5, 49), 5.0);
    }

    #[test]
    fn intake_volume_reference_case() {
        assert_eq!(intake_volume(600, 5), 50.0);
    }

    #[test]
    fn concentration_reference_case() {
        // 10 objects in 5 l → 4166.6667 per m³ at 4-decimal rounding
        assert_eq!(round4(concentration(10, 5.0)), 4166.6667);
    }
}
