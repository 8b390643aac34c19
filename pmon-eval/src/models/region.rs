//! Region and detected-object model

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pmon_common::pathname::RegionPos;
use pmon_common::species::SpeciesInfo;

/// Output bucket for objects sorted out at classification or by the dynamic
/// threshold engine.
pub const BUCKET_UNDEFINED: &str = "Undefined";
/// Bucket for pollen fragments (never classified).
pub const BUCKET_FRAGMENT: &str = "Fragment";
/// Bucket for the classifier's non-target class.
pub const BUCKET_NO_POLLEN: &str = "NoPollen";
/// Bucket for the classifier's degraded-object class.
pub const BUCKET_DEGRADED: &str = "Gammel";

/// Buckets exempt from the dynamic threshold and from concentration figures.
pub fn is_exempt_bucket(bucket: &str) -> bool {
    matches!(
        bucket,
        BUCKET_FRAGMENT | BUCKET_UNDEFINED | BUCKET_NO_POLLEN | BUCKET_DEGRADED
    )
}

/// Object bounding box within a region, plus the focus plane it was sharpest
/// in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub width: u32,
    pub height: u32,
}

/// Reason an object was sorted out of its predicted species bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortedOut {
    /// Classification score below the species' base threshold.
    Undefined,
    /// Reassigned by the dynamic threshold engine.
    Dyt,
}

impl SortedOut {
    pub fn as_str(self) -> &'static str {
        match self {
            SortedOut::Undefined => "Undefined",
            SortedOut::Dyt => "DYT",
        }
    }
}

/// One instance found inside a region.
///
/// Objects carry an explicit handle; duplicate detection and cross-references
/// key on `id`, never on attribute equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedObject {
    pub id: Uuid,
    pub bbox: BoundingBox,

    pub detection_class: String,
    pub detection_score: f64,
    /// Flattened instance mask as the capability delivered it (0/1 digits).
    pub mask: String,

    /// Top-1 classification result; fragments carry the synthetic record.
    pub species: SpeciesInfo,
    pub classification_score: f64,
    /// Top-2 classification result, absent for fragments.
    pub second_species: Option<SpeciesInfo>,
    pub second_score: f64,

    /// Output bucket the object is filed under (species name or a fixed
    /// bucket).
    pub bucket: String,
    pub sorted_out: Option<SortedOut>,

    /// Saved crop image name, set at persistence.
    pub crop_image: Option<String>,
    /// Saved cropped-stack name, set only when stack saving is enabled.
    pub crop_stack: Option<String>,
}

impl DetectedObject {
    /// New object from a detection, before classification.
    pub fn from_detection(
        bbox: BoundingBox,
        detection_class: String,
        detection_score: f64,
        mask: String,
    ) -> Self {
        DetectedObject {
            id: Uuid::new_v4(),
            bbox,
            detection_class,
            detection_score,
            mask,
            species: SpeciesInfo::fragment(),
            classification_score: 0.0,
            second_species: None,
            second_score: 0.0,
            bucket: String::new(),
            sorted_out: None,
            crop_image: None,
            crop_stack: None,
        }
    }
}

/// One image (or depth stack) of a sample's scan grid.
///
/// Immutable once fully processed, except for the output image names
/// rewritten at persistence time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub source_path: PathBuf,
    pub pos: RegionPos,
    pub width: u32,
    pub height: u32,

    pub objects: Vec<DetectedObject>,
    pub dust_particles: u32,

    /// Synthesized image name under the sample's `images/` output.
    pub synth_image: Option<String>,
    /// Segmentation overlay image name under `images/`.
    pub seg_image: Option<String>,
    /// Stack image name (recorded even when the stack itself is not kept).
    pub stack_image: Option<String>,
}

impl Region {
    pub fn new(source_path: PathBuf, pos: RegionPos, width: u32, height: u32) -> Self {
        Region {
            source_path,
            pos,
            width,
            height,
            objects: Vec::new(),
            dust_particles: 0,
            synth_image: None,
            seg_image: None,
            stack_image: None,
        }
    }
}
