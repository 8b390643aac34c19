//! External detection and classification capabilities
//!
//! The neural-network capabilities are consumed as black boxes behind the
//! [`Detector`] and [`Classifier`] traits. Production implementations are
//! subprocess clients around the configured external tools (see
//! [`process`]); tests substitute mocks.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::{Deserializer, Error as _};
use serde::ser::{Error as _, Serializer};
use serde::{Deserialize, Serialize};

use pmon_common::Result;

use crate::imaging::{CropImage, RegionImage};

pub mod process;

pub use process::{ProcessClassifier, ProcessDetector};

/// One detected instance as the detector delivers it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_label: String,
    pub score: f64,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Focus plane the instance was sharpest in (stack inputs only).
    #[serde(default = "default_plane")]
    pub z: u32,
    /// Flattened instance mask (0/1 digits).
    #[serde(default)]
    pub mask: String,
}

fn default_plane() -> u32 {
    35
}

/// Top-2 classification result for one submitted crop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub species: String,
    pub score: f64,
    pub second_species: String,
    pub second_score: f64,
}

/// Detection capability: per-instance classes, scores, boxes and masks.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &RegionImage) -> Result<Vec<Detection>>;
    /// Model version, derived from the loaded model's file name.
    fn version(&self) -> &str;
    fn model_path(&self) -> &Path;
}

/// Classification capability: top-2 species per crop, output order and length
/// exactly matching the input.
pub trait Classifier: Send + Sync {
    fn classify(&self, crops: &[CropImage]) -> Result<Vec<Classification>>;
    fn version(&self) -> &str;
    fn model_path(&self) -> &Path;
}

pub type DetectorHandle = Arc<dyn Detector>;
pub type ClassifierHandle = Arc<dyn Classifier>;

/// A capability attached to a sample: either a live handle or just the model
/// path it was configured from.
///
/// Serialization only ever operates on the unloaded representation, so
/// checkpointed samples stay plain data; a reload re-attaches live handles
/// through [`CapabilitySlot::load`].
#[derive(Debug, Clone)]
pub enum CapabilitySlot<T> {
    Unloaded(PathBuf),
    Loaded { path: PathBuf, handle: T },
}

impl<T> CapabilitySlot<T> {
    pub fn loaded(path: PathBuf, handle: T) -> Self {
        CapabilitySlot::Loaded { path, handle }
    }

    pub fn model_path(&self) -> &Path {
        match self {
            CapabilitySlot::Unloaded(path) => path,
            CapabilitySlot::Loaded { path, .. } => path,
        }
    }

    /// The live handle; an unloaded slot is a programming error surfaced as
    /// an integrity failure rather than a panic.
    pub fn get(&self) -> Result<&T> {
        match self {
            CapabilitySlot::Loaded { handle, .. } => Ok(handle),
            CapabilitySlot::Unloaded(path) => Err(pmon_common::Error::Integrity(format!(
                "capability not loaded: {}",
                path.display()
            ))),
        }
    }

    /// Attach a live handle, keeping the recorded model path.
    pub fn load(&mut self, handle: T, handle_path: PathBuf) {
        *self = CapabilitySlot::Loaded {
            path: handle_path,
            handle,
        };
    }

    /// Drop the live handle, keeping only the model path.
    pub fn unload(&mut self) {
        let path = self.model_path().to_path_buf();
        *self = CapabilitySlot::Unloaded(path);
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, CapabilitySlot::Loaded { .. })
    }
}

impl<T> Serialize for CapabilitySlot<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        // Only the model path is durable.
        match self.model_path().to_str() {
            Some(path) => path.serialize(serializer),
            None => Err(S::Error::custom("non-UTF-8 model path")),
        }
    }
}

impl<'de, T> Deserialize<'de> for CapabilitySlot<T> {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let path = String::deserialize(deserializer)?;
        if path.is_empty() {
            return Err(D::Error::custom("empty model path"));
        }
        Ok(CapabilitySlot::Unloaded(PathBuf::from(path)))
    }
}

impl<T> fmt::Display for CapabilitySlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilitySlot::Unloaded(path) => write!(f, "unloaded({})", path.display()),
            CapabilitySlot::Loaded { path, .. } => write!(f, "loaded({})", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_serializes_as_model_path() {
        let slot: CapabilitySlot<()> =
            CapabilitySlot::loaded(PathBuf::from("/models/v2.1_seg.onnx"), ());
        let json = serde_json::to_string(&slot).unwrap();
        assert_eq!(json, "\"/models/v2.1_seg.onnx\"");

        let restored: CapabilitySlot<()> = serde_json::from_str(&json).unwrap();
        assert!(!restored.is_loaded());
        assert_eq!(restored.model_path(), Path::new("/models/v2.1_seg.onnx"));
    }

    #[test]
    fn load_and_unload_transitions() {
        let mut slot: CapabilitySlot<u8> = CapabilitySlot::Unloaded("/m/v1_a.onnx".into());
        assert!(slot.get().is_err());

        slot.load(7, PathBuf::from("/m/v2_a.onnx"));
        assert!(slot.is_loaded());
        assert_eq!(*slot.get().unwrap(), 7);
        assert_eq!(slot.model_path(), Path::new("/m/v2_a.onnx"));

        slot.unload();
        assert!(!slot.is_loaded());
        assert_eq!(slot.model_path(), Path::new("/m/v2_a.onnx"));
    }
}
