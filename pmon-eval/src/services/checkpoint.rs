//! Checkpoint manager
//!
//! Sample-level state and every fully processed region are persisted as JSON
//! under the sample's `temp/` directory, so that a crash loses at most one
//! region's worth of work. Checkpoint writes are atomic (write to a temporary
//! name, then rename): a restart sees only committed checkpoints, never
//! partially written ones.
//!
//! Checkpoints exist only between a sample's first region and its
//! finalization; finalization deletes the whole directory as its last
//! state-bearing step.

use std::path::{Path, PathBuf};

use pmon_common::{Error, Result};

use crate::capability::{ClassifierHandle, DetectorHandle};
use crate::models::region::Region;
use crate::models::sample::{Sample, SampleState};

fn sample_file_name(sample_name: &str) -> String {
    format!("{sample_name}_sample.json")
}

/// Checkpoint path for the sample-level state.
pub fn sample_checkpoint_path(sample: &Sample) -> PathBuf {
    sample.temp_dir().join(sample_file_name(&sample.name()))
}

/// Checkpoint path for one region, keyed by its grid position.
pub fn region_checkpoint_path(sample: &Sample, region: &Region) -> PathBuf {
    sample.temp_dir().join(format!(
        "{}_{}_{}_{}.json",
        sample.name(),
        region.pos.z,
        region.pos.x,
        region.pos.y
    ))
}

/// Write `data` to `path` atomically: temp file in the same directory, then
/// rename over the target.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Persist sample-level state. Callable after every region transition.
///
/// Capability handles serialize as their model paths; regions are persisted
/// separately via [`save_region`].
pub fn save_sample(sample: &Sample) -> Result<()> {
    tracing::debug!(sample = %sample.name(), "Save sample checkpoint");
    let json = serde_json::to_vec_pretty(sample)
        .map_err(|e| Error::Integrity(format!("cannot serialize sample checkpoint: {e}")))?;
    write_atomic(&sample_checkpoint_path(sample), &json)
}

/// Persist one fully processed region.
pub fn save_region(sample: &Sample, region: &Region) -> Result<()> {
    let json = serde_json::to_vec_pretty(region)
        .map_err(|e| Error::Integrity(format!("cannot serialize region checkpoint: {e}")))?;
    write_atomic(&region_checkpoint_path(sample, region), &json)
}

/// Whether an orphaned checkpoint directory exists for `sample_name` under
/// the evaluation output root.
pub fn has_checkpoint(eval_out: &Path, sample_name: &str) -> bool {
    eval_out.join(sample_name).join("temp").is_dir()
}

/// Reconstruct a sample plus its processed regions from checkpoints,
/// re-attaching live capability handles.
///
/// A capability version differing from the one that produced the checkpoint
/// is logged but does not block resumption.
pub fn reload(
    eval_out: &Path,
    sample_name: &str,
    detector: DetectorHandle,
    classifier: ClassifierHandle,
) -> Result<Sample> {
    tracing::info!(sample = %sample_name, "Reload sample from checkpoint");
    let temp = eval_out.join(sample_name).join("temp");

    let sample_path = temp.join(sample_file_name(sample_name));
    let data = std::fs::read(&sample_path)?;
    let mut sample: Sample = serde_json::from_slice(&data).map_err(|e| {
        Error::Integrity(format!(
            "corrupt sample checkpoint {}: {e}",
            sample_path.display()
        ))
    })?;

    tracing::debug!(sample = %sample_name, "Load region checkpoints from temp dir");
    let mut region_files: Vec<PathBuf> = std::fs::read_dir(&temp)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension().map(|e| e == "json").unwrap_or(false)
                && !path
                    .file_name()
                    .map(|f| f.to_string_lossy().ends_with("_sample.json"))
                    .unwrap_or(false)
        })
        .collect();
    region_files.sort();

    let mut regions = Vec::with_capacity(region_files.len());
    for path in region_files {
        let data = std::fs::read(&path)?;
        let region: Region = serde_json::from_slice(&data).map_err(|e| {
            Error::Integrity(format!("corrupt region checkpoint {}: {e}", path.display()))
        })?;
        regions.push(region);
    }

    tracing::info!(
        sample = %sample_name,
        regions = regions.len(),
        "Restored processed regions"
    );
    sample.regions = regions;
    sample.attach_capabilities(detector, classifier);
    sample.transition_to(SampleState::Active);
    Ok(sample)
}

/// Delete the sample's entire checkpoint directory (finalization's last
/// state-bearing step).
pub fn clear(sample: &Sample) -> Result<()> {
    tracing::debug!(sample = %sample.name(), "Remove temp folder from sample");
    std::fs::remove_dir_all(sample.temp_dir())?;
    Ok(())
}
