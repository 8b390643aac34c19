//! Dynamic threshold engine
//!
//! Post-processing pass, run once per completed sample before report
//! generation. Species observed in small numbers get a population-dependent
//! minimum score from a four-parameter logistic curve; when the population
//! fails it, every object of that species is reassigned to the `Undefined`
//! bucket. One insufficiently confident member drags the whole observed
//! group along: too few observations to trust the classifier at face value
//! is a population-level decision, not an individual cutoff.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use pmon_common::Result;

use crate::models::region::{is_exempt_bucket, SortedOut, BUCKET_UNDEFINED};
use crate::models::sample::{DytRecord, Sample};

/// Fixed slope of the logistic curve.
pub const SLOPE: f64 = -6.0;

/// Four-parameter logistic minimum score for a species population.
///
/// `min = ceiling + (base - ceiling) / (1 + (count / (cap/2))^slope)`
pub fn compute_min_score(base: f64, ceiling: f64, count: u32, population_cap: u32) -> f64 {
    let mid = population_cap as f64 / 2.0;
    ceiling + (base - ceiling) / (1.0 + (count as f64 / mid).powf(SLOPE))
}

/// Apply the dynamic threshold pass to a completed sample.
///
/// Species are visited in name order; the outcome is order-independent since
/// only that species' counts and scores are read.
pub fn apply(sample: &mut Sample) -> Result<()> {
    tracing::debug!(sample = %sample.name(), "Compute dynamic threshold");

    let mut counts: BTreeMap<String, u32> = BTreeMap::new();
    for obj in sample.objects() {
        *counts.entry(obj.bucket.clone()).or_insert(0) += 1;
    }

    let classif_dir = sample.classif_dir();
    let little_dir = sample.little_stacks_dir();

    for (species, &count) in &counts {
        if is_exempt_bucket(species) {
            continue;
        }

        let scores: Vec<f64> = sample
            .objects()
            .filter(|o| &o.bucket == species)
            .map(|o| o.classification_score)
            .collect();

        let threshold = match sample
            .objects()
            .find(|o| &o.bucket == species)
            .map(|o| o.species.threshold)
        {
            Some(threshold) => threshold,
            None => continue,
        };

        // Above the population cap the species is exempt.
        if count > threshold.population_cap {
            continue;
        }

        // Every member at or above the ceiling: already maximally confident.
        if scores.iter().all(|&s| s >= threshold.ceiling_score) {
            continue;
        }

        let min_score = compute_min_score(
            threshold.base_score,
            threshold.ceiling_score,
            count,
            threshold.population_cap,
        );
        tracing::debug!(species = %species, min_score, "Minimal score for species");

        // Threshold non-binding: every member passes it.
        if scores.iter().all(|&s| s >= min_score) {
            continue;
        }

        ensure_undefined_buckets(sample)?;

        sample.dyt_records.push(DytRecord {
            species: species.clone(),
            count,
            min_score,
            base_score: threshold.base_score,
            ceiling_score: threshold.ceiling_score,
            population_cap: threshold.population_cap,
            slope: SLOPE,
            computed_at: Utc::now(),
        });

        // Reassign every object of the species, regardless of its own score.
        let save_little_stacks = sample.save_little_stacks;
        for region in sample.regions.iter_mut() {
            for obj in region.objects.iter_mut() {
                if &obj.bucket != species {
                    continue;
                }

                if let Some(crop) = obj.crop_image.take() {
                    let dest = suffixed_name(&crop, ".png");
                    move_artifact(
                        &classif_dir.join(species).join(&crop),
                        &classif_dir.join(BUCKET_UNDEFINED).join(&dest),
                    );
                    obj.crop_image = Some(dest);
                }

                if save_little_stacks {
                    if let Some(stack) = obj.crop_stack.take() {
                        let dest = suffixed_name(&stack, ".tif");
                        move_artifact(
                            &little_dir.join(species).join(&stack),
                            &little_dir.join(BUCKET_UNDEFINED).join(&dest),
                        );
                        obj.crop_stack = Some(dest);
                    }
                }

                obj.bucket = BUCKET_UNDEFINED.to_string();
                obj.sorted_out = Some(SortedOut::Dyt);
            }
        }

        // The species bucket is empty now; drop its storage.
        remove_bucket_dir(&classif_dir.join(species));
        if save_little_stacks {
            remove_bucket_dir(&little_dir.join(species));
        }
    }

    Ok(())
}

/// Make sure the `Undefined` bucket folders exist before moving artifacts
/// into them.
fn ensure_undefined_buckets(sample: &mut Sample) -> Result<()> {
    if sample.created_buckets.iter().any(|b| b == BUCKET_UNDEFINED) {
        return Ok(());
    }
    tracing::debug!("Create output folder for: Undefined");
    std::fs::create_dir_all(sample.classif_dir().join(BUCKET_UNDEFINED))?;
    if sample.save_little_stacks {
        std::fs::create_dir_all(sample.little_stacks_dir().join(BUCKET_UNDEFINED))?;
    }
    sample.created_buckets.push(BUCKET_UNDEFINED.to_string());
    Ok(())
}

/// `name.png` → `name-DYT.png`
fn suffixed_name(name: &str, extension: &str) -> String {
    match name.strip_suffix(extension) {
        Some(stem) => format!("{stem}-DYT{extension}"),
        None => format!("{name}-DYT"),
    }
}

/// Artifact moves are best-effort: a failure is logged and the pass
/// continues.
fn move_artifact(source: &Path, dest: &Path) {
    if let Err(e) = std::fs::copy(source, dest) {
        tracing::error!(
            source = %source.display(),
            dest = %dest.display(),
            error = %e,
            "Error during copy of sorted-out artifact"
        );
        return;
    }
    if let Err(e) = std::fs::remove_file(source) {
        tracing::debug!(source = %source.display(), error = %e, "Could not remove moved artifact");
    }
}

fn remove_bucket_dir(dir: &Path) {
    if !dir.is_dir() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(dir) {
        tracing::error!(dir = %dir.display(), error = %e, "Could not remove emptied species folder");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_midpoint_is_exact() {
        // count == cap/2 makes the power term 1, so min sits halfway:
        // 98 + (70 - 98) / 2 = 84.0
        let min = compute_min_score(70.0, 98.0, 5, 10);
        assert_eq!(min, 84.0);
    }

    #[test]
    fn sigmoid_approaches_ceiling_for_small_counts() {
        let min = compute_min_score(70.0, 98.0, 1, 10);
        // a single observation demands near-ceiling confidence
        assert!(min > 97.0 && min < 98.0);
    }

    #[test]
    fn sigmoid_approaches_base_for_large_counts() {
        let min = compute_min_score(70.0, 98.0, 10, 10);
        assert!(min < 71.0 && min >= 70.0);
    }

    #[test]
    fn suffix_insertion() {
        assert_eq!(suffixed_name("obj.png", ".png"), "obj-DYT.png");
        assert_eq!(suffixed_name("obj.tif", ".tif"), "obj-DYT.tif");
    }
}
