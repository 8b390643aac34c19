//! Dynamic threshold engine properties

mod common;

use common::{bare_sample, classified_object, species_info};
use pmon_common::pathname::RegionPos;
use pmon_eval::models::region::{Region, SortedOut, BUCKET_UNDEFINED};
use pmon_eval::services::dynamic_threshold::{self, compute_min_score, SLOPE};
use tempfile::TempDir;

fn region_with(objects: Vec<pmon_eval::models::region::DetectedObject>) -> Region {
    let mut region = Region::new(
        "in/region.png".into(),
        RegionPos {
            z: "35".into(),
            x: "01".into(),
            y: "01".into(),
        },
        100,
        100,
    );
    region.objects = objects;
    region
}

#[test]
fn sigmoid_reference_case() {
    // count == N/2 makes the power term exactly 1:
    // 98 + (70 - 98) / (1 + (5/5)^-6) = 98 - 28/2 = 84.0
    assert_eq!(compute_min_score(70.0, 98.0, 5, 10), 84.0);
    assert_eq!(SLOPE, -6.0);
}

#[test]
fn under_confident_species_is_fully_reassigned() {
    let dir = TempDir::new().unwrap();
    let mut sample = bare_sample(dir.path());

    let hasel = species_info("Hasel", "Corylus", 10, 70.0, 98.0);
    // count 5 ≤ cap 10; one object scores below the curve at 84.0
    let scores = [97.0, 96.0, 95.0, 90.0, 80.0];
    sample.regions = vec![region_with(
        scores
            .iter()
            .enumerate()
            .map(|(i, &s)| classified_object(&hasel, s, 10 * (i as u32 + 1)))
            .collect(),
    )];

    dynamic_threshold::apply(&mut sample).unwrap();

    // every object reassigned, regardless of its own score
    for obj in sample.objects() {
        assert_eq!(obj.bucket, BUCKET_UNDEFINED);
        assert_eq!(obj.sorted_out, Some(SortedOut::Dyt));
    }

    // exactly one audit record with the exact computed minimum
    assert_eq!(sample.dyt_records.len(), 1);
    let record = &sample.dyt_records[0];
    assert_eq!(record.species, "Hasel");
    assert_eq!(record.count, 5);
    assert_eq!(record.min_score, 84.0);
    assert_eq!(record.base_score, 70.0);
    assert_eq!(record.ceiling_score, 98.0);
    assert_eq!(record.population_cap, 10);
    assert_eq!(record.slope, -6.0);
}

#[test]
fn population_above_cap_is_exempt() {
    let dir = TempDir::new().unwrap();
    let mut sample = bare_sample(dir.path());

    let hasel = species_info("Hasel", "Corylus", 3, 70.0, 98.0);
    // 4 objects > cap 3, all with poor scores
    sample.regions = vec![region_with(
        (0..4).map(|i| classified_object(&hasel, 40.0, i * 10)).collect(),
    )];

    dynamic_threshold::apply(&mut sample).unwrap();

    assert!(sample.dyt_records.is_empty());
    assert!(sample.objects().all(|o| o.bucket == "Hasel" && o.sorted_out.is_none()));
}

#[test]
fn all_scores_at_ceiling_skip_the_pass() {
    let dir = TempDir::new().unwrap();
    let mut sample = bare_sample(dir.path());

    let hasel = species_info("Hasel", "Corylus", 10, 70.0, 98.0);
    sample.regions = vec![region_with(vec![
        classified_object(&hasel, 98.0, 10),
        classified_object(&hasel, 99.0, 20),
    ])];

    dynamic_threshold::apply(&mut sample).unwrap();

    assert!(sample.dyt_records.is_empty());
    assert!(sample.objects().all(|o| o.bucket == "Hasel"));
}

#[test]
fn non_binding_threshold_skips_the_pass() {
    let dir = TempDir::new().unwrap();
    let mut sample = bare_sample(dir.path());

    let hasel = species_info("Hasel", "Corylus", 10, 70.0, 98.0);
    // count 5 → min 84.0; every score passes it, though not the ceiling
    sample.regions = vec![region_with(
        (0..5).map(|i| classified_object(&hasel, 85.0 + i as f64, i * 10)).collect(),
    )];

    dynamic_threshold::apply(&mut sample).unwrap();

    assert!(sample.dyt_records.is_empty());
    assert!(sample.objects().all(|o| o.bucket == "Hasel" && o.sorted_out.is_none()));
}

#[test]
fn fixed_buckets_are_never_adjusted() {
    let dir = TempDir::new().unwrap();
    let mut sample = bare_sample(dir.path());

    let fragment = species_info("Fragment", "Fragment", 0, 0.0, 0.0);
    let mut obj = classified_object(&fragment, 0.0, 10);
    obj.bucket = "Fragment".to_string();
    sample.regions = vec![region_with(vec![obj])];

    dynamic_threshold::apply(&mut sample).unwrap();

    assert!(sample.dyt_records.is_empty());
    assert!(sample.objects().all(|o| o.bucket == "Fragment"));
}

#[test]
fn species_are_adjusted_independently() {
    let dir = TempDir::new().unwrap();
    let mut sample = bare_sample(dir.path());

    let hasel = species_info("Hasel", "Corylus", 10, 70.0, 98.0);
    let birke = species_info("Birke", "Betula", 10, 70.0, 98.0);
    sample.regions = vec![region_with(vec![
        // Hasel fails its curve (count 1 → min just below ceiling)
        classified_object(&hasel, 80.0, 10),
        // Birke passes its curve comfortably at the ceiling
        classified_object(&birke, 98.5, 50),
    ])];

    dynamic_threshold::apply(&mut sample).unwrap();

    assert_eq!(sample.dyt_records.len(), 1);
    assert_eq!(sample.dyt_records[0].species, "Hasel");

    let buckets: Vec<&str> = sample.objects().map(|o| o.bucket.as_str()).collect();
    assert!(buckets.contains(&BUCKET_UNDEFINED));
    assert!(buckets.contains(&"Birke"));
}

#[test]
fn artifact_moves_carry_the_dyt_suffix() {
    let dir = TempDir::new().unwrap();
    let mut sample = bare_sample(dir.path());

    let hasel = species_info("Hasel", "Corylus", 10, 70.0, 98.0);
    let mut obj = classified_object(&hasel, 50.0, 10);

    // stage the crop artifact on disk as the region processor would
    let bucket_dir = sample.classif_dir().join("Hasel");
    std::fs::create_dir_all(&bucket_dir).unwrap();
    std::fs::write(bucket_dir.join("crop.png"), b"png").unwrap();
    obj.crop_image = Some("crop.png".to_string());

    sample.regions = vec![region_with(vec![obj])];
    sample.created_buckets.push("Hasel".to_string());

    dynamic_threshold::apply(&mut sample).unwrap();

    let moved = sample.classif_dir().join("Undefined").join("crop-DYT.png");
    assert!(moved.is_file());
    // the emptied species bucket is removed
    assert!(!bucket_dir.exists());
    let obj = sample.objects().next().unwrap();
    assert_eq!(obj.crop_image.as_deref(), Some("crop-DYT.png"));
}
