//! Region processor
//!
//! Drives one image region through detect → classify → persist, producing
//! typed detection records and the region's output artifacts.

use std::collections::BTreeMap;
use std::path::Path;

use pmon_common::config::RetryConfig;
use pmon_common::pathname::{modify, ArtifactName, ElemKind, PathField, RegionPos};
use pmon_common::species::{SpeciesInfo, SpeciesTable};
use pmon_common::{Error, Result};

use crate::capability::Detection;
use crate::imaging;
use crate::models::region::{
    is_exempt_bucket, BoundingBox, DetectedObject, Region, SortedOut, BUCKET_FRAGMENT,
    BUCKET_NO_POLLEN, BUCKET_UNDEFINED,
};
use crate::models::sample::Sample;

/// Detection classes delivered by the capability.
pub const CLASS_POLLEN: &str = "pollen";
pub const CLASS_SPORES: &str = "sporen";
pub const CLASS_FRAGMENT: &str = "pollen_fragment";
pub const CLASS_PARTICLE: &str = "particle";
pub const CLASS_FIBER: &str = "fiber";

/// Border (px) added around an object when cutting its stack crop.
const STACK_CROP_BORDER: u32 = 10;

pub struct RegionProcessor<'a> {
    species: &'a SpeciesTable,
    retry: &'a RetryConfig,
}

impl<'a> RegionProcessor<'a> {
    pub fn new(species: &'a SpeciesTable, retry: &'a RetryConfig) -> Self {
        RegionProcessor { species, retry }
    }

    /// Process one region of `sample` from `source`.
    ///
    /// The returned region is fully processed; the caller checkpoints it and
    /// appends it to the sample.
    pub async fn process(&self, sample: &mut Sample, source: &Path) -> Result<Region> {
        let tail = source
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        if sample.expected_regions != 0 {
            tracing::info!(
                sample = %sample.name(),
                progress = format!("{}/{}", sample.regions.len() + 1, sample.expected_regions),
                region = %tail,
                "Analyse region"
            );
        } else {
            tracing::info!(
                sample = %sample.name(),
                number = sample.regions.len() + 1,
                region = %tail,
                "Analyse region"
            );
        }

        let pos = ArtifactName::decode(&tail)
            .ok()
            .and_then(|name| name.position())
            .unwrap_or_else(RegionPos::unknown);

        let mut img = imaging::load_region_image(source, self.retry).await?;
        img.ensure_synth();
        let (width, height) = img.dimensions()?;

        let mut region = Region::new(source.to_path_buf(), pos, width, height);

        // Detection
        let detector = sample.detector.get()?.clone();
        let detections = detector.detect(&img)?;

        let (mut objects, dust) = collect_objects(&detections);
        dedup_objects(&mut objects);
        region.dust_particles = dust;

        // Classification of pollen/spore instances, one batch per region
        self.classify_objects(sample, &img, &mut objects)?;

        region.objects = objects;
        log_found_species(&region);

        self.persist(sample, &mut region, &img)?;

        Ok(region)
    }

    /// Send every classifiable instance to the classifier and merge the
    /// top-2 results. Fragments get the fixed synthetic record instead.
    fn classify_objects(
        &self,
        sample: &Sample,
        img: &imaging::RegionImage,
        objects: &mut [DetectedObject],
    ) -> Result<()> {
        let synth = img.synth()?;

        let classifiable: Vec<usize> = objects
            .iter()
            .enumerate()
            .filter(|(_, o)| {
                o.detection_class == CLASS_POLLEN || o.detection_class == CLASS_SPORES
            })
            .map(|(i, _)| i)
            .collect();

        // Fragments are never classified; they carry a fixed low-confidence
        // record.
        for obj in objects.iter_mut() {
            if obj.detection_class == CLASS_FRAGMENT {
                obj.species = SpeciesInfo::fragment();
                obj.bucket = BUCKET_FRAGMENT.to_string();
            }
        }

        if classifiable.is_empty() {
            return Ok(());
        }

        let crops: Vec<imaging::CropImage> = classifiable
            .iter()
            .map(|&i| {
                let bbox = objects[i].bbox;
                imaging::crop_object(synth, bbox.x, bbox.y, bbox.width, bbox.height, 0)
            })
            .collect();

        let classifier = sample.classifier.get()?.clone();
        let results = classifier.classify(&crops)?;

        if results.len() != classifiable.len() {
            tracing::error!(
                sample = %sample.name(),
                submitted = classifiable.len(),
                returned = results.len(),
                "Something went wrong during classification"
            );
            return Err(Error::Integrity(format!(
                "classifier returned {} results for {} instances",
                results.len(),
                classifiable.len()
            )));
        }

        for (&index, result) in classifiable.iter().zip(&results) {
            let obj = &mut objects[index];

            let species = self.species.get(&result.species).ok_or_else(|| {
                Error::Integrity(format!(
                    "classifier returned unknown species {}",
                    result.species
                ))
            })?;

            obj.species = species.clone();
            obj.classification_score = result.score;
            obj.second_species = self.species.get(&result.second_species).cloned();
            obj.second_score = result.second_score;
            obj.bucket = species.name_de.clone();

            // Base threshold: an insufficiently confident prediction is
            // sorted out immediately.
            if obj.classification_score < species.threshold.base_score {
                obj.bucket = BUCKET_UNDEFINED.to_string();
                obj.sorted_out = Some(SortedOut::Undefined);
            }
        }

        Ok(())
    }

    /// Write the region's output artifacts and record their names.
    fn persist(
        &self,
        sample: &mut Sample,
        region: &mut Region,
        img: &imaging::RegionImage,
    ) -> Result<()> {
        let synth = img.synth()?.clone();
        let tail = region
            .source_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        // Object crops into per-bucket folders
        for obj in region.objects.iter_mut() {
            ensure_bucket_dirs(sample, &obj.bucket)?;

            let image_name = object_image_name(sample, &region.pos, obj);
            let crop = imaging::crop_object(
                &synth,
                obj.bbox.x,
                obj.bbox.y,
                obj.bbox.width,
                obj.bbox.height,
                0,
            );
            let crop_path = sample.classif_dir().join(&obj.bucket).join(&image_name);
            tracing::debug!(image = %image_name, "Save object image");
            crop.save(&crop_path)
                .map_err(|e| Error::Integrity(format!("cannot save object crop: {e}")))?;
            obj.crop_image = Some(image_name.clone());

            // Cropped stack per object (flag-gated; needs stack input)
            if sample.save_little_stacks
                && obj.bucket != BUCKET_FRAGMENT
                && obj.bucket != BUCKET_NO_POLLEN
            {
                if let Some(stack) = &img.stack {
                    let stack_name = format!(
                        "{}.tif",
                        image_name.strip_suffix(".png").unwrap_or(&image_name)
                    );
                    let frames: Vec<image::GrayImage> = stack
                        .iter()
                        .map(|frame| {
                            imaging::crop_object(
                                &image::DynamicImage::ImageLuma8(frame.clone()),
                                obj.bbox.x,
                                obj.bbox.y,
                                obj.bbox.width,
                                obj.bbox.height,
                                STACK_CROP_BORDER,
                            )
                            .to_luma8()
                        })
                        .collect();
                    let stack_path = sample
                        .little_stacks_dir()
                        .join(&obj.bucket)
                        .join(&stack_name);
                    imaging::write_gray_stack(&stack_path, &frames)?;
                    obj.crop_stack = Some(stack_name);
                }
            }
        }
        if sample.save_little_stacks && !img.is_stack() && !region.objects.is_empty() {
            tracing::debug!("Could not save little stacks. Input file is not a stack");
        }

        // Synthesized region image
        let synth_name = output_image_name(&tail, ElemKind::Synth);
        tracing::debug!(image = %synth_name, "Save synth image");
        synth
            .to_luma8()
            .save(sample.images_dir().join(&synth_name))
            .map_err(|e| Error::Integrity(format!("cannot save synth image: {e}")))?;
        region.synth_image = Some(synth_name);

        // Segmentation overlay
        let seg_name = output_image_name(&tail, ElemKind::Seg);
        let mut seg = synth.to_luma8();
        for obj in &region.objects {
            imaging::draw_box_outline(
                &mut seg,
                obj.bbox.x,
                obj.bbox.y,
                obj.bbox.width,
                obj.bbox.height,
            );
        }
        tracing::debug!(image = %seg_name, "Save segmented image");
        seg.save(sample.images_dir().join(&seg_name))
            .map_err(|e| Error::Integrity(format!("cannot save segmented image: {e}")))?;
        region.seg_image = Some(seg_name);

        // Stack image: the name is always recorded, the data kept only per
        // retention policy.
        let stack_name = output_image_name(&tail, ElemKind::Stack);
        let keep_stack = (sample.save_stacks == 1 && img.is_stack())
            || (sample.save_stacks == 2 && img.is_stack() && !region.objects.is_empty());
        if keep_stack {
            tracing::debug!(image = %stack_name, "Save stack image");
            std::fs::copy(&region.source_path, sample.images_dir().join(&stack_name))?;
        }
        region.stack_image = Some(stack_name);

        sample.dust_total += region.dust_particles;
        Ok(())
    }
}

/// Turn raw detections into objects, counting dust particles separately.
///
/// Particles only feed the dust counter; fibers are neither objects nor
/// dust.
fn collect_objects(detections: &[Detection]) -> (Vec<DetectedObject>, u32) {
    let mut objects = Vec::new();
    let mut dust = 0u32;

    for det in detections {
        match det.class_label.as_str() {
            CLASS_PARTICLE => dust += 1,
            CLASS_FIBER => {}
            CLASS_POLLEN | CLASS_SPORES | CLASS_FRAGMENT => {
                objects.push(DetectedObject::from_detection(
                    BoundingBox {
                        x: det.x,
                        y: det.y,
                        z: det.z,
                        width: det.width,
                        height: det.height,
                    },
                    det.class_label.clone(),
                    det.score,
                    det.mask.clone(),
                ));
            }
            other => {
                tracing::debug!(class = %other, "Ignoring unknown detection class");
            }
        }
    }
    (objects, dust)
}

/// Drop duplicate instances: two objects sharing an identical bounding box
/// (x, y, width, height) keep only the higher detection score. Evaluated
/// pairwise across all instances of the region.
pub fn dedup_objects(objects: &mut Vec<DetectedObject>) {
    let mut keep = vec![true; objects.len()];

    for i in 0..objects.len() {
        if !keep[i] {
            continue;
        }
        for j in (i + 1)..objects.len() {
            if !keep[j] {
                continue;
            }
            let (a, b) = (&objects[i].bbox, &objects[j].bbox);
            if a.x == b.x && a.y == b.y && a.width == b.width && a.height == b.height {
                if objects[j].detection_score > objects[i].detection_score {
                    keep[i] = false;
                } else {
                    keep[j] = false;
                }
            }
        }
    }

    let mut index = 0;
    objects.retain(|_| {
        let kept = keep[index];
        index += 1;
        kept
    });
}

/// Create the output folders for a bucket on first use.
fn ensure_bucket_dirs(sample: &mut Sample, bucket: &str) -> Result<()> {
    if sample.created_buckets.iter().any(|b| b == bucket) {
        return Ok(());
    }
    tracing::debug!(bucket = %bucket, "Create output folder for bucket");
    std::fs::create_dir_all(sample.classif_dir().join(bucket))?;
    if sample.save_little_stacks && bucket != BUCKET_FRAGMENT && bucket != BUCKET_NO_POLLEN {
        std::fs::create_dir_all(sample.little_stacks_dir().join(bucket))?;
    }
    sample.created_buckets.push(bucket.to_string());
    Ok(())
}

/// Object crop image name, in the instrument grammar.
fn object_image_name(sample: &Sample, pos: &RegionPos, obj: &DetectedObject) -> String {
    let mut name = format!(
        "obj_img-{}_{}_{}-{}-pmon-{}-{}-{}-{:.4}-{}_{}_{}_{}",
        pos.z,
        pos.x,
        pos.y,
        sample.identity.date_time,
        sample.identity.device,
        sample.identity.barcode,
        obj.species.name_de,
        obj.classification_score,
        obj.bbox.x,
        obj.bbox.y,
        obj.bbox.width,
        obj.bbox.height,
    );
    if obj.bucket == BUCKET_UNDEFINED {
        name.push_str("-Unf");
    }
    name.push_str(".png");
    name
}

/// Output image name derived from the region's source name; falls back to
/// the bare stem for sources outside the instrument grammar.
fn output_image_name(source_tail: &str, kind: ElemKind) -> String {
    match modify(source_tail, PathField::ElemType, kind.suffix()) {
        Ok(name) => name,
        Err(_) => {
            let stem = source_tail
                .rsplit_once('.')
                .map(|(stem, _)| stem)
                .unwrap_or(source_tail);
            format!("{stem}{}", kind.suffix())
        }
    }
}

/// Log the per-species tally of a processed region.
fn log_found_species(region: &Region) {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for obj in &region.objects {
        if !is_exempt_bucket(&obj.bucket) {
            *counts.entry(obj.bucket.as_str()).or_insert(0) += 1;
        }
    }

    if counts.is_empty() {
        tracing::info!("No objects found");
    } else {
        let found: Vec<String> = counts
            .iter()
            .map(|(species, count)| format!("{count}x{species}"))
            .collect();
        tracing::info!(found = %found.join("; "), "Objects found");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(x: u32, score: f64) -> DetectedObject {
        DetectedObject::from_detection(
            BoundingBox {
                x,
                y: 4,
                z: 35,
                width: 20,
                height: 22,
            },
            CLASS_POLLEN.to_string(),
            score,
            String::new(),
        )
    }

    #[test]
    fn dedup_keeps_higher_score() {
        let mut objects = vec![object(10, 0.80), object(10, 0.92), object(50, 0.70)];
        let survivor = objects[1].id;
        dedup_objects(&mut objects);

        assert_eq!(objects.len(), 2);
        assert!(objects.iter().any(|o| o.id == survivor));
        assert!(objects.iter().all(|o| o.detection_score != 0.80));
    }

    #[test]
    fn dedup_is_pairwise_not_just_consecutive() {
        // the duplicate pair is separated by an unrelated object
        let mut objects = vec![object(10, 0.95), object(50, 0.70), object(10, 0.60)];
        dedup_objects(&mut objects);

        assert_eq!(objects.len(), 2);
        assert!(objects.iter().any(|o| o.detection_score == 0.95));
        assert!(objects.iter().any(|o| o.detection_score == 0.70));
    }

    #[test]
    fn collect_counts_particles_as_dust() {
        let detections = vec![
            Detection {
                class_label: CLASS_PARTICLE.into(),
                score: 0.9,
                x: 0,
                y: 0,
                width: 4,
                height: 4,
                z: 35,
                mask: String::new(),
            },
            Detection {
                class_label: CLASS_POLLEN.into(),
                score: 0.93,
                x: 10,
                y: 10,
                width: 30,
                height: 30,
                z: 35,
                mask: String::new(),
            },
            Detection {
                class_label: CLASS_FIBER.into(),
                score: 0.8,
                x: 50,
                y: 50,
                width: 80,
                height: 6,
                z: 35,
                mask: String::new(),
            },
        ];
        let (objects, dust) = collect_objects(&detections);
        assert_eq!(objects.len(), 1);
        assert_eq!(dust, 1);
    }

    #[test]
    fn output_names_follow_element_table() {
        let source = "polle-ad_35_05_07-20230910100003-pmon-bar01-0012345678-tiff.tif";
        assert_eq!(
            output_image_name(source, ElemKind::Synth),
            "polle-ad_35_05_07-20230910100003-pmon-bar01-0012345678-tiffSYN.png"
        );
        assert_eq!(
            output_image_name(source, ElemKind::Seg),
            "polle-ad_35_05_07-20230910100003-pmon-bar01-0012345678-tiffSEG.png"
        );
    }
}
