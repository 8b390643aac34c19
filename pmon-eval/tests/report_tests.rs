//! Report generation against a hand-built sample

mod common;

use common::{bare_sample, classified_object, species_info};
use pmon_common::pathname::RegionPos;
use pmon_eval::models::region::{Region, BUCKET_NO_POLLEN};
use pmon_eval::services::report::{self, round4};
use pmon_eval::services::status_doc::StatusDoc;
use tempfile::TempDir;

fn built_region(objects: Vec<pmon_eval::models::region::DetectedObject>) -> Region {
    let mut region = Region::new(
        "in/polle-ad_35_01_01-20230910100003-pmon-bar01-0012345678-tiffSYN.png".into(),
        RegionPos {
            z: "35".into(),
            x: "01".into(),
            y: "01".into(),
        },
        100,
        100,
    );
    region.synth_image =
        Some("polle-ad_35_01_01-20230910100003-pmon-bar01-0012345678-tiffSYN.png".into());
    region.seg_image =
        Some("polle-ad_35_01_01-20230910100003-pmon-bar01-0012345678-tiffSEG.png".into());
    region.stack_image =
        Some("polle-ad_35_01_01-20230910100003-pmon-bar01-0012345678-tiff.tif".into());
    region.objects = objects;
    region
}

#[test]
fn csv_rows_cover_non_exempt_objects_only() {
    let dir = TempDir::new().unwrap();
    let mut sample = bare_sample(dir.path());

    let hasel = species_info("Hasel", "Corylus", 10, 70.0, 98.0);
    let no_pollen = species_info("NoPollen", "NoPollen", 0, 0.0, 0.0);

    let mut skipped = classified_object(&no_pollen, 50.0, 70);
    skipped.bucket = BUCKET_NO_POLLEN.to_string();

    sample.regions = vec![built_region(vec![
        classified_object(&hasel, 90.0, 10),
        classified_object(&hasel, 95.0, 40),
        skipped,
    ])];

    let csv = report::render_csv(&sample);
    let lines: Vec<&str> = csv.lines().collect();

    // header plus the two Hasel rows; the NoPollen object is dropped
    assert_eq!(lines.len(), 3);

    // fixed column set: every row matches the header's arity
    let header_fields = lines[0].split(';').count();
    assert_eq!(header_fields, 35);
    for row in &lines[1..] {
        assert_eq!(row.split(';').count(), header_fields, "row: {row}");
    }

    // spot-check the fixed columns of the first data row
    let fields: Vec<&str> = lines[1].split(';').collect();
    assert_eq!(fields[0], "10"); // x
    assert_eq!(fields[5], "2023"); // year
    assert_eq!(fields[6], "09"); // month
    assert_eq!(fields[9], "00"); // minute
    assert_eq!(fields[10], "20230910100003_0012345678"); // sample name
    assert!(fields[12].starts_with("%..\\images\\")); // synth reference
    assert_eq!(fields[19], "Hasel");
    assert_eq!(fields[20], "Corylus");
    assert_eq!(fields[21], "--"); // not sorted out
    assert_eq!(fields[22], "90.0000"); // classification score
    assert_eq!(fields[34], "--"); // comment placeholder
}

#[test]
fn structured_report_carries_concentrations_and_metadata() {
    let dir = TempDir::new().unwrap();
    let mut sample = bare_sample(dir.path());

    let hasel = species_info("Hasel", "Corylus", 10, 70.0, 98.0);
    sample.regions = vec![
        built_region(vec![
            classified_object(&hasel, 90.0, 10),
            classified_object(&hasel, 95.0, 40),
        ]),
        built_region(Vec::new()),
    ];
    sample.dust_total = 7;

    let status = StatusDoc::parse("Probenahmezeit;600\nAnzahl_gescannte_Bilder;2\n");
    let report = report::build_report(&sample, &status).unwrap();

    // 600 s at 5 l/min over 2 regions → 600*5*2/(60*490)
    let volume = 600.0 * 5.0 * 2.0 / (60.0 * 490.0);
    assert_eq!(report.analysed_volume, round4(volume));
    assert_eq!(report.intake_volume, 50.0);
    assert_eq!(report.particle_count, 7);

    assert_eq!(report.concentrations.len(), 1);
    let conc = &report.concentrations[0];
    assert_eq!(conc.species, "Hasel");
    assert_eq!(conc.species_latin, "Corylus");
    assert_eq!(conc.count, 2);
    assert_eq!(conc.concentration, round4(2.0 * 1000.0 / (0.6 * 0.8 * volume)));

    // per-species object list references the holding region's stack image
    assert_eq!(report.species.len(), 1);
    assert_eq!(report.species[0].objects.len(), 2);
    assert!(report.species[0].objects[0].image.ends_with("tiff.tif"));

    // echoed status fields
    assert!(report
        .status
        .iter()
        .any(|e| e.key == "Probenahmezeit" && e.value == "600"));

    assert_eq!(report.software.name, "pmon-eval");
    assert_eq!(report.software.detector_version, "v2.1");
}

#[test]
fn zero_volume_concentration_is_reported_as_zero() {
    let dir = TempDir::new().unwrap();
    let mut sample = bare_sample(dir.path());

    let hasel = species_info("Hasel", "Corylus", 10, 70.0, 98.0);
    sample.regions = vec![built_region(vec![classified_object(&hasel, 90.0, 10)])];

    // zero duration → zero analysed volume
    let status = StatusDoc::parse("Probenahmezeit;0\n");
    let report = report::build_report(&sample, &status).unwrap();

    assert_eq!(report.analysed_volume, 0.0);
    assert_eq!(report.concentrations[0].concentration, 0.0);
}

#[test]
fn missing_sampling_duration_is_an_integrity_error() {
    let dir = TempDir::new().unwrap();
    let sample = bare_sample(dir.path());
    let status = StatusDoc::parse("Device;bar02\n");
    assert!(report::build_report(&sample, &status).is_err());
}
