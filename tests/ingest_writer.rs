// tests/ingest_writer.rs
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use dataset_ingest::catalog::{parse_catalog, DatasetDescriptor};
use dataset_ingest::ingest::validate::{validate_text, ValidatedRecord};
use dataset_ingest::ingest::writer::{
    atomic_write_with, content_hash, lock_path_for, merge_and_write, write_merged, FileLocks, MergePolicy,
    WriteStatus,
};

fn descriptor(dir: &Path) -> DatasetDescriptor {
    let yaml = r#"
- id: co2
  name: CO2 intensity
  source: https://example.test/co2.csv
  cadence: daily
  target: out/co2.csv
  schema:
    - { name: day, type: date }
    - { name: g_per_kwh, type: integer, unit: g/kWh }
"#;
    parse_catalog(yaml, "yaml", dir, "test").unwrap().remove(0)
}

fn record(d: &DatasetDescriptor, body: &str) -> ValidatedRecord {
    ValidatedRecord {
        dataset_id: d.id.clone(),
        rows: validate_text(body, d).unwrap(),
    }
}

fn temp_leftovers(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(".ingest-"))
        .collect()
}

#[test]
fn failed_write_keeps_prior_file() {
    let tmp = tempfile::tempdir().unwrap();
    let target = tmp.path().join("co2.csv");
    fs::write(&target, "day,g_per_kwh\n2026-01-01,380\n").unwrap();

    let res = atomic_write_with(&target, |f| {
        f.write_all(b"day,g_per_kwh\n2026-01-0")?;
        Err(io::Error::other("disk full"))
    });

    assert!(res.is_err());
    assert_eq!(
        fs::read_to_string(&target).unwrap(),
        "day,g_per_kwh\n2026-01-01,380\n"
    );
    assert!(temp_leftovers(tmp.path()).is_empty());
}

#[test]
fn lock_file_is_released_after_merge() {
    let tmp = tempfile::tempdir().unwrap();
    let d = descriptor(tmp.path());

    let rec = record(&d, "day,g_per_kwh\n2026-01-02,350\n2026-01-01,380\n");
    let out = merge_and_write(&d, rec, MergePolicy::FirstWriteWins).unwrap();
    assert_eq!(out.status, WriteStatus::Written);
    assert!(!lock_path_for(&d.target).exists());
    assert!(temp_leftovers(&tmp.path().join("out")).is_empty());

    // Same rows again: nothing to write, lock released again.
    let rec = record(&d, "day,g_per_kwh\n2026-01-01,380\n");
    let out = merge_and_write(&d, rec, MergePolicy::FirstWriteWins).unwrap();
    assert_eq!(out.status, WriteStatus::Unchanged);
    assert_eq!(out.rows_total, 2);
    assert!(!lock_path_for(&d.target).exists());
}

#[test]
fn sidecar_describes_the_data_file() {
    let tmp = tempfile::tempdir().unwrap();
    let d = descriptor(tmp.path());
    let rec = record(&d, "day,g_per_kwh\n2026-01-01,380\n2026-01-02,350\n");
    merge_and_write(&d, rec, MergePolicy::FirstWriteWins).unwrap();

    let meta: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(tmp.path().join("out/co2.meta.json")).unwrap())
            .unwrap();
    assert_eq!(meta["title"], "CO2 intensity");
    assert_eq!(meta["dataset_id"], "co2");
    assert_eq!(meta["row_count"], 2);
    assert_eq!(meta["source"]["import_type"], "csv");
    assert_eq!(meta["columns"][1]["unit"], "g/kWh");
    assert_eq!(meta["data_as_of"], "2026-01-02");
    let data = fs::read(&d.target).unwrap();
    assert_eq!(meta["sha256"], content_hash(&data));
}

#[test]
fn curated_sidecar_keys_survive_a_write() {
    let tmp = tempfile::tempdir().unwrap();
    let d = descriptor(tmp.path());
    fs::create_dir_all(tmp.path().join("out")).unwrap();
    let meta_path = tmp.path().join("out/co2.meta.json");
    fs::write(
        &meta_path,
        r#"{"title":"CO2 intensity (DE)","description":"Hand-written.","created_at":"2025-11-02T08:00:00","row_count":1,"sha256":"stale"}"#,
    )
    .unwrap();

    let rec = record(&d, "day,g_per_kwh\n2026-01-01,380\n2026-01-02,350\n");
    merge_and_write(&d, rec, MergePolicy::FirstWriteWins).unwrap();

    let meta: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&meta_path).unwrap()).unwrap();
    assert_eq!(meta["created_at"], "2025-11-02T08:00:00");
    assert_eq!(meta["title"], "CO2 intensity (DE)");
    assert_eq!(meta["description"], "Hand-written.");
    assert_eq!(meta["row_count"], 2);
    assert_eq!(meta["data_as_of"], "2026-01-02");
    assert_eq!(meta["sha256"], content_hash(&fs::read(&d.target).unwrap()));
    // Keys the file lacked are filled from the catalog.
    assert_eq!(meta["source"]["url"], "https://example.test/co2.csv");

    // A rerun with the same rows leaves the merged sidecar untouched.
    let before = fs::read(&meta_path).unwrap();
    let rec = record(&d, "day,g_per_kwh\n2026-01-01,380\n");
    merge_and_write(&d, rec, MergePolicy::FirstWriteWins).unwrap();
    assert_eq!(fs::read(&meta_path).unwrap(), before);
}

#[test]
fn sub_second_keys_are_stable_across_reruns() {
    let tmp = tempfile::tempdir().unwrap();
    let yaml = r#"
- id: ticks
  name: Ticks
  source: https://example.test/ticks.csv
  cadence: hourly
  target: out/ticks.csv
  schema:
    - { name: ts, type: timestamp }
    - { name: v, type: integer }
"#;
    let d = parse_catalog(yaml, "yaml", tmp.path(), "test").unwrap().remove(0);
    let body = "ts,v\n2026-01-05T00:00:00.500Z,1\n2026-01-05T00:00:00Z,2\n";

    for expected in [WriteStatus::Written, WriteStatus::Unchanged, WriteStatus::Unchanged] {
        let out = merge_and_write(&d, record(&d, body), MergePolicy::FirstWriteWins).unwrap();
        assert_eq!(out.status, expected);
        assert_eq!(out.rows_total, 2);
    }
    assert_eq!(
        fs::read_to_string(&d.target).unwrap(),
        "ts,v\n2026-01-05T00:00:00Z,2\n2026-01-05T00:00:00.500Z,1\n"
    );
}

#[tokio::test]
async fn concurrent_writers_on_one_target_are_serialized() {
    let tmp = tempfile::tempdir().unwrap();
    let d = descriptor(tmp.path());
    let locks = FileLocks::new();

    let a = record(&d, "day,g_per_kwh\n2026-01-01,380\n2026-01-03,300\n");
    let b = record(&d, "day,g_per_kwh\n2026-01-02,350\n2026-01-04,310\n");
    let (ra, rb) = tokio::join!(
        write_merged(&locks, &d, a, MergePolicy::FirstWriteWins),
        write_merged(&locks, &d, b, MergePolicy::FirstWriteWins),
    );
    ra.unwrap();
    rb.unwrap();

    assert_eq!(
        fs::read_to_string(&d.target).unwrap(),
        "day,g_per_kwh\n2026-01-01,380\n2026-01-02,350\n2026-01-03,300\n2026-01-04,310\n"
    );
    assert!(!lock_path_for(&d.target).exists());
}
