// tests/catalog_index.rs
use std::fs;
use std::sync::Arc;

use async_trait::async_trait;
use dataset_ingest::catalog::{load_catalog, DatasetDescriptor};
use dataset_ingest::error::{CatalogError, DatasetError};
use dataset_ingest::index::write_index;
use dataset_ingest::ingest::config::IngestConfig;
use dataset_ingest::ingest::types::{RawFetchResult, SourceFetcher};
use dataset_ingest::run;

struct StaticFetcher;

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch(&self, d: &DatasetDescriptor) -> Result<RawFetchResult, DatasetError> {
        Ok(RawFetchResult::from_text(
            d.id.clone(),
            "Datum;Anteil\n01.01.2026;41,5\n02.01.2026;-\n",
        ))
    }
    fn name(&self) -> &'static str {
        "static"
    }
}

const CATALOG_JSON: &str = r#"{
  "datasets": [
    {
      "id": "solar-share",
      "name": "Solar share",
      "description": "Daily solar share of public net generation.",
      "source": { "name": "Energy-Charts", "url": "https://api.energy-charts.info/share" },
      "cadence": "daily",
      "target": "data/2026-01/renewables/solar_share.csv",
      "tags": ["solar", "renewables"],
      "license": "CC BY 4.0",
      "format": { "delimiter": ";", "decimal": ",", "null_values": ["-"] },
      "schema": [
        { "name": "day", "type": "date", "format": "%d.%m.%Y", "source": "Datum" },
        { "name": "share_pct", "type": "decimal", "unit": "%", "source": "Anteil",
          "min": 0, "max": 100, "nullable": true }
      ]
    }
  ]
}"#;

#[tokio::test]
async fn ingest_then_rebuild_index() {
    let tmp = tempfile::tempdir().unwrap();
    let cat_path = tmp.path().join("catalog.sources.json");
    fs::write(&cat_path, CATALOG_JSON).unwrap();
    let catalog = load_catalog(&cat_path).unwrap();

    let d = catalog.get("solar-share").unwrap();
    assert_eq!(
        d.target,
        tmp.path().join("data/2026-01/renewables/solar_share.csv")
    );
    assert_eq!(d.format.delimiter, b';');

    let report = run(&catalog, &[], &IngestConfig::default(), Arc::new(StaticFetcher))
        .await
        .unwrap();
    assert_eq!(report.exit_code(), 0);
    assert_eq!(
        fs::read_to_string(&d.target).unwrap(),
        "day,share_pct\n2026-01-01,41.5\n2026-01-02,\n"
    );

    // Fallback entry for a file nobody catalogued
    let misc = tmp.path().join("data/2026-01/misc");
    fs::create_dir_all(&misc).unwrap();
    fs::write(misc.join("wind_offshore.csv"), "a\n1\n").unwrap();

    let out = tmp.path().join("catalog.json");
    let index = write_index(&tmp.path().join("data"), &out).unwrap();
    assert_eq!(index.total_datasets, 2);

    let v: serde_json::Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(v["schema_version"], "1.0");
    let first = &v["datasets"][0];
    assert_eq!(first["csv_path"], "data/2026-01/misc/wind_offshore.csv");
    assert_eq!(first["title"], "Wind Offshore");
    assert_eq!(first["has_metadata"], false);

    let second = &v["datasets"][1];
    assert_eq!(second["csv_path"], "data/2026-01/renewables/solar_share.csv");
    assert_eq!(
        second["metadata_path"],
        "data/2026-01/renewables/solar_share.meta.json"
    );
    assert_eq!(second["title"], "Solar share");
    assert_eq!(second["source"]["name"], "Energy-Charts");
    assert_eq!(second["license"], "CC BY 4.0");
    assert_eq!(second["thematic_name"], "renewables");
    assert_eq!(second["year_month"], "2026-01");
    assert_eq!(second["tags"][0], "solar");
    assert_eq!(second["data_as_of"], "2026-01-02");
    assert_eq!(second["source"]["import_type"], "csv");
    assert!(second["freshness_score"].is_null());
}

#[test]
fn broken_catalogs_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();

    let p = tmp.path().join("catalog.yaml");
    fs::write(&p, "datasets: [ { id: a, name: A").unwrap();
    assert!(matches!(
        load_catalog(&p).unwrap_err(),
        CatalogError::Parse { .. }
    ));

    // Decimal natural key has no usable order
    fs::write(
        &p,
        r#"
- id: a
  name: A
  source: https://example.test/a.csv
  cadence: daily
  target: a.csv
  schema: [{ name: v, type: decimal }]
"#,
    )
    .unwrap();
    match load_catalog(&p).unwrap_err() {
        CatalogError::Schema { entry, message } => {
            assert_eq!(entry, "a");
            assert!(message.contains("natural key"), "got: {message}");
        }
        other => panic!("expected schema error, got {other:?}"),
    }

    // Two datasets writing the same file
    fs::write(
        &p,
        r#"
- { id: a, name: A, source: "https://example.test/a.csv", cadence: daily, target: out/x.csv, schema: [{ name: d, type: date }] }
- { id: b, name: B, source: "https://example.test/b.csv", cadence: daily, target: out/../out/x.csv, schema: [{ name: d, type: date }] }
"#,
    )
    .unwrap();
    assert!(matches!(
        load_catalog(&p).unwrap_err(),
        CatalogError::Schema { .. }
    ));

    assert!(matches!(
        load_catalog(&tmp.path().join("missing.yaml")).unwrap_err(),
        CatalogError::Io { .. }
    ));
}
