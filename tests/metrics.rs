// tests/metrics.rs
// Own test binary: the Prometheus recorder is process-global.
use std::sync::Arc;

use async_trait::async_trait;
use dataset_ingest::catalog::{parse_catalog, DatasetDescriptor};
use dataset_ingest::error::DatasetError;
use dataset_ingest::ingest::config::IngestConfig;
use dataset_ingest::ingest::types::{RawFetchResult, SourceFetcher};
use dataset_ingest::metrics::Metrics;
use dataset_ingest::run_datasets;

struct FixtureFetcher;

#[async_trait]
impl SourceFetcher for FixtureFetcher {
    async fn fetch(&self, d: &DatasetDescriptor) -> Result<RawFetchResult, DatasetError> {
        if d.id == "broken" {
            return Err(DatasetError::FetchUnavailable {
                attempts: 1,
                reason: "http status 404 Not Found".to_string(),
            });
        }
        Ok(RawFetchResult::from_text(
            d.id.clone(),
            "day,value\n2026-01-01,1\n2026-01-02,2\n",
        ))
    }
    fn name(&self) -> &'static str {
        "fixture"
    }
}

#[tokio::test]
async fn metrics_exposed_after_run() {
    let metrics = Metrics::install(2).expect("recorder");

    let tmp = tempfile::tempdir().unwrap();
    let yaml = r#"
- id: ok
  name: Ok
  source: https://example.test/ok.csv
  cadence: daily
  target: ok.csv
  schema: [{ name: day, type: date }, { name: value, type: integer }]
- id: broken
  name: Broken
  source: https://example.test/broken.csv
  cadence: daily
  target: broken.csv
  schema: [{ name: day, type: date }, { name: value, type: integer }]
"#;
    let datasets = parse_catalog(yaml, "yaml", tmp.path(), "test").unwrap();
    let report = run_datasets(
        datasets,
        false,
        &IngestConfig::default(),
        Arc::new(FixtureFetcher),
    )
    .await;
    assert_eq!(report.summary.failed, 1);

    let out = metrics.render();
    assert!(out.contains("ingest_rows_validated_total 2"), "{out}");
    assert!(out.contains("ingest_rows_written_total 2"), "{out}");
    assert!(out.contains(r#"ingest_datasets_total{outcome="success"} 1"#), "{out}");
    assert!(out.contains(r#"ingest_datasets_total{outcome="fetch-failed"} 1"#), "{out}");
    assert!(out.contains("ingest_last_run_ts"));
    assert!(out.contains("ingest_concurrency 2"));

    let file = tmp.path().join("metrics.prom");
    metrics.write_to(&file).unwrap();
    assert!(std::fs::read_to_string(&file)
        .unwrap()
        .contains("ingest_datasets_total"));
}
