// src/index.rs
//! Catalog index: regenerates `catalog.json` from the CSV files and `.meta.json`
//! sidecars found under a data directory.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::ingest::writer::{atomic_write, sidecar_path_for};

pub const SCHEMA_VERSION: &str = "1.0";

static RE_YEAR_MONTH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}$").unwrap());

/// Source attribution as found in the sidecar; extra keys pass through.
pub type IndexSource = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexEntry {
    pub csv_path: String,
    pub metadata_path: Option<String>,
    pub title: String,
    pub description: String,
    pub source: IndexSource,
    pub tags: Vec<String>,
    pub license: String,
    pub created_at: Option<String>,
    pub thematic_name: Option<String>,
    pub year_month: Option<String>,
    pub filename: String,
    pub has_metadata: bool,
    /// Last data point, copied from the sidecar.
    pub data_as_of: Option<String>,
    // Freshness scoring happens downstream; always null here.
    pub freshness_score: Option<f64>,
    pub freshness_status: Option<String>,
    pub freshness_indicator: Option<String>,
    pub source_reliability: Option<String>,
    pub days_since_check: Option<i64>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogIndex {
    pub schema_version: &'static str,
    pub generated_at: String,
    pub total_datasets: usize,
    pub datasets: Vec<IndexEntry>,
}

/// Sidecar fields the index reads. Everything else in the file is ignored.
#[derive(Debug, Default, Deserialize)]
struct SidecarView {
    title: Option<String>,
    description: Option<String>,
    source: Option<serde_json::Value>,
    tags: Option<Vec<String>>,
    license: Option<String>,
    created_at: Option<String>,
    data_as_of: Option<String>,
}

/// Split a POSIX path into (thematic_name, year_month, filename).
///
/// `data/2026-01/charts/foo.csv` → (`charts`, `2026-01`, `foo.csv`)
pub fn path_components(csv_path: &str) -> (Option<String>, Option<String>, String) {
    let parts: Vec<&str> = csv_path.split('/').collect();
    let filename = parts.last().copied().unwrap_or_default().to_string();
    let year_month = parts
        .iter()
        .find(|p| RE_YEAR_MONTH.is_match(p))
        .map(|p| p.to_string());
    let thematic_name = if parts.len() >= 2 {
        let parent = parts[parts.len() - 2];
        (!RE_YEAR_MONTH.is_match(parent) && parent != "data").then(|| parent.to_string())
    } else {
        None
    };
    (thematic_name, year_month, filename)
}

/// `day-ahead_prices` → `Day Ahead Prices`
pub fn title_from_stem(stem: &str) -> String {
    stem.replace(['-', '_'], " ")
        .split(' ')
        .map(|w| {
            let mut cs = w.chars();
            match cs.next() {
                Some(f) => f.to_uppercase().chain(cs.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn to_posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn unknown_source() -> IndexSource {
    let mut src = IndexSource::new();
    src.insert("name".into(), "Unknown".into());
    src.insert("url".into(), serde_json::Value::Null);
    src
}

/// Sidecar `source` object as-is, or the unknown placeholder when it is missing
/// or not an object. `import_type` defaults to `csv`.
fn source_from(value: Option<serde_json::Value>) -> IndexSource {
    let mut src = match value {
        Some(serde_json::Value::Object(map)) => map,
        _ => unknown_source(),
    };
    src.entry("import_type").or_insert_with(|| "csv".into());
    src
}

/// Scan `data_dir` and build the index. Paths are reported relative to the
/// data dir's parent, so `data/...` stays the prefix as in the repository layout.
pub fn rebuild_index(data_dir: &Path, generated_at: DateTime<Utc>) -> Result<CatalogIndex> {
    let rel_base = data_dir.parent().unwrap_or_else(|| Path::new(""));
    let mut datasets = Vec::new();

    for entry in WalkDir::new(data_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", data_dir.display()))?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }

        let rel = path.strip_prefix(rel_base).unwrap_or(path);
        let csv_path = to_posix(rel);
        let (thematic_name, year_month, filename) = path_components(&csv_path);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let default_title = title_from_stem(&stem);

        let meta_path = sidecar_path_for(path);
        let sidecar = if meta_path.is_file() {
            match std::fs::read_to_string(&meta_path)
                .map_err(anyhow::Error::from)
                .and_then(|s| serde_json::from_str::<SidecarView>(&s).map_err(anyhow::Error::from))
            {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(path = %meta_path.display(), error = %e, "skipping unreadable sidecar");
                    // Broken sidecar: the CSV is not indexed at all.
                    continue;
                }
            }
        } else {
            None
        };

        let entry = match sidecar {
            Some(meta) => IndexEntry {
                csv_path,
                metadata_path: Some(to_posix(meta_path.strip_prefix(rel_base).unwrap_or(&meta_path))),
                title: meta.title.unwrap_or(default_title),
                description: meta.description.unwrap_or_default(),
                source: source_from(meta.source),
                tags: meta.tags.unwrap_or_default(),
                license: meta.license.unwrap_or_else(|| "Unknown".to_string()),
                created_at: meta.created_at,
                thematic_name,
                year_month,
                filename,
                has_metadata: true,
                data_as_of: meta.data_as_of,
                freshness_score: None,
                freshness_status: None,
                freshness_indicator: None,
                source_reliability: None,
                days_since_check: None,
                warning: None,
            },
            None => IndexEntry {
                csv_path,
                metadata_path: None,
                description: format!("Dataset: {default_title}"),
                title: default_title,
                source: source_from(None),
                tags: thematic_name.iter().cloned().collect(),
                license: "Unknown".to_string(),
                created_at: None,
                thematic_name,
                year_month,
                filename,
                has_metadata: false,
                data_as_of: None,
                freshness_score: None,
                freshness_status: None,
                freshness_indicator: None,
                source_reliability: None,
                days_since_check: None,
                warning: None,
            },
        };
        datasets.push(entry);
    }

    datasets.sort_by(|a, b| a.csv_path.cmp(&b.csv_path));
    Ok(CatalogIndex {
        schema_version: SCHEMA_VERSION,
        generated_at: generated_at.to_rfc3339_opts(SecondsFormat::AutoSi, false),
        total_datasets: datasets.len(),
        datasets,
    })
}

/// Rebuild and write the index as pretty JSON, atomically.
pub fn write_index(data_dir: &Path, out: &Path) -> Result<CatalogIndex> {
    let index = rebuild_index(data_dir, Utc::now())?;
    let mut bytes = serde_json::to_vec_pretty(&index).context("serializing catalog index")?;
    bytes.push(b'\n');
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    atomic_write(out, &bytes).with_context(|| format!("writing {}", out.display()))?;
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;

    #[test]
    fn components_follow_repository_layout() {
        assert_eq!(
            path_components("data/2026-01/charts/foo.csv"),
            (
                Some("charts".to_string()),
                Some("2026-01".to_string()),
                "foo.csv".to_string()
            )
        );
        assert_eq!(
            path_components("data/2026-01/foo.csv"),
            (None, Some("2026-01".to_string()), "foo.csv".to_string())
        );
        assert_eq!(
            path_components("data/foo.csv"),
            (None, None, "foo.csv".to_string())
        );
    }

    #[test]
    fn titles_from_stems() {
        assert_eq!(title_from_stem("day-ahead_prices"), "Day Ahead Prices");
        assert_eq!(title_from_stem("CO2-intensity"), "Co2 Intensity");
    }

    #[test]
    fn rebuild_mixes_sidecar_and_fallback_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        let charts = data.join("2026-01").join("charts");
        fs::create_dir_all(&charts).unwrap();
        fs::write(charts.join("load.csv"), "a\n1\n").unwrap();
        fs::write(
            charts.join("load.meta.json"),
            r#"{"title":"Grid load","source":{"name":"SMARD","url":"https://smard.de","filter":410},
                "tags":["load"],"data_as_of":"2026-01-04T23:00:00Z"}"#,
        )
        .unwrap();
        fs::write(charts.join("solar_share.csv"), "a\n1\n").unwrap();
        fs::write(charts.join("wind.csv"), "a\n1\n").unwrap();
        fs::write(
            charts.join("wind.meta.json"),
            r#"{"source":{"url":"https://example.test/wind","import_type":"api"}}"#,
        )
        .unwrap();
        fs::write(charts.join("broken.csv"), "a\n").unwrap();
        fs::write(charts.join("broken.meta.json"), "{not json").unwrap();
        fs::write(charts.join("orphan.meta.json"), "{}").unwrap();

        let at = Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap();
        let idx = rebuild_index(&data, at).unwrap();
        assert_eq!(idx.total_datasets, 3);
        let load = &idx.datasets[0];
        assert_eq!(load.csv_path, "data/2026-01/charts/load.csv");
        assert_eq!(load.title, "Grid load");
        assert_eq!(load.source["name"], "SMARD");
        assert_eq!(load.source["filter"], 410);
        assert_eq!(load.source["import_type"], "csv");
        assert_eq!(load.license, "Unknown");
        assert_eq!(load.data_as_of.as_deref(), Some("2026-01-04T23:00:00Z"));
        assert_eq!(load.freshness_score, None);
        assert!(load.has_metadata);

        let wind = &idx.datasets[2];
        assert_eq!(wind.csv_path, "data/2026-01/charts/wind.csv");
        assert!(!wind.source.contains_key("name"));
        assert_eq!(wind.source["import_type"], "api");

        let fallback = &idx.datasets[1];
        assert_eq!(fallback.title, "Solar Share");
        assert_eq!(fallback.description, "Dataset: Solar Share");
        assert_eq!(fallback.tags, vec!["charts".to_string()]);
        assert!(!fallback.has_metadata);
        assert_eq!(fallback.source["name"], "Unknown");
        assert_eq!(fallback.source["import_type"], "csv");
        assert_eq!(fallback.data_as_of, None);

        let json = serde_json::to_value(fallback).unwrap();
        for key in [
            "freshness_score",
            "freshness_status",
            "freshness_indicator",
            "data_as_of",
            "source_reliability",
            "days_since_check",
            "warning",
        ] {
            assert!(json[key].is_null(), "{key} should be present and null");
            assert!(json.as_object().unwrap().contains_key(key), "{key} missing");
        }
        assert_eq!(idx.generated_at, "2026-01-05T08:00:00+00:00");
    }
}
