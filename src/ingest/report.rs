// src/ingest/report.rs
//! Run reporter: per-dataset outcomes aggregated under one mutex.

use std::fmt::Write as _;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;

use crate::error::DatasetError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum Outcome {
    Success {
        rows_added: usize,
        rows_replaced: usize,
        rows_total: usize,
    },
    SkippedNoChange {
        rows_total: usize,
    },
    /// Cadence `manual` and not selected explicitly.
    SkippedManual,
    FetchFailed {
        error: String,
    },
    ValidationFailed {
        error: String,
    },
    WriteFailed {
        error: String,
    },
    /// The dataset task panicked or was cancelled.
    Aborted {
        error: String,
    },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::SkippedNoChange { .. } => "skipped-no-change",
            Outcome::SkippedManual => "skipped-manual",
            Outcome::FetchFailed { .. } => "fetch-failed",
            Outcome::ValidationFailed { .. } => "validation-failed",
            Outcome::WriteFailed { .. } => "write-failed",
            Outcome::Aborted { .. } => "aborted",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Outcome::FetchFailed { .. }
                | Outcome::ValidationFailed { .. }
                | Outcome::WriteFailed { .. }
                | Outcome::Aborted { .. }
        )
    }

    /// Map a pipeline error to the stage that produced it.
    pub fn from_error(err: &DatasetError) -> Self {
        let error = err.to_string();
        match err {
            DatasetError::FetchTimeout { .. } | DatasetError::FetchUnavailable { .. } => {
                Outcome::FetchFailed { error }
            }
            DatasetError::SchemaMismatch { .. } => Outcome::ValidationFailed { error },
            DatasetError::WriteConflict { .. }
            | DatasetError::DataFile { .. }
            | DatasetError::Io { .. } => Outcome::WriteFailed { error },
        }
    }

    fn detail(&self) -> String {
        match self {
            Outcome::Success {
                rows_added,
                rows_replaced,
                rows_total,
            } => format!("+{rows_added} new, {rows_replaced} replaced, {rows_total} total"),
            Outcome::SkippedNoChange { rows_total } => format!("{rows_total} rows, nothing new"),
            Outcome::SkippedManual => "manual cadence, select with --only".to_string(),
            Outcome::FetchFailed { error }
            | Outcome::ValidationFailed { error }
            | Outcome::WriteFailed { error }
            | Outcome::Aborted { error } => error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetReport {
    pub dataset: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: Summary,
    pub datasets: Vec<DatasetReport>,
}

impl RunReport {
    pub fn get(&self, dataset: &str) -> Option<&DatasetReport> {
        self.datasets.iter().find(|d| d.dataset == dataset)
    }

    pub fn has_failures(&self) -> bool {
        self.summary.failed > 0
    }

    /// 0 when every dataset succeeded or was skipped, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        u8::from(self.has_failures())
    }

    pub fn render_text(&self) -> String {
        let width = self
            .datasets
            .iter()
            .map(|d| d.dataset.len())
            .max()
            .unwrap_or(0)
            .max("dataset".len());
        let mut out = String::new();
        let _ = writeln!(out, "{:<width$}  {:<17}  detail", "dataset", "outcome");
        for d in &self.datasets {
            let _ = writeln!(
                out,
                "{:<width$}  {:<17}  {}",
                d.dataset,
                d.outcome.label(),
                d.outcome.detail()
            );
        }
        let s = &self.summary;
        let _ = writeln!(
            out,
            "\n{} datasets: {} updated, {} unchanged, {} skipped, {} failed ({} ms)",
            s.total,
            s.succeeded,
            s.unchanged,
            s.skipped,
            s.failed,
            (self.finished_at - self.started_at).num_milliseconds().max(0)
        );
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Single mutual-exclusion point for outcomes recorded by concurrent dataset tasks.
#[derive(Debug)]
pub struct ReportCollector {
    started_at: DateTime<Utc>,
    inner: Mutex<Vec<DatasetReport>>,
}

impl Default for ReportCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportCollector {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            inner: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, dataset: impl Into<String>, outcome: Outcome, duration_ms: u64) {
        counter!("ingest_datasets_total", "outcome" => outcome.label()).increment(1);
        let entry = DatasetReport {
            dataset: dataset.into(),
            outcome,
            duration_ms,
        };
        let mut v = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        v.push(entry);
    }

    /// Drain into a report, ordered by dataset id.
    pub fn finish(&self) -> RunReport {
        let mut datasets = {
            let mut v = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *v)
        };
        datasets.sort_by(|a, b| a.dataset.cmp(&b.dataset));

        let mut summary = Summary {
            total: datasets.len(),
            succeeded: 0,
            unchanged: 0,
            skipped: 0,
            failed: 0,
        };
        for d in &datasets {
            match d.outcome {
                Outcome::Success { .. } => summary.succeeded += 1,
                Outcome::SkippedNoChange { .. } => summary.unchanged += 1,
                Outcome::SkippedManual => summary.skipped += 1,
                _ => summary.failed += 1,
            }
        }

        RunReport {
            started_at: self.started_at,
            finished_at: Utc::now(),
            summary,
            datasets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_and_exit_code() {
        let c = ReportCollector::new();
        c.record(
            "b",
            Outcome::Success {
                rows_added: 3,
                rows_replaced: 0,
                rows_total: 3,
            },
            5,
        );
        c.record("a", Outcome::SkippedNoChange { rows_total: 3 }, 1);
        c.record("c", Outcome::SkippedManual, 0);
        let r = c.finish();
        assert_eq!(r.datasets[0].dataset, "a");
        assert_eq!(r.summary.succeeded, 1);
        assert_eq!(r.summary.unchanged, 1);
        assert_eq!(r.summary.skipped, 1);
        assert_eq!(r.exit_code(), 0);

        let c = ReportCollector::new();
        c.record(
            "x",
            Outcome::from_error(&DatasetError::mismatch(2, "bad")),
            1,
        );
        let r = c.finish();
        assert!(matches!(
            r.get("x").unwrap().outcome,
            Outcome::ValidationFailed { .. }
        ));
        assert_eq!(r.exit_code(), 1);
        assert!(r.render_text().contains("validation-failed"));
    }

    #[test]
    fn json_is_flat_per_dataset() {
        let c = ReportCollector::new();
        c.record(
            "prices",
            Outcome::FetchFailed {
                error: "503".into(),
            },
            12,
        );
        let json = c.finish().to_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["datasets"][0]["outcome"], "fetch-failed");
        assert_eq!(v["datasets"][0]["error"], "503");
        assert_eq!(v["summary"]["failed"], 1);
    }
}
