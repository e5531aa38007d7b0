// src/ingest/mod.rs
pub mod config;
pub mod fetch;
pub mod report;
pub mod retry;
pub mod types;
pub mod validate;
pub mod writer;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::catalog::{Cadence, Catalog, DatasetDescriptor};
use crate::error::{CatalogError, DatasetError};
use crate::ingest::config::IngestConfig;
use crate::ingest::report::{Outcome, ReportCollector, RunReport};
use crate::ingest::types::SourceFetcher;
use crate::ingest::writer::{FileLocks, MergePolicy, WriteStatus};

/// One-time metrics registration (so series show up in the exposition).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "ingest_fetch_attempts_total",
            "Source fetch attempts, including retries."
        );
        describe_counter!(
            "ingest_fetch_errors_total",
            "Failed source fetch attempts."
        );
        describe_histogram!("ingest_fetch_ms", "Fetch attempt duration in milliseconds.");
        describe_counter!(
            "ingest_rows_validated_total",
            "Rows accepted by the schema validator."
        );
        describe_counter!(
            "ingest_rows_written_total",
            "Rows added or replaced in data files."
        );
        describe_counter!(
            "ingest_datasets_total",
            "Dataset outcomes per run, labelled by outcome."
        );
        describe_gauge!("ingest_last_run_ts", "Unix ts when the ingest pipeline last ran.");
    });
}

/// Fetch cancellation point shared by all dataset tasks of a run.
#[derive(Debug, Clone, Copy)]
struct RunDeadline {
    at: Instant,
    budget: Duration,
}

/// Run ingest for the catalog, optionally restricted to `only` ids.
///
/// Only catalog-level problems (unknown id in `only`) are returned as errors;
/// everything per dataset ends up in the report.
pub async fn run(
    catalog: &Catalog,
    only: &[String],
    cfg: &IngestConfig,
    fetcher: Arc<dyn SourceFetcher>,
) -> Result<RunReport, CatalogError> {
    let selected = catalog.select(only)?;
    Ok(run_datasets(selected, !only.is_empty(), cfg, fetcher).await)
}

/// Process `datasets` with at most `cfg.concurrency` in flight.
/// `explicit` means the caller picked the datasets by id, so `manual` cadence is fetched too.
pub async fn run_datasets(
    datasets: Vec<DatasetDescriptor>,
    explicit: bool,
    cfg: &IngestConfig,
    fetcher: Arc<dyn SourceFetcher>,
) -> RunReport {
    ensure_metrics_described();

    let collector = Arc::new(ReportCollector::new());
    let locks = Arc::new(FileLocks::new());
    let permits = Arc::new(Semaphore::new(cfg.concurrency.max(1)));
    let policy = MergePolicy::from_overwrite(cfg.overwrite);
    let deadline = cfg.run_timeout.map(|budget| RunDeadline {
        at: Instant::now() + budget,
        budget,
    });

    tracing::info!(
        target: "ingest",
        datasets = datasets.len(),
        concurrency = cfg.concurrency,
        overwrite = cfg.overwrite,
        fetcher = fetcher.name(),
        "ingest run starting"
    );

    let mut tasks = JoinSet::new();
    let mut task_ids = HashMap::new();
    for d in datasets {
        if d.cadence == Cadence::Manual && !explicit {
            tracing::info!(target: "ingest", dataset = %d.id, "manual cadence, skipped");
            collector.record(d.id, Outcome::SkippedManual, 0);
            continue;
        }

        let id = d.id.clone();
        let collector = Arc::clone(&collector);
        let locks = Arc::clone(&locks);
        let permits = Arc::clone(&permits);
        let fetcher = Arc::clone(&fetcher);
        let handle = tasks.spawn(async move {
            // Closed only if the semaphore is dropped, which cannot happen while we hold an Arc.
            let _permit = permits.acquire_owned().await.ok();
            let t0 = Instant::now();
            let outcome = process_dataset(&d, fetcher.as_ref(), &locks, policy, deadline).await;
            let ms = t0.elapsed().as_millis() as u64;
            tracing::info!(target: "ingest", dataset = %d.id, outcome = outcome.label(), ms, "dataset done");
            collector.record(d.id, outcome, ms);
        });
        task_ids.insert(handle.id(), id);
    }

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            let id = task_ids
                .get(&e.id())
                .cloned()
                .unwrap_or_else(|| "<unknown>".to_string());
            tracing::error!(target: "ingest", dataset = %id, error = %e, "dataset task aborted");
            collector.record(id, Outcome::Aborted { error: e.to_string() }, 0);
        }
    }

    gauge!("ingest_last_run_ts").set(chrono::Utc::now().timestamp().max(0) as f64);
    let report = collector.finish();
    tracing::info!(
        target: "ingest",
        updated = report.summary.succeeded,
        unchanged = report.summary.unchanged,
        skipped = report.summary.skipped,
        failed = report.summary.failed,
        "ingest run finished"
    );
    report
}

/// fetch → validate → write for one dataset. Every error stops here as an [`Outcome`].
async fn process_dataset(
    d: &DatasetDescriptor,
    fetcher: &dyn SourceFetcher,
    locks: &FileLocks,
    policy: MergePolicy,
    deadline: Option<RunDeadline>,
) -> Outcome {
    let fetched = match deadline {
        Some(dl) => match tokio::time::timeout_at(dl.at, fetcher.fetch(d)).await {
            Ok(r) => r,
            Err(_) => Err(DatasetError::FetchTimeout { timeout: dl.budget }),
        },
        None => fetcher.fetch(d).await,
    };
    let raw = match fetched {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(target: "ingest", dataset = %d.id, error = %e, "fetch failed");
            return Outcome::from_error(&e);
        }
    };

    let record = match validate::validate(&raw, d) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(target: "ingest", dataset = %d.id, error = %e, "validation failed, nothing written");
            return Outcome::from_error(&e);
        }
    };

    match writer::write_merged(locks, d, record, policy).await {
        Ok(w) => match w.status {
            WriteStatus::Written => Outcome::Success {
                rows_added: w.rows_added,
                rows_replaced: w.rows_replaced,
                rows_total: w.rows_total,
            },
            WriteStatus::Unchanged => Outcome::SkippedNoChange {
                rows_total: w.rows_total,
            },
        },
        Err(e) => {
            if matches!(e, DatasetError::WriteConflict { .. }) {
                tracing::warn!(
                    target: "ingest",
                    dataset = %d.id,
                    error = %e,
                    "write conflict: another writer targets this file without coordination"
                );
            } else {
                tracing::warn!(target: "ingest", dataset = %d.id, error = %e, "write failed");
            }
            Outcome::from_error(&e)
        }
    }
}
