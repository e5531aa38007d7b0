// src/metrics.rs
use std::path::Path;

use anyhow::{Context, Result};
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder globally. Only one recorder per process.
    pub fn install(concurrency: usize) -> Result<Self> {
        let builder = PrometheusBuilder::new();

        let handle = builder
            .install_recorder()
            .context("prometheus: install recorder")?;

        // Set once; the pool size does not change during a run.
        gauge!("ingest_concurrency").set(concurrency as f64);

        Ok(Self { handle })
    }

    /// Current exposition text.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Write the exposition text to `path` (textfile-collector style).
    pub fn write_to(&self, path: &Path) -> Result<()> {
        crate::ingest::writer::atomic_write(path, self.render().as_bytes())
            .with_context(|| format!("writing metrics to {}", path.display()))
    }
}
