// src/ingest/types.rs
use chrono::{DateTime, Utc};

use crate::catalog::DatasetDescriptor;
use crate::error::DatasetError;

/// Body of one successful retrieval. Lives only for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFetchResult {
    pub dataset_id: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
    /// HTTP status code; `None` for non-HTTP sources (`file://`).
    pub status: Option<u16>,
    pub attempts: u32,
}

impl RawFetchResult {
    pub fn from_text(dataset_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            body: body.into(),
            fetched_at: Utc::now(),
            status: None,
            attempts: 1,
        }
    }
}

/// Anything that can turn a descriptor into raw upstream text.
#[async_trait::async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, descriptor: &DatasetDescriptor) -> Result<RawFetchResult, DatasetError>;
    fn name(&self) -> &'static str;
}
