// src/ingest/fetch.rs
//! Source fetcher: HTTP(S) with per-attempt deadline and retry, plus `file://` sources.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, histogram};
use reqwest::{Client, StatusCode, Url};

use crate::catalog::DatasetDescriptor;
use crate::error::DatasetError;
use crate::ingest::config::IngestConfig;
use crate::ingest::retry::{BackoffPolicy, RetryPolicy};
use crate::ingest::types::{RawFetchResult, SourceFetcher};

/// Outcome of a single attempt, before retry policy is applied.
#[derive(Debug)]
enum AttemptError {
    Timeout,
    /// Connection reset, 5xx, 429 ...
    Transient(String),
    /// Not worth retrying (4xx, unreadable local file).
    Fatal(String),
}

pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(cfg: &IngestConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(cfg.timeout)
            .connect_timeout(cfg.timeout)
            .user_agent(cfg.user_agent.clone())
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            timeout: cfg.timeout,
            retry: cfg.retry.clone(),
        })
    }

    async fn attempt_http(&self, url: &Url) -> Result<(String, u16), AttemptError> {
        let fut = async {
            let resp = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(classify_reqwest)?;
            let status = resp.status();
            if !status.is_success() {
                let msg = format!("http status {status}");
                return Err(if is_transient_status(status) {
                    AttemptError::Transient(msg)
                } else {
                    AttemptError::Fatal(msg)
                });
            }
            let body = resp.text().await.map_err(classify_reqwest)?;
            Ok((body, status.as_u16()))
        };
        // Client timeout covers the request; this bounds body streaming too.
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(AttemptError::Timeout),
        }
    }
}

fn classify_reqwest(e: reqwest::Error) -> AttemptError {
    if e.is_timeout() {
        AttemptError::Timeout
    } else if e.is_builder() || e.is_redirect() {
        AttemptError::Fatal(e.to_string())
    } else {
        AttemptError::Transient(e.to_string())
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

async fn read_file_source(url: &Url) -> Result<String, DatasetError> {
    let path = url.to_file_path().map_err(|_| DatasetError::FetchUnavailable {
        attempts: 1,
        reason: format!("not a local path: {url}"),
    })?;
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| DatasetError::FetchUnavailable {
            attempts: 1,
            reason: format!("{}: {e}", path.display()),
        })
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, d: &DatasetDescriptor) -> Result<RawFetchResult, DatasetError> {
        let url = &d.source.url;
        if url.scheme() == "file" {
            counter!("ingest_fetch_attempts_total").increment(1);
            let body = read_file_source(url).await.inspect_err(|_| {
                counter!("ingest_fetch_errors_total").increment(1);
            })?;
            return Ok(RawFetchResult {
                dataset_id: d.id.clone(),
                body,
                fetched_at: Utc::now(),
                status: None,
                attempts: 1,
            });
        }

        let max = self.retry.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=max {
            counter!("ingest_fetch_attempts_total").increment(1);
            let t0 = Instant::now();
            let res = self.attempt_http(url).await;
            histogram!("ingest_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

            let reason = match res {
                Ok((body, status)) => {
                    tracing::debug!(target: "fetch", dataset = %d.id, attempt, status, bytes = body.len(), "fetched");
                    return Ok(RawFetchResult {
                        dataset_id: d.id.clone(),
                        body,
                        fetched_at: Utc::now(),
                        status: Some(status),
                        attempts: attempt,
                    });
                }
                Err(AttemptError::Timeout) => DatasetError::FetchTimeout {
                    timeout: self.timeout,
                }
                .to_string(),
                Err(AttemptError::Transient(reason)) => reason,
                Err(AttemptError::Fatal(reason)) => {
                    counter!("ingest_fetch_errors_total").increment(1);
                    tracing::warn!(target: "fetch", dataset = %d.id, attempt, %reason, "fetch failed, not retrying");
                    return Err(DatasetError::FetchUnavailable {
                        attempts: attempt,
                        reason,
                    });
                }
            };
            counter!("ingest_fetch_errors_total").increment(1);

            if attempt < max {
                let delay = self.retry.delay_for_attempt(attempt);
                tracing::warn!(
                    target: "fetch",
                    dataset = %d.id,
                    attempt,
                    %reason,
                    delay_ms = delay.as_millis() as u64,
                    "fetch attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            last_reason = reason;
        }
        tracing::warn!(target: "fetch", dataset = %d.id, attempts = max, reason = %last_reason, "retries exhausted");
        Err(DatasetError::FetchUnavailable {
            attempts: max,
            reason: last_reason,
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn missing_local_file_is_unavailable() {
        let url = Url::parse("file:///definitely/not/here.csv").unwrap();
        let err = read_file_source(&url).await.unwrap_err();
        assert!(matches!(err, DatasetError::FetchUnavailable { attempts: 1, .. }));
    }
}
