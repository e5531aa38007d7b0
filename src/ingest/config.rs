// src/ingest/config.rs
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::retry::RetryPolicy;

pub const ENV_CONFIG_PATH: &str = "INGEST_CONFIG_PATH";
pub const ENV_TIMEOUT_SECS: &str = "INGEST_TIMEOUT_SECS";
pub const ENV_RUN_TIMEOUT_SECS: &str = "INGEST_RUN_TIMEOUT_SECS";
pub const ENV_CONCURRENCY: &str = "INGEST_CONCURRENCY";
pub const ENV_OVERWRITE: &str = "INGEST_OVERWRITE";

pub const DEFAULT_CONFIG_PATH: &str = "config/ingest.toml";

/// Runtime settings for one ingest run.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    /// Deadline for a single fetch attempt.
    pub timeout: Duration,
    /// Deadline for all fetches of a run; `None` means unbounded.
    pub run_timeout: Option<Duration>,
    pub concurrency: usize,
    /// Replace rows whose natural key already exists instead of keeping the first write.
    pub overwrite: bool,
    pub retry: RetryPolicy,
    pub user_agent: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            run_timeout: Some(Duration::from_secs(600)),
            concurrency: 4,
            overwrite: false,
            retry: RetryPolicy::default(),
            user_agent: concat!("dataset-ingest/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// File shape: every key optional, missing keys keep defaults.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    timeout_secs: Option<u64>,
    run_timeout_secs: Option<u64>,
    concurrency: Option<usize>,
    overwrite: Option<bool>,
    retry_attempts: Option<u32>,
    retry_base_ms: Option<u64>,
    retry_max_ms: Option<u64>,
    user_agent: Option<String>,
}

impl FileConfig {
    fn apply(self, cfg: &mut IngestConfig) {
        if let Some(v) = self.timeout_secs {
            cfg.timeout = Duration::from_secs(v.max(1));
        }
        if let Some(v) = self.run_timeout_secs {
            cfg.run_timeout = (v > 0).then(|| Duration::from_secs(v));
        }
        if let Some(v) = self.concurrency {
            cfg.concurrency = v.max(1);
        }
        if let Some(v) = self.overwrite {
            cfg.overwrite = v;
        }
        if let Some(v) = self.retry_attempts {
            cfg.retry.max_attempts = v.max(1);
        }
        if let Some(v) = self.retry_base_ms {
            cfg.retry.base_backoff = Duration::from_millis(v);
        }
        if let Some(v) = self.retry_max_ms {
            cfg.retry.max_backoff = Duration::from_millis(v);
        }
        if let Some(v) = self.user_agent.filter(|s| !s.trim().is_empty()) {
            cfg.user_agent = v;
        }
    }
}

/// Load config from an explicit path. Supports TOML or JSON formats.
pub fn load_config_from(path: &Path) -> Result<IngestConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading ingest config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let file = parse_config(&content, ext.as_str())
        .with_context(|| format!("parsing ingest config {}", path.display()))?;
    let mut cfg = IngestConfig::default();
    file.apply(&mut cfg);
    Ok(cfg)
}

/// Load config using env var + fallbacks, then apply env overrides:
/// 1) $INGEST_CONFIG_PATH
/// 2) config/ingest.toml
/// 3) built-in defaults
pub fn load_config_default() -> Result<IngestConfig> {
    let mut cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if !pb.exists() {
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        load_config_from(&pb)?
    } else {
        let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_p.exists() {
            load_config_from(&default_p)?
        } else {
            IngestConfig::default()
        }
    };
    apply_env_overrides(&mut cfg)?;
    Ok(cfg)
}

/// Environment wins over the config file. Malformed values are an error, not ignored.
pub fn apply_env_overrides(cfg: &mut IngestConfig) -> Result<()> {
    if let Some(v) = env_parse::<u64>(ENV_TIMEOUT_SECS)? {
        cfg.timeout = Duration::from_secs(v.max(1));
    }
    if let Some(v) = env_parse::<u64>(ENV_RUN_TIMEOUT_SECS)? {
        cfg.run_timeout = (v > 0).then(|| Duration::from_secs(v));
    }
    if let Some(v) = env_parse::<usize>(ENV_CONCURRENCY)? {
        cfg.concurrency = v.max(1);
    }
    if let Ok(v) = std::env::var(ENV_OVERWRITE) {
        cfg.overwrite = parse_flag(&v)
            .ok_or_else(|| anyhow!("{ENV_OVERWRITE} must be a boolean, got `{v}`"))?;
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("{name} must be a non-negative integer, got `{raw}`")),
        Err(_) => Ok(None),
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn parse_config(s: &str, hint_ext: &str) -> Result<FileConfig> {
    if hint_ext == "json" {
        return serde_json::from_str(s).context("invalid JSON ingest config");
    }
    match toml::from_str::<FileConfig>(s) {
        Ok(v) => Ok(v),
        // Fallback: also try JSON if the extension lied
        Err(toml_err) => serde_json::from_str(s).map_err(|_| anyhow!(toml_err)),
    }
}
