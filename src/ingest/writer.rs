// src/ingest/writer.rs
//! Idempotent writer: merges validated rows into the target CSV by natural key.
//!
//! - First write wins unless [`MergePolicy::Overwrite`] is configured.
//! - Output is always in ascending key order; historical rows keep their cell text.
//! - Identical input yields identical bytes, and an unchanged file is not rewritten.
//! - Writes go to a temp file in the target directory and are renamed into place.
//! - Each target is serialized by an in-process mutex plus a `<file>.lock` marker
//!   that excludes concurrent runs; both are released on every exit path.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use metrics::counter;
use serde::Serialize;

use crate::catalog::{Cadence, DatasetDescriptor, SemanticType};
use crate::error::DatasetError;
use crate::ingest::validate::{parse_date, parse_timestamp, NaturalKey, ValidatedRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    #[default]
    FirstWriteWins,
    Overwrite,
}

impl MergePolicy {
    pub fn from_overwrite(overwrite: bool) -> Self {
        if overwrite {
            Self::Overwrite
        } else {
            Self::FirstWriteWins
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub status: WriteStatus,
    pub rows_total: usize,
    pub rows_added: usize,
    pub rows_replaced: usize,
}

/// Registry of per-path async mutexes shared by all dataset tasks of a run.
#[derive(Debug, Default)]
pub struct FileLocks {
    inner: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(path.to_path_buf()).or_default().clone()
    }
}

/// Marker file held for the duration of one merge; removed on drop.
#[derive(Debug)]
pub struct LockFileGuard {
    path: PathBuf,
}

impl Drop for LockFileGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut s = target.as_os_str().to_os_string();
    s.push(".lock");
    PathBuf::from(s)
}

pub fn sidecar_path_for(target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{stem}.meta.json"))
}

/// Exclusive create of `<target>.lock`. An existing marker means another writer.
pub fn acquire_lock_file(target: &Path) -> Result<LockFileGuard, DatasetError> {
    let path = lock_path_for(target);
    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut f) => {
            let _ = writeln!(f, "{}", std::process::id());
            Ok(LockFileGuard { path })
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(DatasetError::WriteConflict {
            path: target.to_path_buf(),
            reason: format!(
                "lock {} is held by another writer (remove it if no ingest is running)",
                path.display()
            ),
        }),
        Err(e) => Err(DatasetError::io(path, e)),
    }
}

/// Write `path` atomically: `fill` streams into a temp file in the same directory,
/// which is fsynced and renamed over `path`. If `fill` fails the temp file is dropped
/// and `path` is untouched.
pub fn atomic_write_with<F>(path: &Path, fill: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".ingest-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    fill(tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    atomic_write_with(path, |f| f.write_all(bytes))
}

/// Serialize on the target (in-process, then cross-process) and merge on a blocking thread.
pub async fn write_merged(
    locks: &FileLocks,
    descriptor: &DatasetDescriptor,
    record: ValidatedRecord,
    policy: MergePolicy,
) -> Result<WriteOutcome, DatasetError> {
    let handle = locks.handle(&descriptor.target);
    let _guard = handle.lock().await;
    let d = descriptor.clone();
    let target = d.target.clone();
    tokio::task::spawn_blocking(move || merge_and_write(&d, record, policy))
        .await
        .map_err(|e| DatasetError::io(target, io::Error::other(e.to_string())))?
}

/// Blocking merge. Takes the lock file itself; callers only add in-process ordering.
pub fn merge_and_write(
    d: &DatasetDescriptor,
    record: ValidatedRecord,
    policy: MergePolicy,
) -> Result<WriteOutcome, DatasetError> {
    if let Some(parent) = d.target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| DatasetError::io(parent, e))?;
    }
    let _lock = acquire_lock_file(&d.target)?;

    let existing_bytes = match fs::read(&d.target) {
        Ok(b) => Some(b),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(DatasetError::io(&d.target, e)),
    };
    let mut rows = match &existing_bytes {
        Some(b) => read_existing(d, b)?,
        None => BTreeMap::new(),
    };

    let mut added = 0usize;
    let mut replaced = 0usize;
    for row in record.rows {
        let rendered = row.render();
        match rows.get_mut(&row.key) {
            Some(current) => {
                if policy == MergePolicy::Overwrite && *current != rendered {
                    *current = rendered;
                    replaced += 1;
                }
            }
            None => {
                rows.insert(row.key, rendered);
                added += 1;
            }
        }
    }

    let bytes = render_file(d, &rows).map_err(|e| DatasetError::io(&d.target, e))?;
    let rows_total = rows.len();

    let status = if existing_bytes.as_deref() == Some(bytes.as_slice()) {
        WriteStatus::Unchanged
    } else {
        atomic_write(&d.target, &bytes).map_err(|e| DatasetError::io(&d.target, e))?;
        counter!("ingest_rows_written_total").increment((added + replaced) as u64);
        WriteStatus::Written
    };

    write_sidecar(d, rows_total, rows.keys().next_back(), &bytes)?;

    tracing::debug!(
        target: "writer",
        dataset = %d.id,
        path = %d.target.display(),
        added,
        replaced,
        total = rows_total,
        unchanged = status == WriteStatus::Unchanged,
        "merge complete"
    );

    Ok(WriteOutcome {
        status,
        rows_total,
        rows_added: added,
        rows_replaced: replaced,
    })
}

fn data_file_err(d: &DatasetDescriptor, reason: impl Into<String>) -> DatasetError {
    DatasetError::DataFile {
        path: d.target.clone(),
        reason: reason.into(),
    }
}

/// Parse the existing file: header must match the schema, keys strictly ascending.
fn read_existing(
    d: &DatasetDescriptor,
    bytes: &[u8],
) -> Result<BTreeMap<NaturalKey, Vec<String>>, DatasetError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut records = reader.records();
    let mut out = BTreeMap::new();

    let header = match records.next() {
        Some(h) => h.map_err(|e| data_file_err(d, format!("unreadable header: {e}")))?,
        // Empty file: treat as new
        None => return Ok(out),
    };
    let expected = d.header();
    if header.iter().collect::<Vec<_>>() != expected {
        return Err(data_file_err(
            d,
            format!(
                "header `{}` does not match schema `{}`",
                header.iter().collect::<Vec<_>>().join(","),
                expected.join(",")
            ),
        ));
    }

    let key_col = d.key_column();
    let mut prev: Option<NaturalKey> = None;
    for (idx, rec) in records.enumerate() {
        let line = idx + 2;
        let rec = rec.map_err(|e| data_file_err(d, format!("line {line}: {e}")))?;
        if rec.len() != expected.len() {
            return Err(data_file_err(
                d,
                format!("line {line}: expected {} columns, found {}", expected.len(), rec.len()),
            ));
        }
        let raw_key = &rec[d.natural_key];
        let key = parse_stored_key(raw_key, key_col.kind)
            .map_err(|reason| data_file_err(d, format!("line {line}: {reason}")))?;
        if let Some(p) = &prev {
            if key <= *p {
                return Err(data_file_err(
                    d,
                    format!("line {line}: key {key} is not greater than previous key {p}"),
                ));
            }
        }
        prev = Some(key.clone());
        out.insert(key, rec.iter().map(str::to_string).collect());
    }
    Ok(out)
}

fn parse_stored_key(raw: &str, kind: SemanticType) -> Result<NaturalKey, String> {
    match kind {
        SemanticType::Timestamp => parse_timestamp(raw, None).map(NaturalKey::Timestamp),
        SemanticType::Date => parse_date(raw, None).map(NaturalKey::Date),
        SemanticType::Integer => raw
            .parse::<i64>()
            .map(NaturalKey::Integer)
            .map_err(|_| format!("not an integer key: {raw:?}")),
        SemanticType::Text if !raw.is_empty() => Ok(NaturalKey::Text(raw.to_string())),
        other => Err(format!("cannot read {other} key {raw:?}")),
    }
}

fn render_file(
    d: &DatasetDescriptor,
    rows: &BTreeMap<NaturalKey, Vec<String>>,
) -> io::Result<Vec<u8>> {
    let mut w = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    w.write_record(d.header())?;
    for cells in rows.values() {
        w.write_record(cells)?;
    }
    w.into_inner().map_err(|e| e.into_error())
}

// --- metadata sidecar ---

#[derive(Debug, Serialize)]
struct Sidecar<'a> {
    title: &'a str,
    description: &'a str,
    source: SidecarSource<'a>,
    tags: &'a [String],
    license: &'a str,
    dataset_id: &'a str,
    cadence: Cadence,
    natural_key: &'a str,
    columns: Vec<SidecarColumn<'a>>,
    row_count: usize,
    data_as_of: Option<String>,
    sha256: String,
}

#[derive(Debug, Serialize)]
struct SidecarSource<'a> {
    name: &'a str,
    url: &'a str,
    import_type: &'static str,
}

#[derive(Debug, Serialize)]
struct SidecarColumn<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: SemanticType,
    unit: Option<&'a str>,
}

/// Hex SHA-256 of the rendered data file.
pub fn content_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Keys the writer recomputes on every write. Other keys in an existing sidecar
/// (hand-written `created_at`, edited descriptions) are left as found.
const SIDECAR_OWNED_KEYS: &[&str] = &[
    "dataset_id",
    "cadence",
    "natural_key",
    "columns",
    "row_count",
    "data_as_of",
    "sha256",
];

/// `<stem>.meta.json` next to the data file, merged into any existing one; rewritten only on change.
fn write_sidecar(
    d: &DatasetDescriptor,
    row_count: usize,
    last_key: Option<&NaturalKey>,
    data: &[u8],
) -> Result<(), DatasetError> {
    let sidecar = Sidecar {
        title: &d.name,
        description: d.description.as_deref().unwrap_or_default(),
        source: SidecarSource {
            name: d.source.name.as_deref().unwrap_or("Unknown"),
            url: d.source.url.as_str(),
            import_type: "csv",
        },
        tags: &d.tags,
        license: d.license.as_deref().unwrap_or("Unknown"),
        dataset_id: &d.id,
        cadence: d.cadence,
        natural_key: &d.key_column().name,
        columns: d
            .schema
            .iter()
            .map(|c| SidecarColumn {
                name: &c.name,
                kind: c.kind,
                unit: c.unit.as_deref(),
            })
            .collect(),
        row_count,
        data_as_of: last_key.map(ToString::to_string),
        sha256: content_hash(data),
    };
    let path = sidecar_path_for(&d.target);
    let serde_json::Value::Object(fresh) = serde_json::to_value(&sidecar)
        .map_err(|e| DatasetError::io(&path, io::Error::other(e)))?
    else {
        return Err(DatasetError::io(&path, io::Error::other("sidecar is not a JSON object")));
    };

    let existing = fs::read(&path).ok();
    let parsed = existing
        .as_deref()
        .map(serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>);
    let mut merged = match parsed {
        None => serde_json::Map::new(),
        Some(Ok(m)) => m,
        Some(Err(e)) => {
            tracing::warn!(target: "writer", path = %path.display(), error = %e, "unreadable sidecar replaced");
            serde_json::Map::new()
        }
    };
    for (key, value) in fresh {
        if SIDECAR_OWNED_KEYS.contains(&key.as_str()) {
            merged.insert(key, value);
        } else {
            merged.entry(key).or_insert(value);
        }
    }

    let mut bytes = serde_json::to_vec_pretty(&merged)
        .map_err(|e| DatasetError::io(&path, io::Error::other(e)))?;
    bytes.push(b'\n');

    if existing.as_deref() == Some(bytes.as_slice()) {
        return Ok(());
    }
    atomic_write(&path, &bytes).map_err(|e| DatasetError::io(&path, e))
}
