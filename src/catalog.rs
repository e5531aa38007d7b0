// src/catalog.rs
//! Catalog loader: turns the catalog document (YAML or JSON) into validated
//! [`DatasetDescriptor`]s.
//!
//! Structural problems (bad YAML/JSON, wrong value types) are [`CatalogError::Parse`].
//! Semantic problems (missing required field, colliding id or target, unusable schema)
//! are [`CatalogError::Schema`]. Both abort the run before any fetch starts.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// Semantic type of one column. Drives coercion in the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Timestamp,
    Date,
    Integer,
    Decimal,
    Text,
    Boolean,
}

impl SemanticType {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "timestamp" | "datetime" => Some(Self::Timestamp),
            "date" => Some(Self::Date),
            "integer" | "int" => Some(Self::Integer),
            "decimal" | "float" | "number" => Some(Self::Decimal),
            "text" | "string" => Some(Self::Text),
            "boolean" | "bool" => Some(Self::Boolean),
            _ => None,
        }
    }

    /// Types with a total order usable as a natural key.
    pub fn is_orderable(self) -> bool {
        matches!(
            self,
            Self::Timestamp | Self::Date | Self::Integer | Self::Text
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::Date => "date",
            Self::Integer => "integer",
            Self::Decimal => "decimal",
            Self::Text => "text",
            Self::Boolean => "boolean",
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared update cadence. `Manual` datasets are only fetched when selected by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Manual,
}

impl Cadence {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "yearly" | "annual" => Some(Self::Yearly),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: SemanticType,
    pub unit: Option<String>,
    /// Upstream header name when it differs from `name`.
    pub source: Option<String>,
    /// chrono format string for `timestamp`/`date` columns.
    pub format: Option<String>,
    pub nullable: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ColumnSpec {
    /// Header name expected in the upstream payload.
    pub fn upstream_name(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }
}

/// How the upstream payload is laid out.
#[derive(Debug, Clone, PartialEq)]
pub struct InputFormat {
    pub delimiter: u8,
    pub decimal_separator: char,
    pub thousands_separator: Option<char>,
    pub null_values: Vec<String>,
    pub has_header: bool,
}

impl Default for InputFormat {
    fn default() -> Self {
        Self {
            delimiter: b',',
            decimal_separator: '.',
            thousands_separator: None,
            null_values: vec![String::new()],
            has_header: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    pub name: Option<String>,
    pub url: Url,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetDescriptor {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub source: SourceSpec,
    pub cadence: Cadence,
    /// Resolved against the catalog file's directory.
    pub target: PathBuf,
    pub schema: Vec<ColumnSpec>,
    /// Index into `schema`.
    pub natural_key: usize,
    pub format: InputFormat,
    pub tags: Vec<String>,
    pub license: Option<String>,
}

impl DatasetDescriptor {
    pub fn key_column(&self) -> &ColumnSpec {
        &self.schema[self.natural_key]
    }

    /// Column names as written to the data file header.
    pub fn header(&self) -> Vec<&str> {
        self.schema.iter().map(|c| c.name.as_str()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    pub path: PathBuf,
    pub datasets: Vec<DatasetDescriptor>,
}

impl Catalog {
    pub fn get(&self, id: &str) -> Option<&DatasetDescriptor> {
        self.datasets.iter().find(|d| d.id == id)
    }

    /// Datasets selected by an optional id filter. Unknown ids are a schema error.
    pub fn select(&self, only: &[String]) -> Result<Vec<DatasetDescriptor>, CatalogError> {
        if only.is_empty() {
            return Ok(self.datasets.clone());
        }
        let mut out = Vec::with_capacity(only.len());
        for id in only {
            let d = self
                .get(id)
                .ok_or_else(|| CatalogError::schema(id.clone(), "no such dataset in catalog"))?;
            if !out.iter().any(|x: &DatasetDescriptor| x.id == d.id) {
                out.push(d.clone());
            }
        }
        Ok(out)
    }
}

/// Load and validate a catalog file. Format is picked from the extension.
pub fn load_catalog(path: &Path) -> Result<Catalog, CatalogError> {
    let content = fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let datasets = parse_catalog(&content, &ext, base_dir, &path.display().to_string())?;
    Ok(Catalog {
        path: path.to_path_buf(),
        datasets,
    })
}

/// Parse catalog text. `hint_ext` is `json`, `yaml` or `yml`; anything else tries both.
pub fn parse_catalog(
    content: &str,
    hint_ext: &str,
    base_dir: &Path,
    label: &str,
) -> Result<Vec<DatasetDescriptor>, CatalogError> {
    let raw = parse_raw(content, hint_ext).map_err(|message| CatalogError::Parse {
        path: label.to_string(),
        message,
    })?;
    let entries = match raw {
        RawCatalog::Wrapped { datasets } => datasets,
        RawCatalog::Bare(v) => v,
    };
    validate_entries(entries, base_dir)
}

fn parse_raw(content: &str, hint_ext: &str) -> Result<RawCatalog, String> {
    match hint_ext {
        "json" => serde_json::from_str(content).map_err(|e| e.to_string()),
        "yaml" | "yml" => serde_yaml::from_str(content).map_err(|e| e.to_string()),
        _ => {
            // YAML is a superset of JSON, but serde_json gives better messages for JSON input.
            if content.trim_start().starts_with('{') {
                if let Ok(v) = serde_json::from_str(content) {
                    return Ok(v);
                }
            }
            serde_yaml::from_str(content).map_err(|e| e.to_string())
        }
    }
}

// --- raw document shape; every field optional so missing ones become schema errors ---

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCatalog {
    Wrapped { datasets: Vec<RawEntry> },
    Bare(Vec<RawEntry>),
}

#[derive(Debug, Default, Deserialize)]
struct RawEntry {
    id: Option<String>,
    name: Option<String>,
    description: Option<String>,
    source: Option<RawSource>,
    cadence: Option<String>,
    target: Option<String>,
    natural_key: Option<String>,
    #[serde(default)]
    format: RawFormat,
    schema: Option<Vec<RawColumn>>,
    #[serde(default)]
    tags: Vec<String>,
    license: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSource {
    Url(String),
    Full { name: Option<String>, url: Option<String> },
}

#[derive(Debug, Default, Deserialize)]
struct RawFormat {
    delimiter: Option<String>,
    decimal: Option<String>,
    thousands: Option<String>,
    null_values: Option<Vec<String>>,
    header: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawColumn {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    unit: Option<String>,
    source: Option<String>,
    format: Option<String>,
    #[serde(default)]
    nullable: bool,
    min: Option<f64>,
    max: Option<f64>,
}

fn validate_entries(
    entries: Vec<RawEntry>,
    base_dir: &Path,
) -> Result<Vec<DatasetDescriptor>, CatalogError> {
    let mut seen_ids = HashSet::new();
    let mut seen_targets = HashSet::new();
    let mut out = Vec::with_capacity(entries.len());

    for (idx, raw) in entries.into_iter().enumerate() {
        let d = validate_entry(idx, raw, base_dir)?;
        if !seen_ids.insert(d.id.clone()) {
            return Err(CatalogError::schema(
                d.id.clone(),
                "duplicate dataset identifier",
            ));
        }
        if !seen_targets.insert(d.target.clone()) {
            return Err(CatalogError::schema(
                d.id.clone(),
                format!(
                    "target path {} already used by another dataset",
                    d.target.display()
                ),
            ));
        }
        out.push(d);
    }
    Ok(out)
}

fn required<T>(v: Option<T>, entry: &str, field: &str) -> Result<T, CatalogError> {
    v.ok_or_else(|| CatalogError::schema(entry, format!("missing required field `{field}`")))
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn validate_entry(
    idx: usize,
    raw: RawEntry,
    base_dir: &Path,
) -> Result<DatasetDescriptor, CatalogError> {
    let id = required(non_blank(raw.id), &format!("entry #{}", idx + 1), "id")?;
    if id.chars().any(char::is_whitespace) {
        return Err(CatalogError::schema(&id, "identifier must not contain whitespace"));
    }
    let e = id.as_str();

    let name = required(non_blank(raw.name), e, "name")?;

    let (source_name, url_raw) = match required(raw.source, e, "source")? {
        RawSource::Url(u) => (None, Some(u)),
        RawSource::Full { name, url } => (non_blank(name), url),
    };
    let url_raw = required(non_blank(url_raw), e, "source.url")?;
    let url = Url::parse(&url_raw)
        .map_err(|err| CatalogError::schema(e, format!("invalid source url `{url_raw}`: {err}")))?;
    if !matches!(url.scheme(), "http" | "https" | "file") {
        return Err(CatalogError::schema(
            e,
            format!("unsupported url scheme `{}`", url.scheme()),
        ));
    }

    let cadence_raw = required(non_blank(raw.cadence), e, "cadence")?;
    let cadence = Cadence::parse(&cadence_raw)
        .ok_or_else(|| CatalogError::schema(e, format!("unknown cadence `{cadence_raw}`")))?;

    let target_raw = required(non_blank(raw.target), e, "target")?;
    let target = normalize_path(&base_dir.join(&target_raw));

    let raw_cols = required(raw.schema, e, "schema")?;
    if raw_cols.is_empty() {
        return Err(CatalogError::schema(e, "schema must declare at least one column"));
    }
    let mut schema = Vec::with_capacity(raw_cols.len());
    let mut col_names = HashSet::new();
    for (ci, c) in raw_cols.into_iter().enumerate() {
        let col_label = format!("schema[{ci}]");
        let cname = required(non_blank(c.name), e, &format!("{col_label}.name"))?;
        let kind_raw = required(non_blank(c.kind), e, &format!("{col_label}.type"))?;
        let kind = SemanticType::parse(&kind_raw).ok_or_else(|| {
            CatalogError::schema(e, format!("column `{cname}`: unknown type `{kind_raw}`"))
        })?;
        if let (Some(lo), Some(hi)) = (c.min, c.max) {
            if lo > hi {
                return Err(CatalogError::schema(
                    e,
                    format!("column `{cname}`: min {lo} greater than max {hi}"),
                ));
            }
        }
        if !col_names.insert(cname.clone()) {
            return Err(CatalogError::schema(
                e,
                format!("duplicate column name `{cname}`"),
            ));
        }
        schema.push(ColumnSpec {
            name: cname,
            kind,
            unit: non_blank(c.unit),
            source: non_blank(c.source),
            format: non_blank(c.format),
            nullable: c.nullable,
            min: c.min,
            max: c.max,
        });
    }

    let natural_key = match non_blank(raw.natural_key) {
        Some(k) => schema
            .iter()
            .position(|c| c.name == k)
            .ok_or_else(|| CatalogError::schema(e, format!("natural key `{k}` is not a schema column")))?,
        None => 0,
    };
    let key = &schema[natural_key];
    if !key.kind.is_orderable() {
        return Err(CatalogError::schema(
            e,
            format!("natural key `{}` has unordered type {}", key.name, key.kind),
        ));
    }
    if key.nullable {
        return Err(CatalogError::schema(
            e,
            format!("natural key `{}` must not be nullable", key.name),
        ));
    }

    let format = validate_format(raw.format, e)?;

    Ok(DatasetDescriptor {
        id: id.clone(),
        name,
        description: non_blank(raw.description),
        source: SourceSpec {
            name: source_name,
            url,
        },
        cadence,
        target,
        schema,
        natural_key,
        format,
        tags: raw
            .tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        license: non_blank(raw.license),
    })
}

fn single_char(v: &str, entry: &str, field: &str) -> Result<char, CatalogError> {
    let mut it = v.chars();
    match (it.next(), it.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(CatalogError::schema(
            entry,
            format!("format.{field} must be a single character, got `{v}`"),
        )),
    }
}

fn validate_format(raw: RawFormat, entry: &str) -> Result<InputFormat, CatalogError> {
    let mut f = InputFormat::default();
    if let Some(d) = raw.delimiter {
        // YAML users write "\t" for tab-separated sources.
        let d = if d == "\\t" { "\t".to_string() } else { d };
        let c = single_char(&d, entry, "delimiter")?;
        if !c.is_ascii() {
            return Err(CatalogError::schema(entry, "format.delimiter must be ASCII"));
        }
        f.delimiter = c as u8;
    }
    if let Some(d) = raw.decimal {
        let c = single_char(&d, entry, "decimal")?;
        if c != '.' && c != ',' {
            return Err(CatalogError::schema(entry, "format.decimal must be `.` or `,`"));
        }
        f.decimal_separator = c;
    }
    if let Some(t) = raw.thousands {
        let c = single_char(&t, entry, "thousands")?;
        if c == f.decimal_separator {
            return Err(CatalogError::schema(
                entry,
                "format.thousands must differ from format.decimal",
            ));
        }
        f.thousands_separator = Some(c);
    }
    if f.decimal_separator == ',' && f.delimiter == b',' {
        return Err(CatalogError::schema(
            entry,
            "decimal comma requires a delimiter other than `,`",
        ));
    }
    if let Some(n) = raw.null_values {
        f.null_values = n.into_iter().map(|s| s.trim().to_string()).collect();
    }
    if let Some(h) = raw.header {
        f.has_header = h;
    }
    Ok(f)
}

/// Lexical normalization (no filesystem access): drops `.` and folds `..`.
fn normalize_path(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
