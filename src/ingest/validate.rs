// src/ingest/validate.rs
//! Schema validator: raw upstream text → typed rows, all-or-nothing.
//!
//! Any malformed cell, wrong column count or duplicate natural key rejects the whole
//! payload with [`DatasetError::SchemaMismatch`]; nothing partial ever reaches the writer.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use metrics::counter;

use crate::catalog::{ColumnSpec, DatasetDescriptor, InputFormat, SemanticType};
use crate::error::DatasetError;
use crate::ingest::types::RawFetchResult;

/// Canonical on-disk timestamp layout (UTC).
/// Whole seconds render without a fraction; sub-second values keep 3, 6 or 9 digits.
pub const CANONICAL_TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";
pub const CANONICAL_DATE_FORMAT: &str = "%Y-%m-%d";

const NAIVE_TS_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Integer(i64),
    Decimal(f64),
    Text(String),
    Boolean(bool),
}

impl Cell {
    /// Canonical text form written to data files.
    pub fn render(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Timestamp(ts) => ts.format(CANONICAL_TS_FORMAT).to_string(),
            Cell::Date(d) => d.format(CANONICAL_DATE_FORMAT).to_string(),
            Cell::Integer(i) => i.to_string(),
            // -0.0 would otherwise render as "-0"
            Cell::Decimal(v) if *v == 0.0 => "0".to_string(),
            Cell::Decimal(v) => v.to_string(),
            Cell::Text(s) => s.clone(),
            Cell::Boolean(b) => b.to_string(),
        }
    }

    fn as_key(&self) -> Option<NaturalKey> {
        match self {
            Cell::Timestamp(t) => Some(NaturalKey::Timestamp(*t)),
            Cell::Date(d) => Some(NaturalKey::Date(*d)),
            Cell::Integer(i) => Some(NaturalKey::Integer(*i)),
            // Stored files cannot tell an empty key from a missing one.
            Cell::Text(s) if !s.is_empty() => Some(NaturalKey::Text(s.clone())),
            _ => None,
        }
    }
}

/// Totally ordered natural key value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NaturalKey {
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Integer(i64),
    Text(String),
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NaturalKey::Timestamp(t) => write!(f, "{}", t.format(CANONICAL_TS_FORMAT)),
            NaturalKey::Date(d) => write!(f, "{}", d.format(CANONICAL_DATE_FORMAT)),
            NaturalKey::Integer(i) => write!(f, "{i}"),
            NaturalKey::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRow {
    pub key: NaturalKey,
    pub cells: Vec<Cell>,
}

impl ValidatedRow {
    pub fn render(&self) -> Vec<String> {
        self.cells.iter().map(Cell::render).collect()
    }
}

/// Rows in upstream order; reordering is the writer's job.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRecord {
    pub dataset_id: String,
    pub rows: Vec<ValidatedRow>,
}

pub fn validate(
    raw: &RawFetchResult,
    descriptor: &DatasetDescriptor,
) -> Result<ValidatedRecord, DatasetError> {
    let rows = validate_text(&raw.body, descriptor)?;
    counter!("ingest_rows_validated_total").increment(rows.len() as u64);
    tracing::debug!(
        target: "ingest",
        dataset = %descriptor.id,
        rows = rows.len(),
        fetched_at = %raw.fetched_at.format(CANONICAL_TS_FORMAT),
        status = ?raw.status,
        attempts = raw.attempts,
        "validated"
    );
    Ok(ValidatedRecord {
        dataset_id: descriptor.id.clone(),
        rows,
    })
}

/// Parse and type-check `text` against the descriptor's schema and input format.
pub fn validate_text(
    text: &str,
    descriptor: &DatasetDescriptor,
) -> Result<Vec<ValidatedRow>, DatasetError> {
    let fmt = &descriptor.format;
    let schema = &descriptor.schema;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(fmt.delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut records = reader.records();

    if fmt.has_header {
        match records.next() {
            Some(Ok(h)) => check_header(&h, schema)?,
            Some(Err(e)) => return Err(DatasetError::mismatch(0, format!("unreadable header: {e}"))),
            None => return Err(DatasetError::mismatch(0, "empty payload, header row expected")),
        }
    }

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for (idx, rec) in records.enumerate() {
        let row = idx + 1;
        let rec = rec.map_err(|e| DatasetError::mismatch(row, format!("unreadable row: {e}")))?;
        if rec.len() != schema.len() {
            return Err(DatasetError::mismatch(
                row,
                format!("expected {} columns, found {}", schema.len(), rec.len()),
            ));
        }

        let mut cells = Vec::with_capacity(schema.len());
        for (col, raw) in schema.iter().zip(rec.iter()) {
            let cell = coerce_cell(raw, col, fmt)
                .map_err(|reason| DatasetError::mismatch(row, format!("column `{}`: {reason}", col.name)))?;
            cells.push(cell);
        }

        let key = cells[descriptor.natural_key].as_key().ok_or_else(|| {
            DatasetError::mismatch(
                row,
                format!("natural key `{}` is empty", descriptor.key_column().name),
            )
        })?;
        if !seen.insert(key.clone()) {
            return Err(DatasetError::mismatch(
                row,
                format!("duplicate natural key {key}"),
            ));
        }
        out.push(ValidatedRow { key, cells });
    }
    Ok(out)
}

fn check_header(header: &csv::StringRecord, schema: &[ColumnSpec]) -> Result<(), DatasetError> {
    if header.len() != schema.len() {
        return Err(DatasetError::mismatch(
            0,
            format!(
                "header has {} columns, schema declares {}",
                header.len(),
                schema.len()
            ),
        ));
    }
    for (i, (got, col)) in header.iter().zip(schema).enumerate() {
        if !got.eq_ignore_ascii_case(col.upstream_name()) {
            return Err(DatasetError::mismatch(
                0,
                format!(
                    "header column {} is `{got}`, expected `{}`",
                    i + 1,
                    col.upstream_name()
                ),
            ));
        }
    }
    Ok(())
}

/// Coerce one raw cell to the column's semantic type, enforcing nullability and bounds.
pub fn coerce_cell(raw: &str, col: &ColumnSpec, fmt: &InputFormat) -> Result<Cell, String> {
    if fmt.null_values.iter().any(|n| n == raw) {
        return if col.nullable {
            Ok(Cell::Null)
        } else {
            Err(format!("missing value `{raw}` in non-nullable column"))
        };
    }

    let cell = match col.kind {
        SemanticType::Timestamp => Cell::Timestamp(parse_timestamp(raw, col.format.as_deref())?),
        SemanticType::Date => Cell::Date(parse_date(raw, col.format.as_deref())?),
        SemanticType::Integer => {
            let s = strip_thousands(raw, fmt);
            Cell::Integer(
                s.parse::<i64>()
                    .map_err(|_| format!("not an integer: {raw:?}"))?,
            )
        }
        SemanticType::Decimal => Cell::Decimal(parse_decimal(raw, fmt)?),
        SemanticType::Text => Cell::Text(raw.to_string()),
        SemanticType::Boolean => Cell::Boolean(parse_bool(raw)?),
    };

    let numeric = match &cell {
        Cell::Integer(i) => Some(*i as f64),
        Cell::Decimal(v) => Some(*v),
        _ => None,
    };
    if let Some(v) = numeric {
        if let Some(lo) = col.min {
            if v < lo {
                return Err(format!("{v} below minimum {lo}"));
            }
        }
        if let Some(hi) = col.max {
            if v > hi {
                return Err(format!("{v} above maximum {hi}"));
            }
        }
    }
    Ok(cell)
}

fn strip_thousands(raw: &str, fmt: &InputFormat) -> String {
    match fmt.thousands_separator {
        Some(t) => raw.chars().filter(|c| *c != t).collect(),
        None => raw.to_string(),
    }
}

fn parse_decimal(raw: &str, fmt: &InputFormat) -> Result<f64, String> {
    let mut s = strip_thousands(raw, fmt);
    if fmt.decimal_separator == ',' {
        if s.contains('.') {
            return Err(format!("not a decimal: {raw:?}"));
        }
        s = s.replace(',', ".");
    }
    let v: f64 = s.parse().map_err(|_| format!("not a decimal: {raw:?}"))?;
    if !v.is_finite() {
        return Err(format!("non-finite decimal: {raw:?}"));
    }
    Ok(v)
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(format!("not a boolean: {raw:?}")),
    }
}

/// Offsets are folded into UTC; naive values are taken as UTC.
pub fn parse_timestamp(raw: &str, format: Option<&str>) -> Result<NaiveDateTime, String> {
    if let Some(f) = format {
        if f.contains("%z") || f.contains("%:z") {
            return DateTime::parse_from_str(raw, f)
                .map(|dt| dt.with_timezone(&Utc).naive_utc())
                .map_err(|e| format!("timestamp {raw:?} does not match `{f}`: {e}"));
        }
        return NaiveDateTime::parse_from_str(raw, f)
            .map_err(|e| format!("timestamp {raw:?} does not match `{f}`: {e}"));
    }

    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        let n: i64 = raw.parse().map_err(|_| format!("epoch out of range: {raw:?}"))?;
        // 13 digits and up are epoch milliseconds (SMARD chart data).
        let dt = if raw.len() >= 13 {
            DateTime::<Utc>::from_timestamp_millis(n)
        } else {
            DateTime::<Utc>::from_timestamp(n, 0)
        };
        return dt
            .map(|d| d.naive_utc())
            .ok_or_else(|| format!("epoch out of range: {raw:?}"));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc).naive_utc());
    }
    for f in NAIVE_TS_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, f) {
            return Ok(ts);
        }
    }
    Err(format!("not a timestamp: {raw:?}"))
}

pub fn parse_date(raw: &str, format: Option<&str>) -> Result<NaiveDate, String> {
    let f = format.unwrap_or(CANONICAL_DATE_FORMAT);
    NaiveDate::parse_from_str(raw, f).map_err(|e| format!("date {raw:?} does not match `{f}`: {e}"))
}
