//! On-disk codec for per-symbol cache files.
//!
//! Layout:
//!
//! ```text
//! # {
//! #   "schema_version": "2.0.0",
//! #   ...
//! # }
//! date,open,high,low,close,volume
//! 2024-01-02,100.0,102.0,99.0,101.0,1000
//! ```
//!
//! Leading `#` lines carry the JSON metadata block. Everything after them is
//! a CSV body with a fixed column order. Writes go to a `.tmp` sibling and are
//! renamed into place so a crash never leaves a half-written file.

use super::schema::{SchemaError, SchemaMetadata, BODY_COLUMNS};
use crate::domain::{Bar, BarSeries};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Parsed leading comment block of a cache file.
#[derive(Debug)]
pub enum Header {
    /// No comment block, or one that does not carry a schema version.
    Unversioned,
    /// A metadata block with a version string. `metadata` is `Err` when the
    /// rest of the block does not deserialize.
    Versioned {
        version: String,
        metadata: Result<SchemaMetadata, String>,
    },
}

impl Header {
    pub fn version(&self) -> Option<&str> {
        match self {
            Header::Unversioned => None,
            Header::Versioned { version, .. } => Some(version),
        }
    }

    pub fn metadata(&self) -> Option<&SchemaMetadata> {
        match self {
            Header::Versioned {
                metadata: Ok(meta), ..
            } => Some(meta),
            _ => None,
        }
    }
}

/// A cache file split into its header and the text after the comment block.
#[derive(Debug)]
pub struct RawCacheFile {
    pub header: Header,
    pub body: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BodyRow {
    date: NaiveDate,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
}

impl From<&Bar> for BodyRow {
    fn from(bar: &Bar) -> Self {
        Self {
            date: bar.date,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }
}

impl From<BodyRow> for Bar {
    fn from(row: BodyRow) -> Self {
        Bar {
            date: row.date,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        }
    }
}

/// Read a cache file and split off its comment block.
pub fn read_cache_file(path: &Path) -> Result<RawCacheFile, SchemaError> {
    let text = fs::read_to_string(path).map_err(|e| SchemaError::io(path, e))?;
    Ok(split_header(&text))
}

/// Split file text into header and body.
pub fn split_header(text: &str) -> RawCacheFile {
    let mut comment = String::new();
    let mut body_start = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix('#') {
            comment.push_str(rest.strip_prefix(' ').unwrap_or(rest));
            body_start += line.len();
        } else if trimmed.trim().is_empty() && body_start == 0 {
            body_start += line.len();
        } else {
            break;
        }
    }

    RawCacheFile {
        header: parse_header(&comment),
        body: text[body_start..].to_string(),
    }
}

fn parse_header(comment: &str) -> Header {
    let value: serde_json::Value = match serde_json::from_str(comment) {
        Ok(v) => v,
        Err(_) => return Header::Unversioned,
    };
    let version = match value.get("schema_version").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return Header::Unversioned,
    };
    let metadata = serde_json::from_value::<SchemaMetadata>(value).map_err(|e| e.to_string());
    Header::Versioned { version, metadata }
}

/// Parse a standardized body. Column order and types are strict and dates
/// must be strictly ascending.
pub fn parse_body(body: &str) -> Result<BarSeries, SchemaError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(body.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| SchemaError::Parse {
            line: 0,
            message: e.to_string(),
        })?
        .clone();
    let actual: Vec<&str> = headers.iter().collect();
    if actual != BODY_COLUMNS {
        for expected in BODY_COLUMNS {
            if !actual.contains(&expected) {
                return Err(SchemaError::MissingColumn(expected.to_string()));
            }
        }
        return Err(SchemaError::UnexpectedColumns {
            expected: BODY_COLUMNS.join(","),
            actual: actual.join(","),
        });
    }

    let mut bars = Vec::new();
    for (i, row) in reader.deserialize::<BodyRow>().enumerate() {
        let row = row.map_err(|e| SchemaError::Parse {
            line: i + 2,
            message: e.to_string(),
        })?;
        bars.push(Bar::from(row));
    }

    BarSeries::from_sorted(bars).ok_or(SchemaError::Unsorted)
}

/// Render the metadata block and body of a cache file.
pub fn render_cache_file(meta: &SchemaMetadata, series: &BarSeries) -> Result<String, SchemaError> {
    let json = serde_json::to_string_pretty(meta)
        .map_err(|e| SchemaError::Metadata(format!("serialize: {e}")))?;

    let mut out = String::new();
    for line in json.lines() {
        out.push_str("# ");
        out.push_str(line);
        out.push('\n');
    }

    let mut writer = csv::WriterBuilder::new()
        .has_headers(true)
        .from_writer(Vec::new());
    if series.is_empty() {
        writer
            .write_record(BODY_COLUMNS)
            .map_err(|e| SchemaError::Metadata(format!("write header: {e}")))?;
    }
    for bar in series.bars() {
        writer
            .serialize(BodyRow::from(bar))
            .map_err(|e| SchemaError::Metadata(format!("write row: {e}")))?;
    }
    let body = writer
        .into_inner()
        .map_err(|e| SchemaError::Metadata(format!("flush body: {e}")))?;
    out.push_str(
        &String::from_utf8(body).map_err(|e| SchemaError::Metadata(format!("utf8 body: {e}")))?,
    );
    Ok(out)
}

/// Atomically write a cache file: write to `.tmp`, then rename into place.
pub fn write_cache_file(
    path: &Path,
    meta: &SchemaMetadata,
    series: &BarSeries,
) -> Result<(), SchemaError> {
    let contents = render_cache_file(meta, series)?;
    atomic_write(path, contents.as_bytes())
}

pub(crate) fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), SchemaError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SchemaError::io(parent, e))?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);

    fs::write(&tmp_path, contents).map_err(|e| SchemaError::io(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        SchemaError::io(path, e)
    })
}
