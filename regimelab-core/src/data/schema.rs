//! Schema registry for per-symbol cache files.
//!
//! Owns the versioning rules of the on-disk format: metadata creation,
//! checksum computation, validation, and migration of legacy files. It holds
//! no data; every function is pure policy over a series or a path.

use super::format::{self, Header};
use crate::domain::{Bar, BarSeries, Interval};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Version written by this build.
pub const CURRENT_SCHEMA_VERSION: &str = "2.0.0";

/// Version reported for files written before versioning existed.
pub const LEGACY_SCHEMA_VERSION: &str = "unversioned";

/// Fixed body column order. Also the header of the checksum serialization.
pub const BODY_COLUMNS: [&str; 6] = ["date", "open", "high", "low", "close", "volume"];

/// Metadata block stored at the top of every cache file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaMetadata {
    pub schema_version: String,
    pub created_at: NaiveDateTime,
    pub symbol: String,
    pub source: String,
    pub interval: String,
    pub adjusted: bool,
    pub checksum: String,
    pub record_count: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    /// Earliest date a full fetch for this series was requested from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_start: Option<NaiveDate>,
}

impl SchemaMetadata {
    /// Earliest date this series is known to represent.
    pub fn covered_from(&self) -> Option<NaiveDate> {
        match (self.coverage_start, self.first_date) {
            (Some(c), Some(f)) => Some(c.min(f)),
            (c, f) => c.or(f),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("missing required column: {0}")]
    MissingColumn(String),

    #[error("unexpected columns: expected [{expected}], got [{actual}]")]
    UnexpectedColumns { expected: String, actual: String },

    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("unrecognized schema version '{0}'")]
    InvalidVersion(String),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("checksum mismatch: metadata has {expected}, data hashes to {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("record count mismatch: metadata has {expected}, data has {actual}")]
    RecordCountMismatch { expected: usize, actual: usize },

    #[error("date bounds mismatch: metadata has {expected}, data has {actual}")]
    DateBoundsMismatch { expected: String, actual: String },

    #[error("key mismatch: file belongs to {actual}, expected {expected}")]
    KeyMismatch { expected: String, actual: String },

    #[error("dates are not strictly ascending")]
    Unsorted,

    #[error("no usable rows")]
    Empty,

    #[error("migration failed: {0}")]
    MigrationFailed(String),
}

impl SchemaError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        SchemaError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result of a successful migration.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    /// Version found in the file before migration.
    pub from_version: String,
    /// Rows in the rewritten file.
    pub record_count: usize,
    /// Backup of the original file, if one was written and retained.
    pub backup: Option<PathBuf>,
}

/// Versioning and integrity policy for cache files.
pub struct SchemaRegistry;

impl SchemaRegistry {
    /// Deterministic BLAKE3 checksum of a series.
    ///
    /// Canonical form: the body header, then one line per bar with the date as
    /// `%Y-%m-%d`, prices with six decimals, volume as an integer.
    pub fn checksum(series: &BarSeries) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(BODY_COLUMNS.join(",").as_bytes());
        hasher.update(b"\n");
        for bar in series.bars() {
            let line = format!(
                "{},{:.6},{:.6},{:.6},{:.6},{}\n",
                bar.date.format("%Y-%m-%d"),
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume
            );
            hasher.update(line.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Fresh metadata describing `series` under the current schema version.
    pub fn create_metadata(
        symbol: &str,
        series: &BarSeries,
        interval: Interval,
        source: &str,
    ) -> SchemaMetadata {
        SchemaMetadata {
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
            created_at: Utc::now().naive_utc(),
            symbol: symbol.to_string(),
            source: source.to_string(),
            interval: interval.as_str().to_string(),
            adjusted: true,
            checksum: Self::checksum(series),
            record_count: series.len(),
            first_date: series.first_date(),
            last_date: series.last_date(),
            coverage_start: None,
        }
    }

    /// Validate a series against its metadata.
    pub fn validate(series: &BarSeries, metadata: &SchemaMetadata) -> Result<(), SchemaError> {
        if !Self::is_valid_version(&metadata.schema_version) {
            return Err(SchemaError::InvalidVersion(metadata.schema_version.clone()));
        }
        if series.bars().windows(2).any(|w| w[0].date >= w[1].date) {
            return Err(SchemaError::Unsorted);
        }
        if metadata.record_count != series.len() {
            return Err(SchemaError::RecordCountMismatch {
                expected: metadata.record_count,
                actual: series.len(),
            });
        }
        let bounds = (series.first_date(), series.last_date());
        if (metadata.first_date, metadata.last_date) != bounds {
            return Err(SchemaError::DateBoundsMismatch {
                expected: format!("{:?}..{:?}", metadata.first_date, metadata.last_date),
                actual: format!("{:?}..{:?}", bounds.0, bounds.1),
            });
        }
        let actual = Self::checksum(series);
        if actual != metadata.checksum {
            return Err(SchemaError::ChecksumMismatch {
                expected: metadata.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Validate and additionally check that the file belongs to `symbol`/`interval`.
    pub fn validate_for(
        series: &BarSeries,
        metadata: &SchemaMetadata,
        symbol: &str,
        interval: Interval,
    ) -> Result<(), SchemaError> {
        if metadata.symbol != symbol || metadata.interval != interval.as_str() {
            return Err(SchemaError::KeyMismatch {
                expected: format!("{symbol}/{interval}"),
                actual: format!("{}/{}", metadata.symbol, metadata.interval),
            });
        }
        Self::validate(series, metadata)
    }

    /// Boolean form of [`SchemaRegistry::validate`].
    pub fn is_valid(series: &BarSeries, metadata: &SchemaMetadata) -> bool {
        Self::validate(series, metadata).is_ok()
    }

    /// Current version, any numeric `major.minor.patch`, or the legacy sentinel.
    pub fn is_valid_version(version: &str) -> bool {
        if version == CURRENT_SCHEMA_VERSION || version == LEGACY_SCHEMA_VERSION {
            return true;
        }
        let parts: Vec<&str> = version.split('.').collect();
        parts.len() == 3
            && parts
                .iter()
                .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    }

    /// True for unversioned files and recognized non-current versions.
    /// Unrecognized versions are unrecoverable and never migrated.
    pub fn needs_migration(metadata: Option<&SchemaMetadata>) -> bool {
        match metadata {
            None => true,
            Some(meta) => Self::version_needs_migration(&meta.schema_version),
        }
    }

    pub(crate) fn version_needs_migration(version: &str) -> bool {
        Self::is_valid_version(version) && version != CURRENT_SCHEMA_VERSION
    }

    /// Migrate a legacy or older-version file in place, keeping one backup.
    pub fn migrate_legacy(
        path: &Path,
        symbol: &str,
        interval: Interval,
    ) -> Result<MigrationOutcome, SchemaError> {
        Self::migrate_legacy_with_retention(path, symbol, interval, 1)
    }

    /// Migrate a legacy file in place.
    ///
    /// The original is copied to a timestamped `.bak` file before the rewrite.
    /// The rewritten file is read back and validated; if that fails the backup
    /// is restored. After success only the newest `backups_to_keep` backups of
    /// this file survive (zero deletes the backup once revalidation passes).
    pub fn migrate_legacy_with_retention(
        path: &Path,
        symbol: &str,
        interval: Interval,
        backups_to_keep: usize,
    ) -> Result<MigrationOutcome, SchemaError> {
        let raw = format::read_cache_file(path)?;
        let from_version = raw
            .header
            .version()
            .unwrap_or(LEGACY_SCHEMA_VERSION)
            .to_string();

        if !Self::is_valid_version(&from_version) {
            return Err(SchemaError::InvalidVersion(from_version));
        }
        if from_version == CURRENT_SCHEMA_VERSION {
            if let Header::Versioned {
                metadata: Ok(meta), ..
            } = &raw.header
            {
                return Ok(MigrationOutcome {
                    from_version,
                    record_count: meta.record_count,
                    backup: None,
                });
            }
        }

        let series = parse_legacy(&raw.body)?;
        let mut meta = Self::create_metadata(symbol, &series, interval, "migrated");
        if let Some(old) = raw.header.metadata() {
            meta.coverage_start = old.coverage_start;
        }

        let backup = backup_path(path);
        fs::copy(path, &backup).map_err(|e| SchemaError::io(&backup, e))?;

        if let Err(e) = format::write_cache_file(path, &meta, &series) {
            return Err(SchemaError::MigrationFailed(format!("rewrite: {e}")));
        }

        if let Err(e) = revalidate(path, symbol, interval) {
            warn!(path = %path.display(), error = %e, "migrated file failed revalidation, restoring backup");
            fs::copy(&backup, path).map_err(|e| SchemaError::io(path, e))?;
            return Err(SchemaError::MigrationFailed(format!("revalidation: {e}")));
        }

        let retained = prune_backups(path, backups_to_keep);
        let backup = retained.then_some(backup).filter(|b| b.exists());

        info!(
            path = %path.display(),
            from_version = %from_version,
            records = series.len(),
            "migrated cache file to schema {CURRENT_SCHEMA_VERSION}"
        );

        Ok(MigrationOutcome {
            from_version,
            record_count: series.len(),
            backup,
        })
    }
}

fn revalidate(path: &Path, symbol: &str, interval: Interval) -> Result<(), SchemaError> {
    let raw = format::read_cache_file(path)?;
    let meta = raw
        .header
        .metadata()
        .ok_or_else(|| SchemaError::Metadata("metadata missing after rewrite".into()))?;
    let series = format::parse_body(&raw.body)?;
    SchemaRegistry::validate_for(&series, meta, symbol, interval)
}

fn backup_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{stamp}.bak"));
    PathBuf::from(name)
}

/// Delete all but the newest `keep` backups of `path`. Returns whether any
/// backup is still retained.
fn prune_backups(path: &Path, keep: usize) -> bool {
    let (Some(dir), Some(file_name)) = (path.parent(), path.file_name().and_then(|n| n.to_str()))
    else {
        return false;
    };
    let prefix = format!("{file_name}.");

    let mut backups: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(".bak"))
                    .unwrap_or(false)
            })
            .collect(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot list backups for pruning");
            return true;
        }
    };

    // Timestamps sort lexicographically; newest first.
    backups.sort();
    backups.reverse();
    for stale in backups.iter().skip(keep) {
        if let Err(e) = fs::remove_file(stale) {
            warn!(path = %stale.display(), error = %e, "failed to prune backup");
        }
    }
    keep > 0 && !backups.is_empty()
}

/// Parse a legacy body into a standardized series.
///
/// Accepts case-insensitive column names (`Date`, `Open`, ... with an optional
/// `Adj Close` that is ignored), numeric strings in any float format, and
/// dates with a trailing time or UTC offset. Rows whose OHLCV fields are all
/// empty are dropped; rows with an unparseable date are skipped. Duplicate
/// dates keep the last row.
pub fn parse_legacy(body: &str) -> Result<BarSeries, SchemaError> {
    let text: String = body
        .lines()
        .skip_while(|l| l.trim_start().starts_with('#') || l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| SchemaError::Parse {
            line: 0,
            message: e.to_string(),
        })?
        .clone();
    let index: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.to_ascii_lowercase(), i))
        .collect();

    let date_idx = ["date", "datetime", "timestamp", ""]
        .iter()
        .find_map(|name| index.get(*name).copied())
        .ok_or_else(|| SchemaError::MissingColumn("date".into()))?;
    let column = |name: &str| {
        index
            .get(name)
            .copied()
            .ok_or_else(|| SchemaError::MissingColumn(name.to_string()))
    };
    let open_idx = column("open")?;
    let high_idx = column("high")?;
    let low_idx = column("low")?;
    let close_idx = column("close")?;
    let volume_idx = index.get("volume").copied();

    let mut bars = Vec::new();
    let mut skipped = 0usize;
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(|e| SchemaError::Parse {
            line: i + 2,
            message: e.to_string(),
        })?;
        let field = |idx: usize| record.get(idx).filter(|v| !v.is_empty());
        let number = |idx: usize| field(idx).and_then(|v| v.parse::<f64>().ok());

        let open = number(open_idx);
        let high = number(high_idx);
        let low = number(low_idx);
        let close = number(close_idx);
        let volume = volume_idx.and_then(number);
        if open.is_none() && high.is_none() && low.is_none() && close.is_none() && volume.is_none()
        {
            continue;
        }

        let Some(date) = field(date_idx).and_then(parse_naive_date) else {
            skipped += 1;
            continue;
        };

        bars.push(Bar {
            date,
            open: open.unwrap_or(f64::NAN),
            high: high.unwrap_or(f64::NAN),
            low: low.unwrap_or(f64::NAN),
            close: close.unwrap_or(f64::NAN),
            volume: volume
                .filter(|v| v.is_finite() && *v > 0.0)
                .map(|v| v.round() as u64)
                .unwrap_or(0),
        });
    }

    if skipped > 0 {
        warn!(skipped, "legacy rows with unparseable dates were dropped");
    }
    if bars.is_empty() {
        return Err(SchemaError::Empty);
    }
    Ok(BarSeries::from_bars(bars))
}

/// Date portion of `2024-01-02`, `2024-01-02 00:00:00-05:00`, `2024-01-02T09:30:00Z`.
fn parse_naive_date(value: &str) -> Option<NaiveDate> {
    let head = value.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}
