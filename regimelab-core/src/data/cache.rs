//! Per-symbol bar cache.
//!
//! Layout: `{cache_dir}/{SYMBOL}_{interval}.csv`, one file per key, each a
//! metadata comment block followed by a CSV body (see `format`).
//!
//! Features:
//! - Atomic full rewrites on every save (write to .tmp, rename into place)
//! - Schema version check and in-place migration of legacy files
//! - Integrity validation on load (columns, types, ordering, checksum)
//! - Self-healing: a corrupt or unrecoverable file is deleted and reported
//!   as absent, so callers always treat `None` as "must refetch"

use super::format::{self, Header};
use super::provider::{DataError, DataSource};
use super::schema::{SchemaMetadata, SchemaRegistry};
use crate::domain::{BarSeries, Interval};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File-backed store of one `BarSeries` per (symbol, interval).
#[derive(Debug, Clone)]
pub struct BarCache {
    cache_dir: PathBuf,
    backups_to_keep: usize,
}

impl BarCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            backups_to_keep: 1,
        }
    }

    /// Number of migration backups retained per file.
    pub fn with_backups_to_keep(mut self, keep: usize) -> Self {
        self.backups_to_keep = keep;
        self
    }

    /// Root directory of the cache.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path to the cache file for a key: `{cache_dir}/{SYMBOL}_{interval}.csv`.
    pub fn path_for(&self, symbol: &str, interval: Interval) -> PathBuf {
        let safe: String = symbol
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
            .collect();
        self.cache_dir.join(format!("{safe}_{interval}.csv"))
    }

    /// Load the cached series for a key.
    ///
    /// Returns `None` when nothing usable is cached. Files with an
    /// unrecognized schema version, failed migrations, and files that fail
    /// validation are deleted before returning `None`.
    pub fn load(&self, symbol: &str, interval: Interval) -> Option<BarSeries> {
        self.load_with_metadata(symbol, interval).map(|(series, _)| series)
    }

    /// Like [`BarCache::load`], also returning the file's metadata.
    pub fn load_with_metadata(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Option<(BarSeries, SchemaMetadata)> {
        let path = self.path_for(symbol, interval);
        if !path.exists() {
            return None;
        }

        let raw = match format::read_cache_file(&path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(symbol, %interval, error = %e, "unreadable cache file");
                self.discard(&path, "unreadable");
                return None;
            }
        };

        let version = raw.header.version().map(str::to_string);
        if let Some(v) = &version {
            if !SchemaRegistry::is_valid_version(v) {
                warn!(symbol, %interval, version = %v, "unrecognized schema version");
                self.discard(&path, "invalid schema version");
                return None;
            }
        }

        let needs_migration = match &version {
            None => true,
            Some(v) => SchemaRegistry::version_needs_migration(v),
        };
        let raw = if needs_migration {
            match SchemaRegistry::migrate_legacy_with_retention(
                &path,
                symbol,
                interval,
                self.backups_to_keep,
            ) {
                Ok(outcome) => {
                    info!(
                        symbol,
                        %interval,
                        from = %outcome.from_version,
                        records = outcome.record_count,
                        "migrated legacy cache file"
                    );
                    match format::read_cache_file(&path) {
                        Ok(raw) => raw,
                        Err(e) => {
                            warn!(symbol, %interval, error = %e, "cannot reload migrated file");
                            self.discard(&path, "reload after migration failed");
                            return None;
                        }
                    }
                }
                Err(e) => {
                    warn!(symbol, %interval, error = %e, "migration failed");
                    self.discard(&path, "migration failed");
                    return None;
                }
            }
        } else {
            raw
        };

        let meta = match raw.header {
            Header::Versioned {
                metadata: Ok(meta), ..
            } => meta,
            Header::Versioned {
                metadata: Err(e), ..
            } => {
                warn!(symbol, %interval, error = %e, "malformed metadata block");
                self.discard(&path, "malformed metadata");
                return None;
            }
            Header::Unversioned => {
                self.discard(&path, "metadata missing");
                return None;
            }
        };

        let series = match format::parse_body(&raw.body) {
            Ok(series) => series,
            Err(e) => {
                warn!(symbol, %interval, error = %e, "cache body failed to parse");
                self.discard(&path, "corrupt body");
                return None;
            }
        };

        if let Err(e) = SchemaRegistry::validate_for(&series, &meta, symbol, interval) {
            warn!(symbol, %interval, error = %e, "cache validation failed");
            self.discard(&path, "validation failed");
            return None;
        }

        debug!(symbol, %interval, records = series.len(), "cache hit");
        Some((series, meta))
    }

    /// Read just the metadata block of a cached file, without validation.
    pub fn metadata(&self, symbol: &str, interval: Interval) -> Option<SchemaMetadata> {
        let path = self.path_for(symbol, interval);
        let raw = format::read_cache_file(&path).ok()?;
        raw.header.metadata().cloned()
    }

    /// Write a series, replacing whatever is cached for the key.
    pub fn save(&self, symbol: &str, interval: Interval, series: &BarSeries) -> Result<(), DataError> {
        self.save_with_coverage(symbol, interval, series, None, DataSource::YahooFinance)
    }

    /// Write a series and record the earliest date it is known to cover.
    ///
    /// Always a full rewrite, so the metadata is authoritative for the body.
    pub fn save_with_coverage(
        &self,
        symbol: &str,
        interval: Interval,
        series: &BarSeries,
        coverage_start: Option<NaiveDate>,
        source: DataSource,
    ) -> Result<(), DataError> {
        if series.is_empty() {
            return Err(DataError::CacheError(format!(
                "refusing to cache an empty series for {symbol} ({interval})"
            )));
        }
        let mut meta = SchemaRegistry::create_metadata(symbol, series, interval, source.as_str());
        meta.coverage_start = coverage_start;

        let path = self.path_for(symbol, interval);
        format::write_cache_file(&path, &meta, series)?;
        debug!(symbol, %interval, records = series.len(), "cache written");
        Ok(())
    }

    /// Merge new bars into the cached series and save the whole thing.
    ///
    /// Newly supplied bars win on overlapping dates. Returns the resulting
    /// record count. With nothing cached this is a plain save.
    pub fn append(
        &self,
        symbol: &str,
        interval: Interval,
        new_bars: &BarSeries,
    ) -> Result<usize, DataError> {
        match self.load_with_metadata(symbol, interval) {
            Some((existing, meta)) => {
                let merged = existing.merge(new_bars);
                let coverage = meta.coverage_start;
                self.save_with_coverage(symbol, interval, &merged, coverage, source_of(&meta))?;
                Ok(merged.len())
            }
            None => {
                self.save(symbol, interval, new_bars)?;
                Ok(new_bars.len())
            }
        }
    }

    /// Delete the cached file for a key. Returns whether a file was removed.
    pub fn remove(&self, symbol: &str, interval: Interval) -> Result<bool, DataError> {
        let path = self.path_for(symbol, interval);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)
            .map_err(|e| DataError::CacheError(format!("remove {}: {e}", path.display())))?;
        Ok(true)
    }

    /// Keys present in the cache directory for an interval, sorted by symbol.
    pub fn list_symbols(&self, interval: Interval) -> Vec<String> {
        let suffix = format!("_{interval}.csv");
        let Ok(entries) = fs::read_dir(&self.cache_dir) else {
            return Vec::new();
        };
        let mut symbols: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_suffix(&suffix).map(str::to_string)
            })
            .collect();
        symbols.sort();
        symbols
    }

    /// Metadata-level status for a set of symbols.
    pub fn status(&self, symbols: &[&str], interval: Interval) -> Vec<CacheStatus> {
        symbols
            .iter()
            .map(|sym| {
                let meta = self.metadata(sym, interval);
                CacheStatus {
                    symbol: sym.to_string(),
                    interval,
                    cached: meta.is_some(),
                    schema_version: meta.as_ref().map(|m| m.schema_version.clone()),
                    first_date: meta.as_ref().and_then(|m| m.first_date),
                    last_date: meta.as_ref().and_then(|m| m.last_date),
                    record_count: meta.as_ref().map(|m| m.record_count),
                }
            })
            .collect()
    }

    fn discard(&self, path: &Path, reason: &str) {
        match fs::remove_file(path) {
            Ok(()) => warn!(path = %path.display(), reason, "removed cache file"),
            Err(e) => warn!(path = %path.display(), reason, error = %e, "failed to remove cache file"),
        }
    }
}

fn source_of(meta: &SchemaMetadata) -> DataSource {
    match meta.source.as_str() {
        "migrated" => DataSource::Migrated,
        "mock" => DataSource::Mock,
        _ => DataSource::YahooFinance,
    }
}

/// Cache status for a single symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatus {
    pub symbol: String,
    pub interval: Interval,
    pub cached: bool,
    pub schema_version: Option<String>,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub record_count: Option<usize>,
}
