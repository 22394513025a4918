//! Symbol → sector instrument mapping.
//!
//! Loaded once from a CSV file with header `symbol,sector_etf,sector_name`.
//! Lookups are case-insensitive on the symbol; unmapped symbols fall back to
//! the broad-market benchmark, so every symbol has some sector instrument.

use crate::config::ConfigError;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorEntry {
    pub sector_etf: String,
    pub sector_name: String,
}

#[derive(Debug, Deserialize)]
struct SectorRow {
    symbol: String,
    sector_etf: String,
    #[serde(default)]
    sector_name: String,
}

#[derive(Debug, Clone)]
pub struct SectorMap {
    entries: HashMap<String, SectorEntry>,
    benchmark: String,
}

impl SectorMap {
    /// A map with no entries: every symbol resolves to the benchmark.
    pub fn empty(benchmark: impl Into<String>) -> Self {
        Self {
            entries: HashMap::new(),
            benchmark: benchmark.into(),
        }
    }

    pub fn from_file(path: &Path, benchmark: impl Into<String>) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(file, benchmark).map_err(|e| match e {
            ConfigError::SectorMap(message) => {
                ConfigError::SectorMap(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_reader(reader: impl Read, benchmark: impl Into<String>) -> Result<Self, ConfigError> {
        let mut csv = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let mut map = Self::empty(benchmark);
        for (i, row) in csv.deserialize::<SectorRow>().enumerate() {
            let row = row.map_err(|e| ConfigError::SectorMap(format!("row {}: {e}", i + 2)))?;
            if row.symbol.is_empty() || row.sector_etf.is_empty() {
                continue;
            }
            map.insert(&row.symbol, &row.sector_etf, &row.sector_name);
        }
        Ok(map)
    }

    pub fn insert(&mut self, symbol: &str, sector_etf: &str, sector_name: &str) {
        self.entries.insert(
            symbol.to_ascii_uppercase(),
            SectorEntry {
                sector_etf: sector_etf.to_ascii_uppercase(),
                sector_name: sector_name.to_string(),
            },
        );
    }

    pub fn benchmark(&self) -> &str {
        &self.benchmark
    }

    /// Sector instrument for a symbol, or the benchmark when unmapped.
    pub fn sector_for(&self, symbol: &str) -> &str {
        self.entries
            .get(&symbol.to_ascii_uppercase())
            .map(|e| e.sector_etf.as_str())
            .unwrap_or(&self.benchmark)
    }

    pub fn entry(&self, symbol: &str) -> Option<&SectorEntry> {
        self.entries.get(&symbol.to_ascii_uppercase())
    }

    /// Distinct sector instruments referenced by the map.
    pub fn sector_instruments(&self) -> BTreeSet<&str> {
        self.entries.values().map(|e| e.sector_etf.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
