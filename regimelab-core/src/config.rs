//! TOML configuration for caching, sync and regime computation.

use crate::data::calendar::TradingCalendar;
use crate::data::sectors::SectorMap;
use crate::data::sync::validate_symbol;
use crate::regime::{RegimeDirection, TrackedInstrument};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("serialize config TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("sector map: {0}")]
    SectorMap(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Directory holding per-symbol cache files and the regime table.
    pub cache_dir: PathBuf,

    /// CSV with `symbol,sector_etf,sector_name`. Without one every symbol
    /// maps to the benchmark.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector_map: Option<PathBuf>,

    /// History fetched before the first analysis date so moving averages are
    /// populated from day one.
    pub warmup_months: u32,

    /// Migration backups kept per cache file.
    pub backups_to_keep: usize,

    /// Exchange holidays excluded from staleness counts.
    pub holidays: Vec<NaiveDate>,

    pub benchmark: BenchmarkConfig,
    pub sectors: SectorsConfig,
    pub specials: Vec<SpecialConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub symbol: String,
    pub window: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorsConfig {
    pub window: usize,
    /// Sector instruments tracked in the consolidated table.
    pub instruments: Vec<String>,
}

/// A non-equity ticker tracked alongside the benchmark (volatility, yields).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialConfig {
    pub symbol: String,
    pub window: usize,
    pub direction: RegimeDirection,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("data/cache"),
            sector_map: None,
            warmup_months: 12,
            backups_to_keep: 1,
            holidays: Vec::new(),
            benchmark: BenchmarkConfig {
                symbol: "SPY".into(),
                window: 200,
            },
            sectors: SectorsConfig {
                window: 50,
                instruments: [
                    "XLK", "XLF", "XLE", "XLV", "XLY", "XLP", "XLI", "XLB", "XLU", "XLRE", "XLC",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
            },
            specials: vec![
                SpecialConfig {
                    symbol: "^VIX".into(),
                    window: 50,
                    direction: RegimeDirection::Below,
                },
                SpecialConfig {
                    symbol: "^TNX".into(),
                    window: 50,
                    direction: RegimeDirection::Below,
                },
            ],
        }
    }
}

impl RegimeConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config from TOML. Missing keys take defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.benchmark.symbol.trim().is_empty() {
            return Err(ConfigError::Invalid("benchmark.symbol is empty".into()));
        }
        validate_symbol(&self.benchmark.symbol)
            .map_err(|e| ConfigError::Invalid(format!("benchmark.symbol: {e}")))?;
        if self.benchmark.window == 0 {
            return Err(ConfigError::Invalid("benchmark.window must be >= 1".into()));
        }
        if self.sectors.window == 0 {
            return Err(ConfigError::Invalid("sectors.window must be >= 1".into()));
        }
        if self.warmup_months == 0 {
            return Err(ConfigError::Invalid("warmup_months must be >= 1".into()));
        }
        for sym in &self.sectors.instruments {
            validate_symbol(sym).map_err(|e| ConfigError::Invalid(format!("sectors: {e}")))?;
        }
        for special in &self.specials {
            validate_symbol(&special.symbol)
                .map_err(|e| ConfigError::Invalid(format!("specials: {e}")))?;
            if special.window == 0 {
                return Err(ConfigError::Invalid(format!(
                    "specials: window for {} must be >= 1",
                    special.symbol
                )));
            }
        }
        Ok(())
    }

    pub fn calendar(&self) -> TradingCalendar {
        TradingCalendar::with_holidays(self.holidays.iter().copied())
    }

    /// The sector map named by the config, or an empty one.
    pub fn load_sector_map(&self) -> Result<SectorMap, ConfigError> {
        match &self.sector_map {
            Some(path) => SectorMap::from_file(path, &self.benchmark.symbol),
            None => Ok(SectorMap::empty(&self.benchmark.symbol)),
        }
    }

    /// Every instrument the consolidated table tracks: benchmark, sector
    /// instruments, then specials. Duplicates keep their first position.
    pub fn tracked_instruments(&self) -> Vec<TrackedInstrument> {
        let mut out = vec![TrackedInstrument::new(
            &self.benchmark.symbol,
            self.benchmark.window,
            RegimeDirection::Above,
        )];
        for sym in &self.sectors.instruments {
            out.push(TrackedInstrument::new(sym, self.sectors.window, RegimeDirection::Above));
        }
        for special in &self.specials {
            out.push(TrackedInstrument::new(
                &special.symbol,
                special.window,
                special.direction,
            ));
        }
        let mut seen = std::collections::HashSet::new();
        out.retain(|inst| seen.insert(inst.symbol.clone()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RegimeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.benchmark.window, 200);
        assert_eq!(config.sectors.window, 50);
        assert_eq!(config.warmup_months, 12);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = RegimeConfig::from_toml(
            r#"
            cache_dir = "/tmp/regime"
            holidays = ["2025-01-01"]

            [benchmark]
            symbol = "QQQ"
            window = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/regime"));
        assert_eq!(config.benchmark.symbol, "QQQ");
        assert_eq!(config.sectors.window, 50);
        assert_eq!(config.specials.len(), 2);
        assert!(!config
            .calendar()
            .is_trading_day(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()));
    }

    #[test]
    fn toml_round_trip() {
        let config = RegimeConfig::default();
        let text = config.to_toml().unwrap();
        assert!(text.contains("direction = \"below\""));
        assert_eq!(RegimeConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn rejects_zero_windows_and_bad_symbols() {
        let mut config = RegimeConfig::default();
        config.benchmark.window = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = RegimeConfig::default();
        config.benchmark.symbol = "S P Y".into();
        assert!(config.validate().is_err());

        let mut config = RegimeConfig::default();
        config.warmup_months = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn tracked_instruments_are_unique_and_ordered() {
        let mut config = RegimeConfig::default();
        config.sectors.instruments.push("SPY".into());
        let tracked = config.tracked_instruments();
        assert_eq!(tracked[0].symbol, "SPY");
        assert_eq!(tracked[0].window, 200);
        assert_eq!(tracked.iter().filter(|t| t.symbol == "SPY").count(), 1);
        let vix = tracked.iter().find(|t| t.symbol == "^VIX").unwrap();
        assert_eq!(vix.direction, RegimeDirection::Below);
        assert_eq!(vix.prefix(), "vix");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = RegimeConfig::from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
