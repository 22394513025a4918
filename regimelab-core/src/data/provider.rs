//! Data provider trait and structured error types.
//!
//! The DataProvider trait abstracts over upstream sources so the sync layer
//! can be driven by Yahoo Finance in production and by a scripted mock in
//! tests. Providers know nothing about the cache.

use crate::domain::{BarSeries, Interval, Period};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::schema::SchemaError;

/// Structured error types for data operations.
///
/// Validation variants are raised immediately. Fetch variants are transient
/// and the sync layer degrades them to a stale-cache answer where it can.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("invalid symbol '{0}'")]
    InvalidSymbol(String),

    #[error("invalid period: {0}")]
    InvalidPeriod(String),

    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    #[error("invalid date range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error(
        "no cached data for '{symbol}' ({interval}) in cache-only mode; \
         run `regimelab sync {symbol} --interval {interval}` while online first"
    )]
    CacheMiss { symbol: String, interval: Interval },

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("no bars returned for '{symbol}' in the requested span")]
    NoData { symbol: String },

    #[error("hard stop: data provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("cache error: {0}")]
    CacheError(String),

    #[error("parquet I/O error: {0}")]
    ParquetError(String),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("data error: {0}")]
    Other(String),
}

impl DataError {
    /// Upstream failures that should degrade to a conservative answer
    /// instead of failing the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DataError::NetworkUnreachable(_)
                | DataError::RateLimited { .. }
                | DataError::ResponseFormatChanged(_)
                | DataError::AuthenticationRequired(_)
                | DataError::SymbolNotFound { .. }
                | DataError::NoData { .. }
                | DataError::CircuitBreakerTripped
                | DataError::Other(_)
        )
    }

    /// Input errors the caller must fix.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DataError::InvalidSymbol(_)
                | DataError::InvalidPeriod(_)
                | DataError::InvalidInterval(_)
                | DataError::InvalidRange { .. }
        )
    }
}

/// What span of history to request from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSpan {
    /// A lookback period ending now.
    Period(Period),
    /// An inclusive calendar date range.
    Range { start: NaiveDate, end: NaiveDate },
}

/// Result of a successful data fetch for a single symbol.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub symbol: String,
    pub bars: BarSeries,
    pub source: DataSource,
}

/// Where the data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    YahooFinance,
    Cache,
    Migrated,
    Mock,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::YahooFinance => "yahoo_finance",
            DataSource::Cache => "cache",
            DataSource::Migrated => "migrated",
            DataSource::Mock => "mock",
        }
    }
}

/// Trait for upstream data providers.
///
/// All data returned is split/dividend adjusted. Implementations return bars
/// in any order; callers normalise through `BarSeries`.
pub trait DataProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Fetch bars for a symbol over a period or date range.
    fn fetch(
        &self,
        symbol: &str,
        span: FetchSpan,
        interval: Interval,
    ) -> Result<FetchResult, DataError>;

    /// Check if the provider is currently available (not rate-limited, not blocked).
    fn is_available(&self) -> bool;
}
