//! RegimeLab Core: versioned bar cache, upstream sync, and point-in-time
//! market regime flags.
//!
//! This crate contains:
//! - Domain types (bars, series, intervals, periods)
//! - Schema registry and the self-healing per-symbol cache
//! - Provider trait, Yahoo Finance provider, circuit breaker
//! - Sync orchestrator (serve / suffix fetch / full refetch)
//! - Regime engine and the consolidated regime table
//! - Point-in-time alignment and run-scoped memo caches

pub mod align;
pub mod clock;
pub mod config;
pub mod data;
pub mod domain;
pub mod indicators;
pub mod memo;
pub mod regime;

pub use config::{ConfigError, RegimeConfig};
pub use data::{DataError, SyncOptions, SyncOrchestrator};
pub use domain::{Bar, BarSeries, Interval, Period};
pub use regime::{ConsolidatedRegimeCache, RegimeEngine};
