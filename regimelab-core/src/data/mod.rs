//! Data layer: upstream providers, the versioned per-symbol cache, and the
//! sync orchestrator that decides when to go upstream.

pub mod cache;
pub mod calendar;
pub mod circuit_breaker;
pub mod format;
pub mod provider;
pub mod schema;
pub mod sectors;
pub mod sync;
pub mod yahoo;

pub use cache::{BarCache, CacheStatus};
pub use calendar::TradingCalendar;
pub use circuit_breaker::CircuitBreaker;
pub use provider::{DataError, DataProvider, DataSource, FetchResult, FetchSpan};
pub use schema::{SchemaError, SchemaMetadata, SchemaRegistry, CURRENT_SCHEMA_VERSION};
pub use sectors::SectorMap;
pub use sync::{SyncOptions, SyncOrchestrator, SyncSummary};
pub use yahoo::YahooProvider;
