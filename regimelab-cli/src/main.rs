//! RegimeLab CLI: sync, regime, table and cache management commands.
//!
//! Commands:
//! - `sync`: bring per-symbol caches up to date from Yahoo Finance
//! - `regime`: point-in-time market/sector regime flags for a symbol
//! - `table`: build or extend the consolidated regime table
//! - `cache status`: per-symbol schema version, date range and size
//! - `cache migrate`: upgrade one legacy cache file in place
//! - `cache verify`: load every entry, discarding files that fail validation

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use regimelab_core::data::schema::SchemaRegistry;
use regimelab_core::data::sync::{parse_interval, parse_period};
use regimelab_core::data::{BarCache, CircuitBreaker, SyncOptions, SyncOrchestrator, YahooProvider};
use regimelab_core::domain::Interval;
use regimelab_core::regime::{
    ConsolidatedRegimeCache, RegimeEngine, RegimeFlags, RegimeSettings, RegimeTable,
};
use regimelab_core::RegimeConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "regimelab",
    about = "RegimeLab CLI: versioned bar cache and point-in-time market regimes"
)]
struct Cli {
    /// Path to a TOML config file. Defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache directory, overriding the config.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync cached bars for one or more symbols.
    Sync {
        /// Symbols to sync (e.g., SPY XLK ^VIX).
        #[arg(required = true)]
        symbols: Vec<String>,

        /// Lookback period: 1d, 5d, 1mo, 3mo, 6mo, 1y, 2y, 5y, 10y, ytd, max.
        #[arg(long, default_value = "1y")]
        period: String,

        /// Bar interval (1d, 1wk, 1h, 5m, ...).
        #[arg(long, default_value = "1d")]
        interval: String,

        /// Refetch the whole period even if cached.
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Never go upstream; fail on symbols with no cache.
        #[arg(long, default_value_t = false)]
        cache_only: bool,
    },
    /// Print market, sector and overall regime flags for a symbol.
    Regime {
        symbol: String,

        /// First analysis date (YYYY-MM-DD).
        #[arg(long)]
        start: String,

        /// Last analysis date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        end: Option<String>,

        /// Serve flags from the consolidated regime table.
        #[arg(long, default_value_t = false)]
        from_table: bool,
    },
    /// Build or extend the consolidated regime table.
    Table {
        /// First date the table must cover (YYYY-MM-DD).
        #[arg(long)]
        start: String,

        /// Last date the table must cover (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        end: Option<String>,

        /// Rebuild from scratch even if the range is covered.
        #[arg(long, default_value_t = false)]
        rebuild: bool,
    },
    /// Cache management commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Report schema version, date range and record count per symbol.
    Status {
        #[arg(long, default_value = "1d")]
        interval: String,
    },
    /// Migrate one cache file to the current schema, keeping a backup.
    Migrate {
        symbol: String,

        #[arg(long, default_value = "1d")]
        interval: String,
    },
    /// Load every cached entry; invalid files are discarded.
    Verify {
        #[arg(long, default_value = "1d")]
        interval: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("regimelab=info,regimelab_core=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.cache_dir)?;

    match cli.command {
        Commands::Sync {
            symbols,
            period,
            interval,
            force,
            cache_only,
        } => run_sync(&config, &symbols, &period, &interval, force, cache_only),
        Commands::Regime {
            symbol,
            start,
            end,
            from_table,
        } => run_regime(&config, &symbol, &start, end.as_deref(), from_table),
        Commands::Table {
            start,
            end,
            rebuild,
        } => run_table(&config, &start, end.as_deref(), rebuild),
        Commands::Cache { action } => match action {
            CacheAction::Status { interval } => run_cache_status(&config, &interval),
            CacheAction::Migrate { symbol, interval } => {
                run_cache_migrate(&config, &symbol, &interval)
            }
            CacheAction::Verify { interval } => run_cache_verify(&config, &interval),
        },
    }
}

fn load_config(path: Option<&Path>, cache_dir: Option<PathBuf>) -> Result<RegimeConfig> {
    let mut config = match path {
        Some(path) => RegimeConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RegimeConfig::default(),
    };
    if let Some(dir) = cache_dir {
        config.cache_dir = dir;
    }
    Ok(config)
}

fn open_cache(config: &RegimeConfig) -> BarCache {
    BarCache::new(&config.cache_dir).with_backups_to_keep(config.backups_to_keep)
}

fn open_sync(config: &RegimeConfig) -> Result<Arc<SyncOrchestrator>> {
    let circuit_breaker = Arc::new(CircuitBreaker::default_provider());
    let provider = YahooProvider::new(circuit_breaker)?;
    Ok(Arc::new(
        SyncOrchestrator::new(Arc::new(provider), open_cache(config))
            .with_calendar(config.calendar()),
    ))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}'"))
}

/// `[start, end]`, with `end` defaulting to today.
fn date_range(sync: &SyncOrchestrator, start: &str, end: Option<&str>) -> Result<(NaiveDate, NaiveDate)> {
    let start = parse_date(start)?;
    let end = match end {
        Some(end) => parse_date(end)?,
        None => sync.today(),
    };
    if start > end {
        bail!("--start {start} is after --end {end}");
    }
    Ok((start, end))
}

fn run_sync(
    config: &RegimeConfig,
    symbols: &[String],
    period: &str,
    interval: &str,
    force: bool,
    cache_only: bool,
) -> Result<()> {
    let period = parse_period(period)?;
    let interval = parse_interval(interval)?;
    let options = SyncOptions {
        force_refresh: force,
        cache_only,
    };
    let sync = open_sync(config)?;

    let sym_refs: Vec<&str> = symbols.iter().map(|s| s.as_str()).collect();
    let summary = sync.sync_many(&sym_refs, period, interval, options);

    println!("{:<10} {:>8}", "Symbol", "Bars");
    println!("{}", "-".repeat(19));
    for (sym, bars) in &summary.synced {
        println!("{sym:<10} {bars:>8}");
    }

    if !summary.all_succeeded() {
        for (sym, err) in &summary.errors {
            eprintln!("Error for {sym}: {err}");
        }
        bail!("{} of {} symbol(s) failed", summary.failed(), summary.total);
    }
    info!(symbols = summary.total, %period, %interval, "sync complete");
    Ok(())
}

fn run_regime(
    config: &RegimeConfig,
    symbol: &str,
    start: &str,
    end: Option<&str>,
    from_table: bool,
) -> Result<()> {
    let sync = open_sync(config)?;
    let (start, end) = date_range(&sync, start, end)?;
    let calendar = sync.calendar().clone();
    let timeline: Vec<NaiveDate> = start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| calendar.is_trading_day(*d))
        .collect();
    if timeline.is_empty() {
        warn!(%start, %end, "no trading days in range");
        return Ok(());
    }

    let sectors = config.load_sector_map()?;
    let sector = sectors.sector_for(symbol).to_string();
    let flags = if from_table {
        ConsolidatedRegimeCache::from_config(sync, config)?.historical_regime(symbol, &timeline)?
    } else {
        RegimeEngine::new(sync, sectors, RegimeSettings::from_config(config))
            .historical_regime(symbol, &timeline)?
    };

    println!("Symbol: {symbol}  Benchmark: {}  Sector: {sector}", config.benchmark.symbol);
    println!();
    print_flags(&timeline, &flags);
    Ok(())
}

fn print_flags(timeline: &[NaiveDate], flags: &RegimeFlags) {
    println!("{:<12} {:>8} {:>8} {:>8}", "Date", "Market", "Sector", "Overall");
    println!("{}", "-".repeat(39));
    for (i, date) in timeline.iter().enumerate() {
        println!(
            "{:<12} {:>8} {:>8} {:>8}",
            date.to_string(),
            flag(flags.market_ok[i]),
            flag(flags.sector_ok[i]),
            flag(flags.overall_ok[i]),
        );
    }
    let ok = flags.overall_ok.iter().filter(|x| **x).count();
    println!();
    println!("Overall ok on {ok} of {} day(s)", flags.len());
}

fn flag(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "-"
    }
}

fn run_table(config: &RegimeConfig, start: &str, end: Option<&str>, rebuild: bool) -> Result<()> {
    let sync = open_sync(config)?;
    let (start, end) = date_range(&sync, start, end)?;
    let cache = ConsolidatedRegimeCache::from_config(sync, config)?;

    let table = cache.get(start, end, rebuild)?;
    let Some(meta) = cache.meta() else {
        bail!("regime table was not persisted");
    };

    println!("Table: {}", cache.table_path().display());
    println!("Covered: {} to {}", meta.covered_start, meta.covered_end);
    println!("Rows: {} ({} in requested range)", meta.row_count, table.len());
    println!("Built: {}", meta.built_at.format("%Y-%m-%d %H:%M:%S"));
    println!();
    print_latest(&table);
    Ok(())
}

fn print_latest(table: &RegimeTable) {
    let Some(last) = table.last_date() else {
        println!("No rows in range.");
        return;
    };
    println!("Regimes as of {last}:");
    for inst in table.instruments() {
        let ok = table
            .column_for(inst)
            .and_then(|c| c.regime_ok.last().copied())
            .unwrap_or(false);
        println!(
            "  {:<8} {:>4}ma {:?}  {}",
            inst.symbol,
            inst.window,
            inst.direction,
            flag(ok)
        );
    }
}

fn run_cache_status(config: &RegimeConfig, interval: &str) -> Result<()> {
    let interval = parse_interval(interval)?;
    let cache = open_cache(config);
    let symbols = cache.list_symbols(interval);
    if symbols.is_empty() {
        println!("No {interval} entries in {}", config.cache_dir.display());
        return Ok(());
    }

    let sym_refs: Vec<&str> = symbols.iter().map(|s| s.as_str()).collect();
    let mut total_size = 0u64;
    println!("Cache: {}", config.cache_dir.display());
    println!();
    println!(
        "{:<10} {:<14} {:<25} {:>8} {:>10}",
        "Symbol", "Schema", "Date Range", "Bars", "Size"
    );
    println!("{}", "-".repeat(71));
    for status in cache.status(&sym_refs, interval) {
        let size = file_size(&cache.path_for(&status.symbol, status.interval));
        total_size += size;
        let range = match (status.first_date, status.last_date) {
            (Some(first), Some(last)) => format!("{first} to {last}"),
            _ => "(no metadata)".to_string(),
        };
        println!(
            "{:<10} {:<14} {:<25} {:>8} {:>10}",
            status.symbol,
            status.schema_version.as_deref().unwrap_or("unversioned"),
            range,
            status.record_count.map(|n| n.to_string()).unwrap_or_default(),
            format_size(size)
        );
    }
    println!();
    println!("Symbols: {}  Total size: {}", symbols.len(), format_size(total_size));
    Ok(())
}

fn run_cache_migrate(config: &RegimeConfig, symbol: &str, interval: &str) -> Result<()> {
    let interval: Interval = parse_interval(interval)?;
    let cache = open_cache(config);
    let path = cache.path_for(symbol, interval);
    if !path.exists() {
        bail!("no cache file for {symbol} ({interval}) at {}", path.display());
    }

    let outcome =
        SchemaRegistry::migrate_legacy_with_retention(&path, symbol, interval, config.backups_to_keep)
            .with_context(|| format!("migrating {}", path.display()))?;
    println!(
        "{symbol} ({interval}): {} -> current, {} record(s)",
        outcome.from_version, outcome.record_count
    );
    if let Some(backup) = outcome.backup {
        println!("Backup: {}", backup.display());
    }
    Ok(())
}

fn run_cache_verify(config: &RegimeConfig, interval: &str) -> Result<()> {
    let interval = parse_interval(interval)?;
    let cache = open_cache(config);
    let symbols = cache.list_symbols(interval);

    let mut discarded = Vec::new();
    for sym in &symbols {
        match cache.load(sym, interval) {
            Some(series) => println!("  ok       {sym:<10} {} bar(s)", series.len()),
            None => {
                println!("  removed  {sym}");
                discarded.push(sym.as_str());
            }
        }
    }

    println!();
    println!(
        "Verified {} entr(ies), {} discarded.",
        symbols.len(),
        discarded.len()
    );
    if !discarded.is_empty() {
        println!("Re-sync with: regimelab sync {} --interval {interval}", discarded.join(" "));
    }
    Ok(())
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
