use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use symdex_cache::{
    CacheConfig, CacheStatus, LookupRequest, PersistentBackend, Segment, StoreStats, Symbol,
    SymbolCache, SYMBOL_SCHEMA_VERSION,
};
use symdex_cli::{logging, outline, resolve, telemetry};

#[derive(Parser)]
#[command(name = "symdex", version, about = "Symbol outlines with a shared on-disk cache")]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the top-level symbols of the file a reference points at
    Symbols(SymbolsArgs),
    /// Inspect or clear the persistent cache for a segment
    Cache(CacheArgs),
}

#[derive(Args)]
struct SymbolsArgs {
    /// `sym://<path>[#fragment]` or a path relative to the root
    symbol_ref: String,
    /// Segment root (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Emit JSON suitable for agents and CI
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,
    /// Segment root (defaults to current directory)
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,
    /// Emit JSON suitable for agents and CI
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Show where the store lives and how many entries it holds
    Status,
    /// Delete the segment's cache directory
    Clean,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_json);

    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Symbols(args) => {
            let report = symbols(&args)?;
            print_output(&report, args.json)?;
            Ok(0)
        }
        Command::Cache(args) => {
            let config = CacheConfig::from_env();
            let segment = Segment::resolve(&args.root, &config).with_context(|| {
                format!("failed to resolve segment root {}", args.root.display())
            })?;
            match args.command {
                CacheCommand::Status => {
                    let store = PersistentBackend::new(&segment, config.schema_version).stats();
                    let status = StatusReport {
                        root: segment.root().to_path_buf(),
                        segment_id: segment.id().to_owned(),
                        cache_dir: segment.dir().to_path_buf(),
                        persistence_enabled: config.persist,
                        store,
                    };
                    print_output(&status, args.json)?;
                }
                CacheCommand::Clean => {
                    let dir = segment.dir().to_path_buf();
                    let cleaned = match std::fs::remove_dir_all(&dir) {
                        Ok(()) => true,
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
                        Err(err) => {
                            return Err(err)
                                .with_context(|| format!("failed to remove {}", dir.display()))
                        }
                    };
                    tracing::info!(
                        target: "symdex.cli",
                        dir = %dir.display(),
                        cleaned,
                        "cache clean"
                    );
                    print_output(&CleanReport { dir, cleaned }, args.json)?;
                }
            }
            Ok(0)
        }
    }
}

fn symbols(args: &SymbolsArgs) -> Result<SymbolsReport> {
    let resolved = resolve::resolve(&args.root, &args.symbol_ref)
        .with_context(|| format!("failed to resolve {}", args.symbol_ref))?;
    let bytes = std::fs::read(&resolved.path)
        .with_context(|| format!("failed to read {}", resolved.path.display()))?;

    let cache = SymbolCache::open(&args.root, CacheConfig::from_env(), telemetry::sink_from_env())
        .with_context(|| format!("failed to open symbol cache for {}", args.root.display()))?;
    let lookup = cache
        .lookup_or_compute(
            LookupRequest {
                symbol_ref: &args.symbol_ref,
                file_path: &resolved.rel_path,
                file_bytes: &bytes,
                schema_version: SYMBOL_SCHEMA_VERSION,
            },
            || outline::extract(&bytes),
        )
        .with_context(|| format!("failed to extract symbols from {}", resolved.path.display()))?;

    tracing::debug!(
        target: "symdex.cli",
        symbol_ref = %args.symbol_ref,
        status = %lookup.status,
        backend = lookup.backend,
        "symbols resolved"
    );

    Ok(SymbolsReport {
        symbol_ref: args.symbol_ref.clone(),
        file: resolved.rel_path,
        symbols: lookup.symbols,
        cache_status: lookup.status,
        cache_key: lookup.key.to_string(),
        backend: lookup.backend,
        segment_id: cache.segment().id().to_owned(),
    })
}

#[derive(Serialize)]
struct SymbolsReport {
    symbol_ref: String,
    file: String,
    symbols: Vec<Symbol>,
    cache_status: CacheStatus,
    cache_key: String,
    backend: &'static str,
    segment_id: String,
}

#[derive(Serialize)]
struct StatusReport {
    root: PathBuf,
    segment_id: String,
    cache_dir: PathBuf,
    persistence_enabled: bool,
    store: StoreStats,
}

#[derive(Serialize)]
struct CleanReport {
    dir: PathBuf,
    cleaned: bool,
}

fn print_output<T: Serialize + 'static>(value: &T, json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(value)?;
        println!("{out}");
        return Ok(());
    }

    let any = value as &dyn std::any::Any;
    if let Some(report) = any.downcast_ref::<SymbolsReport>() {
        println!(
            "{} ({}, {})",
            report.file, report.cache_status, report.backend
        );
        for symbol in &report.symbols {
            println!("  {}: {} {}", symbol.line, symbol.kind, symbol.name);
        }
    } else if let Some(status) = any.downcast_ref::<StatusReport>() {
        println!("cache:");
        println!("  root: {}", status.root.display());
        println!("  segment: {}", status.segment_id);
        println!("  dir: {}", status.cache_dir.display());
        println!("  persistence: {}", if status.persistence_enabled { "on" } else { "off" });
        println!("  store: {}", status.store.path.display());
        println!("    exists: {}", status.store.exists);
        match status.store.entries {
            Some(entries) => println!("    entries: {entries}"),
            None if status.store.exists => println!("    entries: (incompatible or unreadable)"),
            None => println!("    entries: (missing)"),
        }
    } else if let Some(report) = any.downcast_ref::<CleanReport>() {
        if report.cleaned {
            println!("cache: cleaned {}", report.dir.display());
        } else {
            println!("cache: nothing to clean at {}", report.dir.display());
        }
    } else {
        let out = serde_json::to_string_pretty(value)?;
        println!("{out}");
    }
    Ok(())
}
