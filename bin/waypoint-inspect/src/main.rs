//! Waypoint Inspect - Debug CLI for position stores
//!
//! Opens memlog or redb stores through the store API and prints their
//! contents and space usage, or runs maintenance on demand.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use redb::{ReadableTableMetadata, TableHandle};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use waypoint_common::{Backend, Config, Store};
use waypoint_memlog::MemlogRegistry;
use waypoint_redb::{RedbRegistry, RedbStore, now_ns, tables};

#[derive(Parser, Debug)]
#[command(name = "waypoint-inspect")]
#[command(about = "Inspect and maintain Waypoint position stores")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "waypoint.toml")]
    config: PathBuf,

    /// Storage engine the stores were written with
    #[arg(short, long, value_enum, default_value_t = Engine::Memlog)]
    engine: Engine,

    /// Root directory, overriding the configuration file
    #[arg(short, long, env = "WAYPOINT_ROOT")]
    root: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Engine {
    Memlog,
    Redb,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List stores under the root directory
    List,
    /// Print every entry of a store, one JSON object per line
    Dump {
        /// Store name
        store: String,
    },
    /// Print the value of one key
    Get {
        /// Store name
        store: String,
        /// Entry key
        key: String,
    },
    /// Show space usage of a store (redb)
    Stats {
        /// Store name
        store: String,
    },
    /// Compact a store file (redb)
    Compact {
        /// Store name
        store: String,
    },
    /// Delete entries older than the configured TTL (redb)
    Gc {
        /// Store name
        store: String,
        /// Delete in transactions of at most this many entries
        #[arg(long)]
        batch: Option<usize>,
    },
    /// Write a checkpoint and truncate the log (memlog)
    Checkpoint {
        /// Store name
        store: String,
    },
}

fn load_config(path: &Path, root: Option<PathBuf>) -> Result<Config> {
    let mut config: Config = if path.exists() {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&config_str)
            .with_context(|| format!("failed to parse {}", path.display()))?
    } else {
        debug!("No config file at {:?}, using defaults", path);
        Config::default()
    };

    if let Some(root) = root {
        config.memlog.root.clone_from(&root);
        config.redb.root = root;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&args.config, args.root)?;
    match args.engine {
        Engine::Memlog => run_memlog(config, args.command),
        Engine::Redb => run_redb(config, args.command),
    }
}

fn run_memlog(config: Config, command: Commands) -> Result<()> {
    let registry = MemlogRegistry::new(config.memlog).context("failed to open memlog root")?;

    match command {
        Commands::List => {
            for name in registry.list()? {
                println!("{name}");
            }
        }
        Commands::Dump { store } => {
            let store = registry.access(&store)?;
            dump(&*store)?;
        }
        Commands::Get { store, key } => {
            let store = registry.access(&store)?;
            print_value(&*store, &key)?;
        }
        Commands::Checkpoint { store } => {
            let store = registry.access(&store)?;
            store.checkpoint()?;
            info!("Checkpointed store '{}' at txid {}", store.name(), store.txid());
            println!("checkpointed '{}' at txid {}", store.name(), store.txid());
        }
        Commands::Stats { .. } | Commands::Compact { .. } | Commands::Gc { .. } => {
            bail!("this command needs --engine redb");
        }
    }

    registry.close()?;
    Ok(())
}

fn run_redb(mut config: Config, command: Commands) -> Result<()> {
    let ttl = config.redb.ttl();
    let max_batch = config.redb.compaction.max_transaction_size;

    // Maintenance only runs when asked for on the command line
    config.redb.ttl_secs = 0;
    config.redb.compaction.on_start = false;
    config.redb.compaction.rebound_enabled = false;
    let registry = RedbRegistry::new(config.redb).context("failed to open redb root")?;

    match command {
        Commands::List => {
            for name in registry.list()? {
                println!("{name}");
            }
        }
        Commands::Dump { store } => {
            let store = registry.access(&store)?;
            dump(&*store)?;
        }
        Commands::Get { store, key } => {
            let store = registry.access(&store)?;
            print_value(&*store, &key)?;
            if let Some(times) = store.access_times(&key)? {
                println!(
                    "last_access={} last_change={}",
                    times.last_access, times.last_change
                );
            }
        }
        Commands::Stats { store } => {
            let store = registry.access(&store)?;
            print_stats(&store)?;
        }
        Commands::Compact { store } => {
            let store = registry.access(&store)?;
            let stats = store.compact()?;
            println!(
                "compacted '{}': {} -> {} bytes",
                store.name(),
                stats.size_before,
                stats.size_after
            );
        }
        Commands::Gc { store, batch } => {
            let Some(ttl) = ttl else {
                bail!("redb.ttl_secs is not set, nothing would expire");
            };
            let store = registry.access(&store)?;
            let stats = match batch {
                Some(batch) => store.cleanup_expired(ttl, now_ns(), batch.min(max_batch))?,
                None => store.collect_garbage(ttl, now_ns())?,
            };
            println!(
                "scanned {} entries, deleted {}",
                stats.scanned, stats.deleted
            );
        }
        Commands::Checkpoint { .. } => {
            bail!("checkpoint needs --engine memlog");
        }
    }

    registry.close()?;
    Ok(())
}

fn dump<S: Store + ?Sized>(store: &S) -> Result<()> {
    store.each(&mut |key, value| {
        println!("{}", json!({"key": key, "value": value.to_value()?}));
        Ok(true)
    })?;
    Ok(())
}

fn print_value<S: Store + ?Sized>(store: &S, key: &str) -> Result<()> {
    let value = store.get_value(key)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_stats(store: &RedbStore) -> Result<()> {
    let stats = store.stats()?;
    println!("store:       {}", store.name());
    println!("path:        {}", store.path().display());
    println!("file size:   {} bytes", stats.file_size);
    println!("live bytes:  {} bytes", stats.live_bytes);
    println!("entries:     {}", stats.entries);
    println!(
        "rebound:     {}",
        if store.needs_rebound_compaction()? {
            "due"
        } else {
            "not needed"
        }
    );

    let counts = store.with_raw_database(|db| -> Result<Vec<(String, u64)>> {
        let txn = db.begin_read()?;
        let mut counts = Vec::new();
        for handle in txn.list_tables()? {
            let len = match handle.name() {
                name if name == tables::DATA.name() => txn.open_table(tables::DATA)?.len()?,
                name if name == tables::METADATA.name() => {
                    txn.open_table(tables::METADATA)?.len()?
                }
                _ => continue,
            };
            counts.push((handle.name().to_string(), len));
        }
        Ok(counts)
    })??;
    for (name, len) in counts {
        println!("table {name:<10} {len} rows");
    }
    Ok(())
}
