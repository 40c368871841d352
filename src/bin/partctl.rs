//! Operator tool for part directories.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`PARTCTL_*`), and CLI flags. Lists, inspects, merge-reads and compacts parts under the root.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use config::{Config, Environment, File};
use partstore::config::StorageFileConfig;
use partstore::part::part_name;
use partstore::telemetry::tracing_event_listener;
use partstore::{PartStore, PartWrapper, StorageConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

// ---------- CLI ----------

/// Inspect and maintain time-series part directories.
#[derive(Parser, Debug)]
#[command(name = "partctl", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `partctl.toml` is loaded when present.
    #[arg(long, env = "PARTCTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Override the part root directory.
    #[arg(long, env = "PARTCTL_ROOT")]
    pub root: Option<PathBuf>,

    /// Override the large file threshold in bytes.
    #[arg(long)]
    pub large_file_threshold: Option<i64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List part ids under the root.
    List,
    /// Print a part's metadata and block descriptors.
    Inspect { id: u64 },
    /// Print the globally ordered block stream across parts.
    Merge {
        ids: Vec<u64>,
        /// Also decode each block and print its row count.
        #[arg(long, default_value_t = false)]
        load: bool,
    },
    /// Merge parts into a new part and remove the inputs.
    Compact { ids: Vec<u64> },
}

/// Load merged storage config. CLI overrides file/env.
fn load_storage_config(cli: &Cli) -> Result<StorageConfig, String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(false));
        } else {
            let default_path = PathBuf::from("partctl.toml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("PARTCTL")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: StorageFileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut cfg = StorageConfig {
        event_listener: tracing_event_listener(),
        ..Default::default()
    };
    cfg.merge(&partial);

    if let Some(ref root) = cli.root {
        cfg.root = root.clone();
    }
    if let Some(t) = cli.large_file_threshold {
        cfg.large_file_threshold = t;
    }
    cfg.validate().map_err(|e| e.to_string())?;
    Ok(cfg)
}

fn open_parts(store: &PartStore, ids: &[u64]) -> Result<Vec<Arc<PartWrapper>>, partstore::PartError> {
    ids.iter().map(|&id| store.open_part(id)).collect()
}

fn release_all(parts: Vec<Arc<PartWrapper>>) {
    for p in parts {
        p.release();
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cfg = load_storage_config(&cli)?;
    let store = PartStore::open(cfg)?;

    match cli.command {
        Command::List => {
            for id in store.part_ids()? {
                println!("{}\t{}", id, part_name(id));
            }
        }
        Command::Inspect { id } => {
            let wrapper = store.open_part(id)?;
            if let Some(part) = wrapper.part() {
                println!("{}", wrapper);
                println!("{}", serde_json::to_string_pretty(part.metadata())?);
                let families: Vec<&str> = part.tag_family_names().collect();
                println!("tag families: {:?}", families);
                for (i, d) in part.descriptors().iter().enumerate() {
                    println!(
                        "#{}\tseries={}\tts=[{}, {}]\tcount={}\tprimary={}+{}\ttimestamps={}+{}",
                        i,
                        d.series_id,
                        d.min_timestamp,
                        d.max_timestamp,
                        d.count,
                        d.primary.offset,
                        d.primary.size,
                        d.timestamps.offset,
                        d.timestamps.size
                    );
                }
            }
            wrapper.release();
        }
        Command::Merge { ids, load } => {
            let parts = open_parts(&store, &ids)?;
            {
                let mut reader = store.merge_reader(&parts)?;
                loop {
                    let Some(d) = reader.next_block()?.copied() else {
                        break;
                    };
                    let part_id = reader.current_part_id().unwrap_or_default();
                    if load {
                        let block = reader.load_block_data()?;
                        println!(
                            "part={}\tseries={}\tts=[{}, {}]\trows={}",
                            part_id,
                            d.series_id,
                            d.min_timestamp,
                            d.max_timestamp,
                            block.len()
                        );
                    } else {
                        println!(
                            "part={}\tseries={}\tts=[{}, {}]\tcount={}",
                            part_id, d.series_id, d.min_timestamp, d.max_timestamp, d.count
                        );
                    }
                }
            }
            release_all(parts);
        }
        Command::Compact { ids } => {
            let parts = open_parts(&store, &ids)?;
            let merged = store.compact(&parts)?;
            release_all(parts);
            store.wait_for_removals();
            match merged {
                Some(p) => {
                    println!("{}", p);
                    p.release();
                }
                None => println!("no rows to compact"),
            }
        }
    }
    Ok(())
}

// ---------- Main ----------

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "partctl failed");
        std::process::exit(1);
    }
}
