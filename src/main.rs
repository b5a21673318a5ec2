//! TSDB Node
//!
//! Opens the partition index, recovers every known partition and runs the
//! compaction and replication worker pools until Ctrl-C.
//!
//! ## Usage
//!
//! ```bash
//! tsdb-node /etc/tsdb/node.toml
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | TSDB_CONFIG | - | Config path when no argument is given |
//! | TSDB_DATA_DIR | from config | Index directory |
//! | TSDB_COMPACTION_THREADS | from config | Compaction workers (max 64) |
//! | TSDB_REPLICATION_THREADS | from config | Replication workers (max 64) |
//! | RUST_LOG | info | Log filter |
//! | LOG_FORMAT | text | `json` for structured output |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tsdb_node::{IndexedPartitionFactory, NodeConfig, TsdbNode};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_names(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .init();
    }
}

fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("TSDB_CONFIG").map(PathBuf::from))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = match config_path() {
        Some(path) => {
            info!("Loading config from {}", path.display());
            NodeConfig::from_file(&path)?
        }
        None => {
            let mut config = NodeConfig::default();
            config.apply_env();
            config
        }
    };

    let node = TsdbNode::from_config(&config, IndexedPartitionFactory)?;
    let stats = node.start(
        config.workers.compaction_threads,
        config.workers.replication_threads,
    )?;
    info!(
        "tsdb-node running on {} ({} partitions recovered)",
        config.data_dir.display(),
        stats.partitions_recovered
    );

    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");

    // Joins worker threads; keep it off the async runtime
    tokio::task::spawn_blocking(move || node.stop()).await??;
    Ok(())
}
