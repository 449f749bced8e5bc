//! CLI definitions using clap.

use std::path::PathBuf;

use clap::Parser;

/// Fleet - reconcile pods across many clusters
#[derive(Parser, Debug)]
#[command(name = "fleet")]
#[command(version)]
#[command(about = "Watch pods in several in-memory clusters and reconcile them")]
pub struct Cli {
    /// Cluster names to create and watch
    #[arg(short, long, value_delimiter = ',', default_value = "test")]
    pub clusters: Vec<String>,

    /// Pods seeded into each cluster
    #[arg(short, long, default_value_t = 3)]
    pub pods: usize,

    /// Namespace of the seeded pods
    #[arg(short, long, default_value = "default")]
    pub namespace: String,

    /// Only reconcile pods carrying these labels, e.g. "app=web,tier!=db"
    #[arg(short = 'l', long)]
    pub selector: Option<String>,

    /// Concurrent workers (overrides the config file)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Worker pause after a reconcile error, in milliseconds (overrides the
    /// config file)
    #[arg(long)]
    pub jitter_ms: Option<u64>,

    /// Cache resync period in seconds; 0 disables resync
    #[arg(long, default_value_t = 10)]
    pub resync_secs: u64,

    /// Stop after this many seconds
    #[arg(long, default_value_t = 5)]
    pub run_for: u64,

    /// Controller configuration file (TOML, or JSON with a .json extension)
    #[arg(long)]
    pub config: Option<PathBuf>,
}
