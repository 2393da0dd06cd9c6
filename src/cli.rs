use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "fabricd",
    about = "Peer-to-peer coordination fabric node for autonomous agents",
    version,
    long_about = None,
)]
pub struct Cli {
    /// Path to config file (overrides the layered auto-discovery search).
    #[arg(long, short = 'c', env = "FABRIC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print the fully merged configuration and exit.
    #[arg(long)]
    pub show_config: bool,

    /// Verify the on-disk event log's hash chain and exit.
    #[arg(long)]
    pub verify_log: bool,
}
