//! Runs one member of a Raft cluster described by a JSON config file.
//!
//! ```bash
//! quorum-server --config cluster.json --id 0
//! quorum-server --config cluster.json --id 1
//! quorum-server --config cluster.json --id 2
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use quorum_common::config::load_config;
use quorum_raft::RaftNode;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a Raft cluster member")]
struct Args {
    /// Cluster config (JSON): node list plus optional timing block
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: PathBuf,

    /// This node's id; must appear in the config
    #[arg(long)]
    id: u64,

    /// Listen address override, e.g. 0.0.0.0:7001. Defaults to the config entry.
    #[arg(long, value_hint = ValueHint::Hostname)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let me = config
        .node(args.id)
        .with_context(|| format!("node {} is not in the cluster config", args.id))?;
    let bind = args.bind.clone().unwrap_or_else(|| me.addr());

    let node = RaftNode::with_config(args.id, config.peers_of(args.id), config.timing.clone());
    let mut server = {
        let node = node.clone();
        tokio::spawn(async move { node.start_server(&bind).await })
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("waiting for ctrl-c")?;
            info!(node = args.id, "shutdown requested");
        }
        res = &mut server => {
            // Listener failed before any signal
            node.stop();
            return match res.context("server task panicked")? {
                Ok(()) => Ok(()),
                Err(err) => {
                    error!(node = args.id, %err, "server exited");
                    Err(err.into())
                }
            };
        }
    }

    node.stop();
    server
        .await
        .context("server task panicked")?
        .context("server exited with error")?;
    Ok(())
}
