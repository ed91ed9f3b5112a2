//! `meridian-node`: runs a collator for every shard over an in-memory
//! database until interrupted.
//!
//! Usage: `meridian-node [params.json]`. Log filtering follows `RUST_LOG`,
//! falling back to the `log_level` parameter.

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use meridian_collator::{CollatorParams, Node};
use meridian_storage::MemDb;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let params = match std::env::args().nth(1) {
        Some(path) => CollatorParams::load(&path).with_context(|| format!("loading parameters from {path}"))?,
        None => CollatorParams::default(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&params.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(
        n_shards = params.n_shards,
        topology = %params.topology,
        tick_ms = params.collator_tick_period_ms,
        "starting node"
    );

    let node = Node::new(params, MemDb::shared());
    node.init_zero_states().context("generating zero states")?;

    let cancel = CancellationToken::new();
    let collators = node.spawn_collators(&cancel);

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    cancel.cancel();
    for handle in collators {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "collator task failed");
        }
    }
    Ok(())
}
