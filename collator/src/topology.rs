//! Which shards a collator reads outbound transactions from.
//!
//! Every shard drains the outbound queues of its neighbors. With the
//! trivial topology every shard is a neighbor of every other one and
//! transactions travel in one hop; with the line topology shards only see
//! their immediate neighbors and relay transactions along the line.

use serde::{Deserialize, Serialize};

use meridian_primitives::ShardId;

/// Neighbor relation between shards.
pub trait ShardTopology: Send + Sync {
    /// Shards whose outbound transactions `shard` consumes, in intake order.
    fn neighbors(&self, shard: ShardId, n_shards: u32, include_self: bool) -> Vec<ShardId>;

    /// Whether `current`, reading a transaction from neighbor `from` that
    /// is addressed to `dest`, must forward it.
    fn should_propagate(&self, from: ShardId, current: ShardId, dest: ShardId) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    /// Fully connected: no forwarding.
    #[default]
    Trivial,
    /// Shards `0 - 1 - 2 - ...` in a line.
    Line,
}

impl ShardTopology for TopologyKind {
    fn neighbors(&self, shard: ShardId, n_shards: u32, include_self: bool) -> Vec<ShardId> {
        match self {
            Self::Trivial => (0..n_shards)
                .map(ShardId)
                .filter(|s| include_self || *s != shard)
                .collect(),
            Self::Line => {
                let mut out = Vec::with_capacity(3);
                if shard.0 > 0 {
                    out.push(ShardId(shard.0 - 1));
                }
                if include_self {
                    out.push(shard);
                }
                if shard.0 + 1 < n_shards {
                    out.push(ShardId(shard.0 + 1));
                }
                out
            }
        }
    }

    fn should_propagate(&self, from: ShardId, current: ShardId, dest: ShardId) -> bool {
        match self {
            Self::Trivial => false,
            Self::Line => {
                (from < current && current < dest) || (from > current && current > dest)
            }
        }
    }
}

impl std::fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trivial => f.write_str("trivial"),
            Self::Line => f.write_str("line"),
        }
    }
}
