//! Helpers over the index-keyed tries of a block.

use meridian_primitives::{Block, Codec, FatalError, FatalResult, Hash, MerkleTrie, NodeStore, ShardId};

/// Key of the `index`-th item in a block trie.
pub fn index_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

/// The `index`-th item of the trie at `root`.
pub fn fetch_indexed<T: Codec, S: NodeStore + ?Sized>(
    store: &S,
    root: Hash,
    index: u64,
) -> FatalResult<Option<T>> {
    MerkleTrie::new(root).get_value(store, &index_key(index))
}

/// Items `0..count` of the trie at `root`. A missing item is an error.
pub fn collect_indexed<T: Codec, S: NodeStore + ?Sized>(
    store: &S,
    root: Hash,
    count: u64,
) -> FatalResult<Vec<T>> {
    let trie = MerkleTrie::new(root);
    (0..count)
        .map(|i| {
            trie.get_value(store, &index_key(i))?
                .ok_or_else(|| FatalError::not_found(format!("trie item {i}")))
        })
        .collect()
}

/// Every item of the trie at `root`, in index order.
pub fn collect_all<T: Codec, S: NodeStore + ?Sized>(store: &S, root: Hash) -> FatalResult<Vec<T>> {
    let mut items = Vec::new();
    let trie = MerkleTrie::new(root);
    let mut i = 0u64;
    while let Some(item) = trie.get_value(store, &index_key(i))? {
        items.push(item);
        i += 1;
    }
    Ok(items)
}

/// Child shard block hashes recorded in a main-shard block, by shard id.
pub fn child_blocks<S: NodeStore + ?Sized>(store: &S, block: &Block) -> FatalResult<Vec<(ShardId, Hash)>> {
    let trie = MerkleTrie::new(block.child_blocks_root_hash);
    let mut out = Vec::new();
    for (key, value) in trie.entries(store)? {
        let shard: [u8; 4] = key
            .as_slice()
            .try_into()
            .map_err(|_| FatalError::invariant("child block key is not a shard id"))?;
        let hash: Hash = value
            .as_slice()
            .try_into()
            .map_err(|_| FatalError::invariant("child block value is not a hash"))?;
        out.push((ShardId(u32::from_be_bytes(shard)), hash));
    }
    out.sort_by_key(|(shard, _)| *shard);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_primitives::{Value, ZERO_HASH};
    use std::collections::BTreeMap;

    #[test]
    fn test_collect_in_index_order() {
        let mut store: BTreeMap<Hash, Vec<u8>> = BTreeMap::new();
        let mut trie = MerkleTrie::empty();
        for i in 0..12u64 {
            trie.set_value(&mut store, &index_key(i), &Value(i as u128 * 7)).unwrap();
        }
        let all: Vec<Value> = collect_all(&store, trie.root()).unwrap();
        assert_eq!(all.len(), 12);
        assert_eq!(all[11], Value(77));

        let first: Vec<Value> = collect_indexed(&store, trie.root(), 3).unwrap();
        assert_eq!(first, vec![Value(0), Value(7), Value(14)]);
        assert!(collect_indexed::<Value, _>(&store, trie.root(), 13).is_err());
        assert_eq!(fetch_indexed::<Value, _>(&store, ZERO_HASH, 0).unwrap(), None);
    }
}
