//! Folding an execution state into a block.

use meridian_primitives::bloom::create_bloom;
use meridian_primitives::{
    Block, BlockNumber, FatalError, FatalResult, Hash, MerkleTrie, OutboundTransaction, Receipt,
    SmartContract, Transaction, ZERO_HASH,
};

use super::ExecutionState;
use crate::tries::index_key;

/// A built block and the data that went into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockGenerationResult {
    pub block: Block,
    pub block_hash: Hash,
    pub in_txns: Vec<Transaction>,
    pub in_txn_hashes: Vec<Hash>,
    pub out_txns: Vec<Transaction>,
    pub out_txn_hashes: Vec<Hash>,
    pub receipts: Vec<Receipt>,
    pub child_blocks: Vec<Hash>,
}

impl ExecutionState {
    /// Commit every touched account and write the block tries. The state can
    /// still be persisted with [`commit_block`](Self::commit_block) afterwards.
    pub fn build_block(&mut self, block_id: BlockNumber) -> FatalResult<BlockGenerationResult> {
        for (address, account) in self.accounts.iter_mut() {
            if account.is_self_destructed() {
                self.contract_trie.delete(&mut self.tx, address.as_bytes())?;
                continue;
            }
            let contract: SmartContract = account.commit(&mut self.tx)?;
            self.contract_trie
                .set_value(&mut self.tx, address.as_bytes(), &contract)?;
        }
        // Transient storage never outlives the block.
        self.transient.clear();

        let mut child_trie = MerkleTrie::empty();
        for (shard, hash) in &self.child_shard_blocks {
            child_trie.set(&mut self.tx, &shard.to_be_bytes(), hash)?;
        }

        let outs = self.ordered_out_transactions()?;
        let mut receipts = std::mem::take(&mut self.receipts);
        if receipts.len() != self.in_transactions.len() {
            return Err(FatalError::invariant(format!(
                "{} receipts for {} in-transactions",
                receipts.len(),
                self.in_transactions.len()
            )));
        }

        let forwarded = self.out_transactions(&ZERO_HASH).len();
        let mut out_index = forwarded;
        for (receipt, hash) in receipts.iter_mut().zip(&self.in_transaction_hashes) {
            if receipt.txn_hash != *hash {
                return Err(FatalError::invariant(format!(
                    "receipt for {} stands at the position of {}",
                    hex::encode(receipt.txn_hash),
                    hex::encode(hash)
                )));
            }
            let produced = self.out_transactions(hash).len();
            receipt.out_txn_index = out_index as u32;
            receipt.out_txn_num = produced as u32;
            out_index += produced;
        }

        let mut in_trie = MerkleTrie::empty();
        for (i, txn) in self.in_transactions.iter().enumerate() {
            in_trie.set_value(&mut self.tx, &index_key(i as u64), txn)?;
        }
        let mut out_trie = MerkleTrie::empty();
        for (i, out) in outs.iter().enumerate() {
            out_trie.set_value(&mut self.tx, &index_key(i as u64), &out.transaction)?;
        }
        let mut receipt_trie = MerkleTrie::empty();
        for (i, receipt) in receipts.iter().enumerate() {
            receipt_trie.set_value(&mut self.tx, &index_key(i as u64), receipt)?;
        }

        let config_root = if self.shard_id.is_main() {
            self.config.commit(&mut self.tx, self.prev_config_root)?
        } else {
            ZERO_HASH
        };

        let block = Block {
            id: block_id,
            prev_block: self.prev_block,
            smart_contracts_root: self.contract_trie.root(),
            in_transactions_root: in_trie.root(),
            out_transactions_root: out_trie.root(),
            out_transactions_num: outs.len() as u64,
            receipts_root: receipt_trie.root(),
            child_blocks_root_hash: child_trie.root(),
            main_shard_hash: self.main_shard_hash,
            config_root,
            base_fee: self.base_fee,
            gas_used: self.gas_used,
            in_tx_counts: self.in_tx_counts.iter().map(|(s, n)| (*s, *n)).collect(),
            out_tx_counts: self.out_tx_counts.iter().map(|(s, n)| (*s, *n)).collect(),
            logs_bloom: create_bloom(&receipts),
            signature: Vec::new(),
        };
        let block_hash = block.hash(self.shard_id);

        tracing::debug!(
            shard_id = %self.shard_id,
            block_id,
            block_hash = %hex::encode(block_hash),
            in_txns = self.in_transactions.len(),
            out_txns = outs.len(),
            gas_used = %self.gas_used,
            "block built"
        );

        let (out_txn_hashes, out_txns) = outs.into_iter().map(|o| (o.hash, o.transaction)).unzip();
        Ok(BlockGenerationResult {
            block,
            block_hash,
            in_txns: self.in_transactions.clone(),
            in_txn_hashes: self.in_transaction_hashes.clone(),
            out_txns,
            out_txn_hashes,
            receipts,
            child_blocks: self.child_shard_blocks.values().copied().collect(),
        })
    }

    /// Forwarded transactions first, then the outbound transactions of every
    /// in-transaction in order. Newly produced transactions get the next
    /// `tx_id` of their destination shard.
    fn ordered_out_transactions(&mut self) -> FatalResult<Vec<OutboundTransaction>> {
        let mut outs: Vec<OutboundTransaction> = self.out_transactions(&ZERO_HASH).to_vec();
        for hash in &self.in_transaction_hashes {
            let Some(produced) = self.out_transactions.get(hash) else {
                continue;
            };
            for out in produced {
                let mut out = out.clone();
                let dest = out.transaction.to.shard_id();
                let counter = self.out_tx_counts.entry(dest).or_insert(0);
                out.transaction.tx_id = *counter;
                *counter = counter
                    .checked_add(1)
                    .ok_or_else(|| FatalError::invariant(format!("tx id overflow towards shard {dest}")))?;
                out.hash = out.transaction.hash();
                outs.push(out);
            }
        }
        Ok(outs)
    }

    /// Stage the block and the error index in the storage transaction.
    pub fn commit_block(&mut self, result: &BlockGenerationResult) -> FatalResult<()> {
        for (hash, message) in &self.errors {
            self.tx.write_error(self.shard_id, hash, message);
        }
        let hash = self.tx.write_block(self.shard_id, &result.block);
        if hash != result.block_hash {
            return Err(FatalError::invariant("stored block hash differs from the built one"));
        }
        Ok(())
    }
}
