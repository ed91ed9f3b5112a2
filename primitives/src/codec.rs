//! Deterministic binary encoding for everything persisted or hashed.
//!
//! Encoding format:
//! - Fixed-size fields (Hash, Address, u64, u32, u128, bool) are written directly
//! - Integers are little-endian
//! - Variable-length fields (`Vec<u8>`) are length-prefixed (u32 LE)
//! - Repeated fields are count-prefixed (u32 LE) then concatenated
//!
//! Hashes are computed over these bytes, so the layout of a type must never
//! change once it is stored.

use crate::block::{Block, CollatorState, Log, Neighbor, Receipt, SmartContract};
use crate::bloom::{Bloom, BLOOM_BYTE_LEN};
use crate::error::ErrorCode;
use crate::transaction::{
    AsyncContext, AsyncRequestInfo, AsyncResponsePayload, TokenBalance, Transaction,
    TransactionFlags,
};
use crate::types::{Address, Gas, Hash, ShardId, Value, ADDRESS_LEN};

/// Decoding failure. Stored bytes that fail to decode are corrupt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of data")]
    UnexpectedEnd,

    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: u64 },

    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

/// A cursor for reading bytes during decoding.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if n > self.remaining() {
            return Err(CodecError::UnexpectedEnd);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_u128(&mut self) -> Result<u128, CodecError> {
        Ok(u128::from_le_bytes(self.read_array()?))
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(CodecError::InvalidValue {
                field: "bool",
                value: b as u64,
            }),
        }
    }

    pub fn read_hash(&mut self) -> Result<Hash, CodecError> {
        self.read_array()
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_u32()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    /// Count-prefixed sequence of `T`.
    pub fn read_vec<T: Codec>(&mut self) -> Result<Vec<T>, CodecError> {
        let count = self.read_u32()? as usize;
        // Cap the preallocation; a corrupt count must not trigger a huge allocation.
        let mut out = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            out.push(T::decode_from(self)?);
        }
        Ok(out)
    }
}

// ── Encoding helpers ──

pub fn write_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_u128(buf: &mut Vec<u8>, v: u128) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn write_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(u8::from(v));
}

pub fn write_hash(buf: &mut Vec<u8>, h: &Hash) {
    buf.extend_from_slice(h);
}

pub fn write_var_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_u32(buf, data.len() as u32);
    buf.extend_from_slice(data);
}

pub fn write_vec<T: Codec>(buf: &mut Vec<u8>, items: &[T]) {
    write_u32(buf, items.len() as u32);
    for item in items {
        item.encode_to(buf);
    }
}

// ── Codec trait ──

/// Types with a canonical byte form.
pub trait Codec: Sized {
    fn encode_to(&self, buf: &mut Vec<u8>);

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError>;

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        self.encode_to(&mut buf);
        buf
    }

    /// Decode a complete value. Trailing bytes are an error.
    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(data);
        let value = Self::decode_from(&mut r)?;
        match r.remaining() {
            0 => Ok(value),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

impl Codec for u64 {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_u64(buf, *self);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.read_u64()
    }
}

impl Codec for Hash {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_hash(buf, self);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        r.read_hash()
    }
}

impl Codec for Value {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_u128(buf, self.0);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Value(r.read_u128()?))
    }
}

impl Codec for Gas {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_u64(buf, self.0);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Gas(r.read_u64()?))
    }
}

impl Codec for Address {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Address(r.read_array::<ADDRESS_LEN>()?))
    }
}

impl Codec for ShardId {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.0);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(ShardId(r.read_u32()?))
    }
}

impl Codec for Bloom {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.0);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Bloom(r.read_array::<BLOOM_BYTE_LEN>()?))
    }
}

impl Codec for TokenBalance {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.token.encode_to(buf);
        self.balance.encode_to(buf);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(TokenBalance {
            token: Address::decode_from(r)?,
            balance: Value::decode_from(r)?,
        })
    }
}

impl Codec for AsyncRequestInfo {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_u64(buf, self.id);
        self.caller.encode_to(buf);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(AsyncRequestInfo {
            id: r.read_u64()?,
            caller: Address::decode_from(r)?,
        })
    }
}

// ── Transaction encoding ──

fn encode_digest_to(buf: &mut Vec<u8>, txn: &Transaction) {
    write_u8(buf, txn.flags.0);
    txn.fee_credit.encode_to(buf);
    txn.max_priority_fee_per_gas.encode_to(buf);
    txn.max_fee_per_gas.encode_to(buf);
    txn.to.encode_to(buf);
    write_u64(buf, txn.chain_id);
    write_u64(buf, txn.seqno);
    write_var_bytes(buf, &txn.data);
}

/// Bytes an external sender signs: the digest fields only.
pub fn encode_transaction_digest(txn: &Transaction) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128 + txn.data.len());
    encode_digest_to(&mut buf, txn);
    buf
}

impl Codec for Transaction {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        encode_digest_to(buf, self);
        self.from.encode_to(buf);
        write_u64(buf, self.tx_id);
        self.refund_to.encode_to(buf);
        self.bounce_to.encode_to(buf);
        self.value.encode_to(buf);
        write_vec(buf, &self.token);
        write_u64(buf, self.request_id);
        write_vec(buf, &self.request_chain);
        write_var_bytes(buf, &self.signature);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Transaction {
            flags: TransactionFlags::new(r.read_u8()?),
            fee_credit: Value::decode_from(r)?,
            max_priority_fee_per_gas: Value::decode_from(r)?,
            max_fee_per_gas: Value::decode_from(r)?,
            to: Address::decode_from(r)?,
            chain_id: r.read_u64()?,
            seqno: r.read_u64()?,
            data: r.read_var_bytes()?,
            from: Address::decode_from(r)?,
            tx_id: r.read_u64()?,
            refund_to: Address::decode_from(r)?,
            bounce_to: Address::decode_from(r)?,
            value: Value::decode_from(r)?,
            token: r.read_vec()?,
            request_id: r.read_u64()?,
            request_chain: r.read_vec()?,
            signature: r.read_var_bytes()?,
        })
    }
}

impl Codec for AsyncContext {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_bool(buf, self.is_await);
        write_var_bytes(buf, &self.data);
        self.response_processing_gas.encode_to(buf);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(AsyncContext {
            is_await: r.read_bool()?,
            data: r.read_var_bytes()?,
            response_processing_gas: Gas::decode_from(r)?,
        })
    }
}

impl Codec for AsyncResponsePayload {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_bool(buf, self.success);
        write_var_bytes(buf, &self.return_data);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(AsyncResponsePayload {
            success: r.read_bool()?,
            return_data: r.read_var_bytes()?,
        })
    }
}

// ── Block encoding ──

fn write_counts(buf: &mut Vec<u8>, counts: &[(ShardId, u64)]) {
    write_u32(buf, counts.len() as u32);
    for (shard, count) in counts {
        shard.encode_to(buf);
        write_u64(buf, *count);
    }
}

fn read_counts(r: &mut Reader<'_>) -> Result<Vec<(ShardId, u64)>, CodecError> {
    let n = r.read_u32()? as usize;
    let mut out = Vec::with_capacity(n.min(r.remaining()));
    for _ in 0..n {
        out.push((ShardId::decode_from(r)?, r.read_u64()?));
    }
    Ok(out)
}

fn encode_header_to(buf: &mut Vec<u8>, block: &Block) {
    write_u64(buf, block.id);
    write_hash(buf, &block.prev_block);
    write_hash(buf, &block.smart_contracts_root);
    write_hash(buf, &block.in_transactions_root);
    write_hash(buf, &block.out_transactions_root);
    write_u64(buf, block.out_transactions_num);
    write_hash(buf, &block.receipts_root);
    write_hash(buf, &block.child_blocks_root_hash);
    write_hash(buf, &block.main_shard_hash);
    write_hash(buf, &block.config_root);
    block.base_fee.encode_to(buf);
    block.gas_used.encode_to(buf);
    write_counts(buf, &block.in_tx_counts);
    write_counts(buf, &block.out_tx_counts);
    block.logs_bloom.encode_to(buf);
}

/// Header bytes the block hash is computed over. Excludes the signature.
pub fn encode_block_header(block: &Block) -> Vec<u8> {
    let mut buf = Vec::with_capacity(640);
    encode_header_to(&mut buf, block);
    buf
}

impl Codec for Block {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        encode_header_to(buf, self);
        write_var_bytes(buf, &self.signature);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Block {
            id: r.read_u64()?,
            prev_block: r.read_hash()?,
            smart_contracts_root: r.read_hash()?,
            in_transactions_root: r.read_hash()?,
            out_transactions_root: r.read_hash()?,
            out_transactions_num: r.read_u64()?,
            receipts_root: r.read_hash()?,
            child_blocks_root_hash: r.read_hash()?,
            main_shard_hash: r.read_hash()?,
            config_root: r.read_hash()?,
            base_fee: Value::decode_from(r)?,
            gas_used: Gas::decode_from(r)?,
            in_tx_counts: read_counts(r)?,
            out_tx_counts: read_counts(r)?,
            logs_bloom: Bloom::decode_from(r)?,
            signature: r.read_var_bytes()?,
        })
    }
}

impl Codec for Log {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.address.encode_to(buf);
        write_vec(buf, &self.topics);
        write_var_bytes(buf, &self.data);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Log {
            address: Address::decode_from(r)?,
            topics: r.read_vec()?,
            data: r.read_var_bytes()?,
        })
    }
}

impl Codec for Receipt {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_bool(buf, self.success);
        write_u32(buf, self.status.as_u32());
        self.gas_used.encode_to(buf);
        self.forwarded.encode_to(buf);
        write_hash(buf, &self.txn_hash);
        write_vec(buf, &self.logs);
        write_u32(buf, self.out_txn_index);
        write_u32(buf, self.out_txn_num);
        self.contract_address.encode_to(buf);
        write_u32(buf, self.failed_pc);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let success = r.read_bool()?;
        let raw_status = r.read_u32()?;
        let status = ErrorCode::from_u32(raw_status).ok_or(CodecError::InvalidValue {
            field: "receipt status",
            value: raw_status as u64,
        })?;
        Ok(Receipt {
            success,
            status,
            gas_used: Gas::decode_from(r)?,
            forwarded: Value::decode_from(r)?,
            txn_hash: r.read_hash()?,
            logs: r.read_vec()?,
            out_txn_index: r.read_u32()?,
            out_txn_num: r.read_u32()?,
            contract_address: Address::decode_from(r)?,
            failed_pc: r.read_u32()?,
        })
    }
}

impl Codec for Neighbor {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.shard_id.encode_to(buf);
        write_u64(buf, self.block_number);
        write_u64(buf, self.transaction_index);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Neighbor {
            shard_id: ShardId::decode_from(r)?,
            block_number: r.read_u64()?,
            transaction_index: r.read_u64()?,
        })
    }
}

impl Codec for CollatorState {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        write_vec(buf, &self.neighbors);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(CollatorState {
            neighbors: r.read_vec()?,
        })
    }
}

impl Codec for SmartContract {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.address.encode_to(buf);
        self.balance.encode_to(buf);
        write_hash(buf, &self.storage_root);
        write_hash(buf, &self.token_root);
        write_hash(buf, &self.async_context_root);
        write_hash(buf, &self.code_hash);
        write_u64(buf, self.seqno);
        write_u64(buf, self.ext_seqno);
        write_u64(buf, self.request_id);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(SmartContract {
            address: Address::decode_from(r)?,
            balance: Value::decode_from(r)?,
            storage_root: r.read_hash()?,
            token_root: r.read_hash()?,
            async_context_root: r.read_hash()?,
            code_hash: r.read_hash()?,
            seqno: r.read_u64()?,
            ext_seqno: r.read_u64()?,
            request_id: r.read_u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_blake3;
    use crate::transaction::TransactionFlags;

    fn sample_transaction() -> Transaction {
        Transaction {
            flags: TransactionFlags::new(TransactionFlags::INTERNAL | TransactionFlags::BOUNCE),
            fee_credit: Value(5_000),
            to: Address::from_shard_and_hash(ShardId(1), &hash_blake3(b"to")),
            from: Address::from_shard_and_hash(ShardId(2), &hash_blake3(b"from")),
            seqno: 12,
            tx_id: 3,
            data: b"payload".to_vec(),
            value: Value(u128::MAX),
            token: vec![TokenBalance {
                token: Address([4u8; 20]),
                balance: Value(77),
            }],
            request_id: 8,
            request_chain: vec![AsyncRequestInfo {
                id: 7,
                caller: Address([5u8; 20]),
            }],
            signature: vec![9; 64],
            ..Default::default()
        }
    }

    #[test]
    fn test_transaction_roundtrip() {
        let txn = sample_transaction();
        let decoded = Transaction::decode(&txn.encode()).unwrap();
        assert_eq!(decoded, txn);
    }

    #[test]
    fn test_block_roundtrip_with_counts() {
        let mut block = Block {
            id: 9,
            prev_block: [1u8; 32],
            base_fee: Value(10),
            gas_used: Gas(500),
            in_tx_counts: vec![(ShardId(2), 4)],
            out_tx_counts: vec![(ShardId(1), 2), (ShardId(3), 1)],
            signature: vec![1, 2],
            ..Default::default()
        };
        block.logs_bloom.add(b"topic");
        let decoded = Block::decode(&block.encode()).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_header_excludes_signature() {
        let block = Block {
            id: 1,
            signature: vec![0xff; 96],
            ..Default::default()
        };
        let header = encode_block_header(&block);
        assert_eq!(header.len() + 4 + 96, block.encode().len());
    }

    #[test]
    fn test_receipt_rejects_unknown_status() {
        let mut bytes = Receipt::default().encode();
        // status follows the 1-byte success flag
        bytes[1..5].copy_from_slice(&999u32.to_le_bytes());
        let err = Receipt::decode(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::InvalidValue { value: 999, .. }));
    }

    #[test]
    fn test_decode_truncated_data() {
        let bytes = sample_transaction().encode();
        assert_eq!(
            Transaction::decode(&bytes[..bytes.len() - 1]),
            Err(CodecError::UnexpectedEnd)
        );
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut bytes = 5u64.encode();
        bytes.push(0);
        assert_eq!(u64::decode(&bytes), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn test_digest_is_prefix_of_full_encoding() {
        let txn = sample_transaction();
        let digest = encode_transaction_digest(&txn);
        assert!(txn.encode().starts_with(&digest));
    }
}
