//! Transaction types.
//!
//! A transaction is an immutable digest (what the sender signs) plus routing
//! and async-call annotations. Flag bits classify it along independent axes:
//! internal vs external, and kind (deploy / execution / refund / bounce /
//! response). A request is an execution carrying a non-zero request id.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::crypto::hash_blake3;
use crate::error::{ErrorCode, ExecError};
use crate::types::{Address, ChainId, Gas, Hash, Seqno, ShardId, TokenId, Value, DEFAULT_CHAIN_ID};

// ── Flags ──

/// Bit set classifying a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransactionFlags(pub u8);

impl TransactionFlags {
    pub const INTERNAL: u8 = 1 << 0;
    pub const DEPLOY: u8 = 1 << 1;
    pub const REFUND: u8 = 1 << 2;
    pub const BOUNCE: u8 = 1 << 3;
    pub const RESPONSE: u8 = 1 << 4;

    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn with(self, bit: u8) -> Self {
        Self(self.0 | bit)
    }
}

impl fmt::Display for TransactionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::INTERNAL, "Internal"),
            (Self::DEPLOY, "Deploy"),
            (Self::REFUND, "Refund"),
            (Self::BOUNCE, "Bounce"),
            (Self::RESPONSE, "Response"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.has(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", set.join(", "))
    }
}

// ── Forwarding ──

/// How leftover fee credit is distributed to an outbound transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ForwardKind {
    /// Split what is left evenly among all `Remaining` messages.
    #[default]
    Remaining = 0,
    /// `fee_credit` holds a percentage (0..=100) of the pool after `Value` draws.
    Percentage = 1,
    /// `fee_credit` is a fixed amount drawn first.
    Value = 2,
    /// Not part of forwarding (pass-through and refund messages).
    None = 3,
}

impl ForwardKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Remaining),
            1 => Some(Self::Percentage),
            2 => Some(Self::Value),
            3 => Some(Self::None),
            _ => None,
        }
    }
}

/// A token amount attached to a transaction or held by an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenBalance {
    pub token: TokenId,
    pub balance: Value,
}

/// One pending hop of an async request chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncRequestInfo {
    pub id: u64,
    pub caller: Address,
}

// ── Transaction ──

/// A ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transaction {
    // Digest: the part an external sender signs.
    pub flags: TransactionFlags,
    pub fee_credit: Value,
    pub max_priority_fee_per_gas: Value,
    pub max_fee_per_gas: Value,
    pub to: Address,
    pub chain_id: ChainId,
    pub seqno: Seqno,
    pub data: Vec<u8>,

    pub from: Address,
    /// Position in the (source shard → this shard) message stream.
    pub tx_id: u64,
    pub refund_to: Address,
    pub bounce_to: Address,
    pub value: Value,
    pub token: Vec<TokenBalance>,
    pub request_id: u64,
    pub request_chain: Vec<AsyncRequestInfo>,
    pub signature: Vec<u8>,
}

impl Transaction {
    pub fn is_internal(&self) -> bool {
        self.flags.has(TransactionFlags::INTERNAL)
    }

    pub fn is_external(&self) -> bool {
        !self.is_internal()
    }

    pub fn is_deploy(&self) -> bool {
        self.flags.has(TransactionFlags::DEPLOY)
    }

    pub fn is_refund(&self) -> bool {
        self.flags.has(TransactionFlags::REFUND)
    }

    pub fn is_bounce(&self) -> bool {
        self.flags.has(TransactionFlags::BOUNCE)
    }

    pub fn is_response(&self) -> bool {
        self.flags.has(TransactionFlags::RESPONSE)
    }

    pub fn is_request(&self) -> bool {
        self.request_id != 0 && !self.is_response()
    }

    /// Execution transactions run contract code (calls, requests, responses, bounces).
    pub fn is_execution(&self) -> bool {
        !self.is_deploy() && !self.is_refund()
    }

    /// System transactions are internal messages with no sender; nobody pays for them.
    pub fn is_system(&self) -> bool {
        self.is_internal() && self.from.is_empty()
    }

    /// Reject contradictory flag combinations.
    pub fn verify_flags(&self) -> Result<(), ExecError> {
        let f = self.flags;
        let conflicting = (f.has(TransactionFlags::DEPLOY)
            && (f.has(TransactionFlags::REFUND) || f.has(TransactionFlags::RESPONSE)))
            || (f.has(TransactionFlags::REFUND) && f.has(TransactionFlags::BOUNCE))
            || (f.has(TransactionFlags::RESPONSE) && f.has(TransactionFlags::REFUND));
        if conflicting {
            return Err(ExecError::verbose(
                ErrorCode::InvalidTransactionFlags,
                f.to_string(),
            ));
        }
        Ok(())
    }

    /// Hash over the full canonical encoding.
    pub fn hash(&self) -> Hash {
        hash_blake3(&self.encode())
    }

    /// Hash over the digest fields only; what external senders sign.
    pub fn signing_hash(&self) -> Hash {
        hash_blake3(&crate::codec::encode_transaction_digest(self))
    }

    /// Wrap into an outbound transaction, hashing it once.
    pub fn to_outbound(self, forward_kind: ForwardKind) -> OutboundTransaction {
        let hash = self.hash();
        OutboundTransaction {
            transaction: self,
            hash,
            forward_kind,
        }
    }
}

/// A transaction produced by execution, waiting to leave the shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundTransaction {
    pub transaction: Transaction,
    pub hash: Hash,
    pub forward_kind: ForwardKind,
}

// ── Payloads for outgoing messages ──

/// Kind of an outgoing internal message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionKind {
    #[default]
    Execution,
    Deploy,
    Refund,
    Response,
}

/// What a contract (or the execution state itself) asks to send.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InternalTransactionPayload {
    pub kind: TransactionKind,
    pub bounce: bool,
    pub fee_credit: Value,
    pub forward_kind: ForwardKind,
    pub to: Address,
    pub refund_to: Address,
    pub bounce_to: Address,
    pub token: Vec<TokenBalance>,
    pub value: Value,
    pub data: Vec<u8>,
    /// Opaque callback context kept by the caller for non-await requests.
    pub request_context: Vec<u8>,
}

impl InternalTransactionPayload {
    pub fn to_transaction(&self, from: Address, seqno: Seqno) -> Transaction {
        let mut flags = TransactionFlags::new(TransactionFlags::INTERNAL);
        match self.kind {
            TransactionKind::Execution => {}
            TransactionKind::Deploy => flags = flags.with(TransactionFlags::DEPLOY),
            TransactionKind::Refund => flags = flags.with(TransactionFlags::REFUND),
            TransactionKind::Response => flags = flags.with(TransactionFlags::RESPONSE),
        }
        if self.bounce {
            flags = flags.with(TransactionFlags::BOUNCE);
        }
        Transaction {
            flags,
            fee_credit: self.fee_credit,
            to: self.to,
            chain_id: DEFAULT_CHAIN_ID,
            seqno,
            data: self.data.clone(),
            from,
            refund_to: self.refund_to,
            bounce_to: self.bounce_to,
            value: self.value,
            token: self.token.clone(),
            ..Default::default()
        }
    }
}

/// Body of a response transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AsyncResponsePayload {
    pub success: bool,
    pub return_data: Vec<u8>,
}

/// Continuation stored by a contract waiting on a request's response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AsyncContext {
    pub is_await: bool,
    pub data: Vec<u8>,
    pub response_processing_gas: Gas,
}

// ── Deploy payload ──

/// Length of the salt trailing deploy code.
pub const DEPLOY_SALT_LEN: usize = 32;

/// Deploy transaction body: contract code followed by a 32-byte salt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployPayload(Vec<u8>);

impl DeployPayload {
    pub fn new(code: &[u8], salt: Hash) -> Self {
        let mut bytes = Vec::with_capacity(code.len() + DEPLOY_SALT_LEN);
        bytes.extend_from_slice(code);
        bytes.extend_from_slice(&salt);
        Self(bytes)
    }

    /// Returns `None` if the data is too short to hold a salt.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < DEPLOY_SALT_LEN {
            return None;
        }
        Some(Self(data.to_vec()))
    }

    pub fn code(&self) -> &[u8] {
        &self.0[..self.0.len() - DEPLOY_SALT_LEN]
    }

    pub fn salt(&self) -> &[u8] {
        &self.0[self.0.len() - DEPLOY_SALT_LEN..]
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Address a deploy payload must be sent to on `shard`.
pub fn create_address(shard: ShardId, payload: &DeployPayload) -> Address {
    Address::from_shard_and_hash(shard, &hash_blake3(payload.bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transaction {
        Transaction {
            flags: TransactionFlags::new(TransactionFlags::INTERNAL),
            fee_credit: Value(1_000),
            to: Address::from_shard_and_hash(ShardId(1), &hash_blake3(b"to")),
            from: Address::from_shard_and_hash(ShardId(2), &hash_blake3(b"from")),
            seqno: 4,
            data: vec![1, 2, 3],
            ..Default::default()
        }
    }

    #[test]
    fn test_flag_predicates() {
        let mut txn = sample();
        assert!(txn.is_internal());
        assert!(txn.is_execution());
        assert!(!txn.is_request());

        txn.request_id = 9;
        assert!(txn.is_request());
        txn.flags = txn.flags.with(TransactionFlags::RESPONSE);
        assert!(!txn.is_request());
        assert!(txn.is_response());
    }

    #[test]
    fn test_verify_flags_rejects_conflicts() {
        let mut txn = sample();
        assert!(txn.verify_flags().is_ok());
        txn.flags = TransactionFlags::new(TransactionFlags::DEPLOY | TransactionFlags::REFUND);
        let err = txn.verify_flags().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransactionFlags);
    }

    #[test]
    fn test_hash_covers_non_digest_fields() {
        let a = sample();
        let mut b = sample();
        b.tx_id = 1;
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.signing_hash(), b.signing_hash());
    }

    #[test]
    fn test_deploy_payload_and_address() {
        let payload = DeployPayload::new(b"code", [7u8; 32]);
        assert_eq!(payload.code(), b"code");
        assert_eq!(payload.salt(), &[7u8; 32]);
        assert!(DeployPayload::parse(&[0u8; 31]).is_none());

        let addr = create_address(ShardId(2), &payload);
        assert_eq!(addr.shard_id(), ShardId(2));
        let other = create_address(ShardId(2), &DeployPayload::new(b"code", [8u8; 32]));
        assert_ne!(addr, other);
    }

    #[test]
    fn test_payload_to_transaction_flags() {
        let payload = InternalTransactionPayload {
            kind: TransactionKind::Refund,
            to: sample().to,
            value: Value(5),
            ..Default::default()
        };
        let txn = payload.to_transaction(sample().from, 3);
        assert!(txn.is_internal());
        assert!(txn.is_refund());
        assert_eq!(txn.seqno, 3);
        assert_eq!(txn.value, Value(5));
    }
}
