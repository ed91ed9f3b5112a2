//! 2048-bit logs bloom filter.
//!
//! Every log contributes its emitting address and each topic. A value sets
//! three bits chosen from the first six bytes of its SHA-256 digest.

use crate::block::{Log, Receipt};
use crate::crypto::hash_sha256;

/// Size of the bloom filter in bytes.
pub const BLOOM_BYTE_LEN: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Bloom(pub [u8; BLOOM_BYTE_LEN]);

impl Default for Bloom {
    fn default() -> Self {
        Self([0u8; BLOOM_BYTE_LEN])
    }
}

impl core::fmt::Debug for Bloom {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Bloom({})", hex::encode(self.0))
    }
}

fn bloom_positions(data: &[u8]) -> [(usize, u8); 3] {
    let digest = hash_sha256(data);
    let mut out = [(0usize, 0u8); 3];
    for (i, slot) in out.iter_mut().enumerate() {
        let bit = (u16::from_be_bytes([digest[2 * i], digest[2 * i + 1]]) & 0x07ff) as usize;
        *slot = (BLOOM_BYTE_LEN - 1 - bit / 8, 1u8 << (bit % 8));
    }
    out
}

impl Bloom {
    pub fn add(&mut self, data: &[u8]) {
        for (byte, mask) in bloom_positions(data) {
            self.0[byte] |= mask;
        }
    }

    /// May return false positives, never false negatives.
    pub fn test(&self, data: &[u8]) -> bool {
        bloom_positions(data)
            .iter()
            .all(|(byte, mask)| self.0[*byte] & mask == *mask)
    }

    pub fn add_log(&mut self, log: &Log) {
        self.add(log.address.as_bytes());
        for topic in &log.topics {
            self.add(topic);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

/// Bloom over every log of every receipt.
pub fn create_bloom(receipts: &[Receipt]) -> Bloom {
    let mut bloom = Bloom::default();
    for receipt in receipts {
        for log in &receipt.logs {
            bloom.add_log(log);
        }
    }
    bloom
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;

    #[test]
    fn test_bloom_membership() {
        let mut bloom = Bloom::default();
        assert!(bloom.is_empty());
        bloom.add(b"transfer");
        assert!(bloom.test(b"transfer"));
        assert!(!bloom.is_empty());
    }

    #[test]
    fn test_create_bloom_from_receipts() {
        let log = Log {
            address: Address([9u8; 20]),
            topics: vec![[1u8; 32]],
            data: vec![],
        };
        let receipt = Receipt {
            logs: vec![log],
            ..Default::default()
        };
        let bloom = create_bloom(&[receipt]);
        assert!(bloom.test(&[9u8; 20]));
        assert!(bloom.test(&[1u8; 32]));
        assert!(create_bloom(&[]).is_empty());
    }
}
