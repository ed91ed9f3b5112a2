//! Gas accounting for contract execution.
//!
//! The reference interpreter charges these costs per instruction; the
//! execution state charges the verification budget for external messages.

use crate::error::{ErrorCode, ExecError};
use crate::types::Gas;

// ── Gas cost constants ──

/// Flat charge for entering a call or deploy.
pub const G_CALL: u64 = 500;

/// Base cost for reading a storage slot.
pub const G_STATE_GET: u64 = 200;

/// Base cost for writing a storage slot.
pub const G_STATE_SET: u64 = 500;

/// Per-byte cost added to storage writes, logs and code deposits.
pub const G_PER_BYTE: u64 = 3;

/// Base cost for emitting a log.
pub const G_LOG: u64 = 100;

/// Base cost for queueing an outbound transaction.
pub const G_SEND: u64 = 1_000;

/// Base cost for `verify_ed25519`.
pub const G_VERIFY_ED25519: u64 = 2_000;

/// Compute the gas cost for a storage write.
pub fn gas_cost_state_set(key_len: usize, val_len: usize) -> u64 {
    let byte_cost = ((key_len + val_len) as u64).saturating_mul(G_PER_BYTE);
    G_STATE_SET.saturating_add(byte_cost)
}

/// Compute the gas cost for a log with `data_len` bytes of payload.
pub fn gas_cost_log(topics: usize, data_len: usize) -> u64 {
    let byte_cost = ((topics * 32 + data_len) as u64).saturating_mul(G_PER_BYTE);
    G_LOG.saturating_add(byte_cost)
}

/// Compute the gas cost for storing `code_len` bytes of contract code.
pub fn gas_cost_code_deposit(code_len: usize) -> u64 {
    G_CALL.saturating_add((code_len as u64).saturating_mul(G_PER_BYTE))
}

/// Tracks gas consumption of one VM invocation.
///
/// Consumption is checked before applying, so on error the consumed count
/// is unchanged and the caller can report exactly what was used.
#[derive(Debug, Clone)]
pub struct GasMeter {
    limit: u64,
    consumed: u64,
}

impl GasMeter {
    pub fn new(limit: Gas) -> Self {
        Self {
            limit: limit.0,
            consumed: 0,
        }
    }

    /// Consume gas. Returns `OutOfGas` if the limit would be exceeded.
    pub fn consume(&mut self, amount: u64) -> Result<(), ExecError> {
        let new_consumed = match self.consumed.checked_add(amount) {
            Some(v) if v <= self.limit => v,
            _ => {
                return Err(ExecError::verbose(
                    ErrorCode::OutOfGas,
                    format!("limit {}, needed {}", self.limit, self.consumed.saturating_add(amount)),
                ));
            }
        };
        self.consumed = new_consumed;
        Ok(())
    }

    /// Burn everything left, as on a failed call.
    pub fn exhaust(&mut self) {
        self.consumed = self.limit;
    }

    pub fn consumed(&self) -> Gas {
        Gas(self.consumed)
    }

    pub fn remaining(&self) -> Gas {
        Gas(self.limit.saturating_sub(self.consumed))
    }

    pub fn limit(&self) -> Gas {
        Gas(self.limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gas_meter_basic() {
        let mut meter = GasMeter::new(Gas(1000));
        meter.consume(100).unwrap();
        assert_eq!(meter.consumed(), Gas(100));
        assert_eq!(meter.remaining(), Gas(900));
        assert_eq!(meter.limit(), Gas(1000));
    }

    #[test]
    fn test_gas_meter_exceeds_limit() {
        let mut meter = GasMeter::new(Gas(100));
        meter.consume(50).unwrap();
        let err = meter.consume(51).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfGas);
        // consumed should not have changed on error
        assert_eq!(meter.consumed(), Gas(50));
    }

    #[test]
    fn test_gas_meter_overflow_protection() {
        let mut meter = GasMeter::new(Gas(u64::MAX));
        meter.consume(u64::MAX - 1).unwrap();
        assert!(meter.consume(2).is_err());
        meter.exhaust();
        assert_eq!(meter.remaining(), Gas::ZERO);
    }

    #[test]
    fn test_gas_costs() {
        assert_eq!(gas_cost_state_set(10, 20), 500 + 90);
        assert_eq!(gas_cost_log(1, 10), 100 + 42 * 3);
        assert_eq!(gas_cost_code_deposit(0), G_CALL);
    }
}
