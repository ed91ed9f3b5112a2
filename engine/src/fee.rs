//! Base-fee market.
//!
//! The next block's base fee follows the previous block's utilization through
//! the difference of two logistic curves centered at 25% and 75% of the gas
//! limit. At exactly 50% the curves cancel and the fee is unchanged; above it
//! the fee rises, below it the fee falls, never under [`DEFAULT_GAS_PRICE`].
//!
//! All arithmetic is fixed point over [`BigInt`] with a resolution of 10^-30,
//! so every node computes the same fee.

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use meridian_primitives::{
    Block, ErrorCode, ExecError, Gas, Transaction, Value, DEFAULT_GAS_LIMIT, DEFAULT_GAS_PRICE,
};

const SCALE_DIGITS: u32 = 30;
const SMOOTHING: u32 = 5;
const CENTER_LOW: u32 = 25;
const CENTER_HIGH: u32 = 75;
/// The adjustment factor is 1 / 101.34, kept as 10000 / 1013400.
const ADJUSTMENT_DENOMINATOR: u32 = 1_013_400;
const ADJUSTMENT_NUMERATOR: u32 = 10_000;

/// Computes the base fee of the next block.
pub trait FeeCalculator: Send + Sync {
    fn calculate_base_fee(&self, prev_block: &Block) -> Value;
}

/// Fixed-point logistic fee curve.
#[derive(Debug, Clone)]
pub struct MainFeeCalculator {
    scale: BigInt,
    max_diff: BigInt,
}

impl Default for MainFeeCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl MainFeeCalculator {
    pub fn new() -> Self {
        let scale = BigInt::from(10u8).pow(SCALE_DIGITS);
        let mut calc = Self {
            max_diff: BigInt::zero(),
            scale,
        };
        let full = calc.sigma_diff(&(&calc.scale * 100u32));
        let empty = calc.sigma_diff(&BigInt::zero());
        calc.max_diff = full.max(empty);
        calc
    }

    /// New base fee given the previous block's fee and gas used.
    pub fn base_fee(&self, prev_base_fee: Value, gas_used: Gas) -> Value {
        let s = &self.scale;
        let percentage = BigInt::from(gas_used.0) * 100u32 * s / BigInt::from(DEFAULT_GAS_LIMIT.0);
        let normalized = self.sigma_diff(&percentage) * s / &self.max_diff;

        let denominator = s * ADJUSTMENT_DENOMINATOR;
        let factor = &denominator + normalized * ADJUSTMENT_NUMERATOR;
        let new_fee = BigInt::from(prev_base_fee.0) * factor / denominator;

        if new_fee > BigInt::from(DEFAULT_GAS_PRICE.0) {
            Value(new_fee.to_u128().unwrap_or(u128::MAX))
        } else {
            DEFAULT_GAS_PRICE
        }
    }

    /// `e^x` for fixed-point `x`.
    fn exp(&self, x: &BigInt) -> BigInt {
        let s = &self.scale;
        if x.is_negative() {
            return s * s / self.exp(&-x);
        }
        let mut sum = s.clone();
        let mut term = s.clone();
        let mut k = 1u32;
        loop {
            term = term * x / (s * k);
            if term.is_zero() {
                return sum;
            }
            sum += &term;
            k += 1;
        }
    }

    /// `1 / (1 + e^n)`.
    fn sigmoid(&self, n: &BigInt) -> BigInt {
        let s = &self.scale;
        s * s / (s + self.exp(n))
    }

    fn sigma_diff(&self, percentage: &BigInt) -> BigInt {
        let s = &self.scale;
        let low = self.sigmoid(&((percentage - s * CENTER_LOW) / SMOOTHING));
        let high = self.sigmoid(&(-(percentage - s * CENTER_HIGH) / SMOOTHING));
        high - low
    }
}

impl FeeCalculator for MainFeeCalculator {
    fn calculate_base_fee(&self, prev_block: &Block) -> Value {
        let fee = self.base_fee(prev_block.base_fee, prev_block.gas_used);
        if fee != prev_block.base_fee {
            tracing::debug!(old = %prev_block.base_fee, new = %fee, "base fee updated");
        }
        fee
    }
}

/// `min(max_fee - base_fee, max_priority_fee)` of `txn`.
pub fn effective_priority_fee(base_fee: Value, txn: &Transaction) -> Result<Value, ExecError> {
    let headroom = txn.max_fee_per_gas.checked_sub(base_fee).ok_or_else(|| {
        ExecError::verbose(
            ErrorCode::BaseFeeTooHigh,
            format!("max fee {} < base fee {}", txn.max_fee_per_gas, base_fee),
        )
    })?;
    Ok(headroom.min(txn.max_priority_fee_per_gas))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREV_FEE: Value = Value(1_000_000_000);

    fn gas_at(percent: u64) -> Gas {
        Gas(DEFAULT_GAS_LIMIT.0 * percent / 100)
    }

    #[test]
    fn test_exp_matches_e() {
        let calc = MainFeeCalculator::new();
        let e = calc.exp(&calc.scale);
        // 2.718281828459045235360287471352...
        let expected = BigInt::parse_bytes(b"2718281828459045235360287471352", 10).unwrap();
        assert!((e - expected).abs() < BigInt::from(1000u32));
    }

    #[test]
    fn test_half_utilization_keeps_fee() {
        let calc = MainFeeCalculator::new();
        assert_eq!(calc.base_fee(PREV_FEE, gas_at(50)), PREV_FEE);
    }

    #[test]
    fn test_fee_tracks_utilization() {
        let calc = MainFeeCalculator::new();
        assert!(calc.base_fee(PREV_FEE, gas_at(60)) > PREV_FEE);
        assert!(calc.base_fee(PREV_FEE, gas_at(100)) > calc.base_fee(PREV_FEE, gas_at(60)));
        assert!(calc.base_fee(PREV_FEE, gas_at(40)) < PREV_FEE);
        assert!(calc.base_fee(PREV_FEE, Gas::ZERO) < calc.base_fee(PREV_FEE, gas_at(40)));
    }

    #[test]
    fn test_full_block_raises_by_adjustment_factor() {
        let calc = MainFeeCalculator::new();
        // normalized == 1 at 100%, so the fee grows by 1/101.34.
        let expected = PREV_FEE.0 * 1_023_400 / 1_013_400;
        assert_eq!(calc.base_fee(PREV_FEE, gas_at(100)), Value(expected));
    }

    #[test]
    fn test_fee_never_below_default() {
        let calc = MainFeeCalculator::new();
        assert_eq!(calc.base_fee(DEFAULT_GAS_PRICE, Gas::ZERO), DEFAULT_GAS_PRICE);
        assert_eq!(calc.base_fee(Value::ZERO, gas_at(100)), DEFAULT_GAS_PRICE);
    }

    #[test]
    fn test_effective_priority_fee() {
        let txn = Transaction {
            max_fee_per_gas: Value(100),
            max_priority_fee_per_gas: Value(5),
            ..Default::default()
        };
        assert_eq!(effective_priority_fee(Value(10), &txn), Ok(Value(5)));
        assert_eq!(effective_priority_fee(Value(98), &txn), Ok(Value(2)));
        assert_eq!(
            effective_priority_fee(Value(101), &txn).unwrap_err().code(),
            ErrorCode::BaseFeeTooHigh
        );
    }
}
