//! Who pays for a transaction's gas.

use std::fmt;

use meridian_primitives::{
    Address, ErrorCode, ExecError, ForwardKind, InternalTransactionPayload, Transaction,
    TransactionKind, Value,
};

use crate::execution_state::ExecutionState;
use crate::result::{TxnError, TxnResult};

/// Source of the fee credit of the transaction being handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payer {
    /// System transactions are free.
    Dummy,
    /// Internal transactions: the sender escrowed the credit when it sent
    /// the message, so buying gas is a no-op and leftovers travel back as a
    /// refund message.
    Transaction {
        to: Address,
        refund_to: Address,
    },
    /// External transactions: the destination account pays from its balance.
    Account { address: Address, value: Value },
}

impl Payer {
    /// Payer of an internal transaction.
    pub fn for_transaction(txn: &Transaction) -> Self {
        if txn.is_system() {
            return Self::Dummy;
        }
        Self::Transaction {
            to: txn.to,
            refund_to: txn.refund_to,
        }
    }

    /// Payer of an external transaction: its destination account.
    pub fn for_account(txn: &Transaction) -> Self {
        Self::Account {
            address: txn.to,
            value: txn.value,
        }
    }

    pub fn can_pay(&self, es: &mut ExecutionState, amount: Value) -> TxnResult<bool> {
        match self {
            Self::Dummy | Self::Transaction { .. } => Ok(true),
            Self::Account { address, value } => {
                let Some(needed) = value.checked_add(amount) else {
                    return Ok(false);
                };
                Ok(es.balance(*address)? >= needed)
            }
        }
    }

    pub fn sub_balance(&self, es: &mut ExecutionState, amount: Value) -> TxnResult<()> {
        match self {
            Self::Dummy | Self::Transaction { .. } => Ok(()),
            Self::Account { address, .. } => es.sub_balance(*address, amount),
        }
    }

    pub fn add_balance(&self, es: &mut ExecutionState, amount: Value) -> TxnResult<()> {
        match self {
            Self::Dummy => Ok(()),
            Self::Transaction { to, refund_to } => {
                if refund_to.is_empty() {
                    return Err(ErrorCode::RefundAddressIsEmpty.into());
                }
                let refund = InternalTransactionPayload {
                    kind: TransactionKind::Refund,
                    forward_kind: ForwardKind::None,
                    to: *refund_to,
                    value: amount,
                    ..Default::default()
                };
                match es.add_out_transaction(*to, refund) {
                    Err(TxnError::Exec(err)) => {
                        tracing::error!(%to, %refund_to, %err, "failed to add refund transaction");
                        Ok(())
                    }
                    other => other.map(|_| ()),
                }
            }
            Self::Account { address, .. } => es.add_balance(*address, amount),
        }
    }
}

impl fmt::Display for Payer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dummy => f.write_str("dummy"),
            Self::Transaction { .. } => f.write_str("transaction"),
            Self::Account { address, .. } => write!(f, "account {address}"),
        }
    }
}

/// Take `txn.fee_credit` from the payer up front.
pub fn buy_gas(payer: &Payer, es: &mut ExecutionState, txn: &Transaction) -> TxnResult<()> {
    if !payer.can_pay(es, txn.fee_credit)? {
        return Err(ExecError::verbose(
            ErrorCode::InsufficientFunds,
            format!("{payer} can't pay {}", txn.fee_credit),
        )
        .into());
    }
    payer.sub_balance(es, txn.fee_credit)
}

/// Return unspent credit, exchanged at the original price.
pub fn refund_gas(payer: &Payer, es: &mut ExecutionState, remaining: Value) -> TxnResult<()> {
    if remaining.is_zero() {
        return Ok(());
    }
    payer.add_balance(es, remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution_state::ExecutionParams;
    use meridian_primitives::{ShardId, TransactionFlags};
    use meridian_storage::{create_rw_tx, MemDb};

    fn state() -> ExecutionState {
        ExecutionState::new(create_rw_tx(&MemDb::shared()), ShardId(1), ExecutionParams::default()).unwrap()
    }

    fn addr(n: u8) -> Address {
        Address::from_shard_and_hash(ShardId(1), &[n; 32])
    }

    #[test]
    fn test_account_payer_checks_balance() {
        let mut es = state();
        let payer = Payer::Account {
            address: addr(1),
            value: Value(50),
        };
        es.add_balance(addr(1), Value(100)).unwrap();
        assert!(payer.can_pay(&mut es, Value(50)).unwrap());
        assert!(!payer.can_pay(&mut es, Value(51)).unwrap());

        let txn = Transaction {
            fee_credit: Value(80),
            ..Default::default()
        };
        let err = buy_gas(&payer, &mut es, &txn).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InsufficientFunds);
        assert_eq!(es.balance(addr(1)).unwrap(), Value(100));
    }

    #[test]
    fn test_transaction_payer_refunds_by_message() {
        let mut es = state();
        let hash = es.add_in_transaction(Transaction::default());
        let payer = Payer::Transaction {
            to: addr(1),
            refund_to: addr(2),
        };
        refund_gas(&payer, &mut es, Value(7)).unwrap();
        let outs = es.out_transactions(&hash);
        assert_eq!(outs.len(), 1);
        assert!(outs[0].transaction.is_refund());
        assert_eq!(outs[0].transaction.value, Value(7));

        refund_gas(&payer, &mut es, Value::ZERO).unwrap();
        assert_eq!(es.out_transactions(&hash).len(), 1);
    }

    #[test]
    fn test_refund_without_address_fails() {
        let mut es = state();
        let payer = Payer::Transaction {
            to: addr(1),
            refund_to: Address::EMPTY,
        };
        let err = refund_gas(&payer, &mut es, Value(7)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RefundAddressIsEmpty);
    }

    #[test]
    fn test_system_transactions_are_free() {
        let txn = Transaction {
            flags: TransactionFlags::new(TransactionFlags::INTERNAL),
            ..Default::default()
        };
        assert_eq!(Payer::for_transaction(&txn), Payer::Dummy);
    }
}
