//! Admission checks for transactions entering a block.
//!
//! External transactions are validated before they are handled: a failure
//! here means the transaction is never included and nothing is charged.

use meridian_primitives::transaction::create_address;
use meridian_primitives::{DeployPayload, ErrorCode, ExecError, Transaction};

use crate::execution_state::ExecutionState;
use crate::result::ExecutionResult;

/// Deploy payload shape and target address.
pub fn validate_deploy_transaction(txn: &Transaction) -> Result<(), ExecError> {
    let payload = DeployPayload::parse(&txn.data).ok_or_else(|| {
        ExecError::verbose(ErrorCode::InvalidPayload, "deploy payload shorter than its salt")
    })?;
    let shard = txn.to.shard_id();
    if shard.is_main() {
        return Err(ExecError::new(ErrorCode::DeployToMainShard));
    }
    let expected = create_address(shard, &payload);
    if expected != txn.to {
        return Err(ExecError::verbose(
            ErrorCode::IncorrectDeploymentAddress,
            format!("expected {expected}, got {}", txn.to),
        ));
    }
    Ok(())
}

/// Validate external `txn` against `es`. Execution transactions to a
/// contract end with its signature check. Value sends to an account
/// without code skip it.
pub fn validate_external_transaction(es: &mut ExecutionState, txn: &Transaction) -> ExecutionResult {
    let res = ExecutionResult::new();
    if txn.chain_id != es.chain_id() {
        return res.with_error(ExecError::verbose(
            ErrorCode::InvalidChainId,
            format!("expected {}, got {}", es.chain_id(), txn.chain_id),
        ));
    }
    if txn.max_fee_per_gas.is_zero() {
        return res.with_error(ErrorCode::MaxFeePerGasIsZero);
    }

    let exists = match es.account_exists(txn.to) {
        Ok(exists) => exists,
        Err(err) => return res.with_error(err),
    };
    if !exists {
        return res.with_error(ExecError::verbose(
            ErrorCode::DestinationContractDoesNotExist,
            txn.to.to_string(),
        ));
    }

    if txn.is_deploy() {
        if let Err(err) = validate_deploy_transaction(txn) {
            return res.with_error(err);
        }
        return match es.contract_exists(txn.to) {
            Ok(true) => res.with_error(ErrorCode::ContractAlreadyExists),
            Ok(false) => res,
            Err(err) => res.with_error(err),
        };
    }
    if txn.is_refund() {
        return res.with_error(ErrorCode::RefundTransactionIsNotAllowedInExternalTransactions);
    }

    let code_empty = match es.code(txn.to) {
        Ok(code) => code.is_empty(),
        Err(err) => return res.with_error(err),
    };
    if code_empty && !txn.data.is_empty() && txn.value.is_zero() {
        return res.with_error(ExecError::verbose(ErrorCode::ContractDoesNotExist, txn.to.to_string()));
    }
    // Plain value send: nothing to verify against.
    if code_empty {
        return res;
    }

    let seqno = match es.ext_seqno(txn.to) {
        Ok(seqno) => seqno,
        Err(err) => return res.with_error(err),
    };
    if txn.seqno != seqno {
        return res.with_error(ExecError::verbose(
            ErrorCode::SeqnoGap,
            format!("account seqno {seqno}, transaction seqno {}", txn.seqno),
        ));
    }

    es.call_verify_external(txn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_primitives::{ShardId, TransactionFlags, ZERO_HASH};

    fn deploy_to(shard: ShardId, code: &[u8]) -> Transaction {
        let payload = DeployPayload::new(code, [9u8; 32]);
        Transaction {
            flags: TransactionFlags::new(TransactionFlags::DEPLOY),
            to: create_address(shard, &payload),
            data: payload.into_bytes(),
            ..Default::default()
        }
    }

    #[test]
    fn test_deploy_address_must_match_payload() {
        let txn = deploy_to(ShardId(1), b"code");
        assert!(validate_deploy_transaction(&txn).is_ok());

        let mut wrong = txn.clone();
        wrong.to = create_address(ShardId(2), &DeployPayload::parse(&txn.data).unwrap());
        wrong.data = DeployPayload::new(b"other", ZERO_HASH).into_bytes();
        let err = validate_deploy_transaction(&wrong).unwrap_err();
        assert_eq!(err.code(), ErrorCode::IncorrectDeploymentAddress);
    }

    #[test]
    fn test_deploy_to_main_shard_rejected() {
        let txn = deploy_to(ShardId::MAIN, b"code");
        let err = validate_deploy_transaction(&txn).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeployToMainShard);
    }

    #[test]
    fn test_short_deploy_payload_rejected() {
        let mut txn = deploy_to(ShardId(1), b"");
        txn.data.truncate(10);
        let err = validate_deploy_transaction(&txn).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
    }
}
