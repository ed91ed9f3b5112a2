//! Handling of a single transaction: gas purchase, the deploy, execution and
//! refund paths, async request/response plumbing, bounces, gas forwarding and
//! the final refund of unused credit.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use meridian_primitives::codec::{write_bool, write_var_bytes};
use meridian_primitives::{
    Address, AsyncContext, AsyncRequestInfo, AsyncResponsePayload, Codec, DeployPayload,
    ErrorCode, ExecError, FatalError, ForwardKind, Gas, Hash, InternalTransactionPayload,
    Transaction, TransactionKind, Value, EXTERNAL_VERIFICATION_MAX_GAS,
};

use super::ExecutionState;
use crate::fee::effective_priority_fee;
use crate::journal::JournalEntry;
use crate::payer::{buy_gas, refund_gas, Payer};
use crate::result::{ExecutionResult, TxnError, TxnResult};
use crate::vm::{decode_revert_reason, CallFrame, Resume, VmOutcome};

/// Length of the selector that prefixes callback context data.
const CALLBACK_SELECTOR_LEN: usize = 4;

/// Divisor capping the storage refund at a fraction of the gas used.
const MAX_REFUND_QUOTIENT: u64 = 5;

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl ExecutionState {
    /// Handle `txn`, which must already be registered with
    /// [`add_in_transaction`](Self::add_in_transaction).
    ///
    /// Recoverable failures are reported in the result and leave the state
    /// as the failure semantics dictate. A panic inside execution reverts
    /// everything the transaction did.
    pub fn handle_transaction(&mut self, txn: &Transaction, payer: &Payer) -> ExecutionResult {
        let pre = self.journal.snapshot();
        let res = match catch_unwind(AssertUnwindSafe(|| self.handle_inner(txn, payer))) {
            Ok(res) => res,
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                tracing::error!(
                    txn_hash = %hex::encode(self.in_transaction_hash),
                    panic = %msg,
                    "panic during transaction execution"
                );
                self.revert_to_snapshot(pre);
                return ExecutionResult::new()
                    .with_gas_price(self.gas_price)
                    .with_error(ExecError::verbose(ErrorCode::PanicDuringExecution, msg));
            }
        };

        // An external transaction that burned nothing is not included, so
        // nothing it touched may survive either.
        if txn.is_external() && res.failed() && !res.is_fatal() && res.gas_used == Gas::ZERO {
            self.revert_to_snapshot(pre);
        }
        // Nothing reverts past this transaction from here on.
        self.journal.release(pre);
        res
    }

    fn handle_inner(&mut self, txn: &Transaction, payer: &Payer) -> ExecutionResult {
        self.was_await_call = false;
        self.refund = 0;
        self.txn_fee_credit = txn.fee_credit;

        if let Err(err) = self.update_gas_price(txn) {
            return ExecutionResult::new().with_error(err);
        }
        let mut res = ExecutionResult::new().with_gas_price(self.gas_price);

        if let Err(err) = buy_gas(payer, self, txn) {
            res.set_error(err);
            return res;
        }
        if let Err(err) = txn.verify_flags() {
            return res.with_error(err);
        }

        self.revert_id = self.journal.snapshot();

        if txn.is_refund() {
            if let Err(err) = self.add_balance(txn.to, txn.value) {
                res.set_fatal(FatalError::invariant(format!("refund to {}: {err}", txn.to)));
            }
            return res;
        }

        let mut res = if txn.is_deploy() {
            self.handle_deploy(txn)
        } else {
            self.handle_execution(txn)
        };
        if res.is_fatal() {
            return res;
        }

        let mut bounced = false;
        let mut response_sent = false;
        if txn.is_request() && !self.was_await_call {
            if let Err(err) = self.send_response(txn, &res) {
                res.set_error(err);
                return res;
            }
            response_sent = true;
            bounced = true;
        } else if txn.is_response() && !txn.request_chain.is_empty() && !self.was_await_call {
            if let Err(err) = self.send_response(txn, &res) {
                res.set_error(err);
                return res;
            }
            response_sent = true;
        }

        if res.failed() && !response_sent {
            if let (Some(reason), Some(err)) = (decode_revert_reason(&res.return_data), &res.error) {
                res.error = Some(ExecError::verbose(err.code(), reason));
            }
            if txn.is_bounce() {
                tracing::error!(
                    txn_hash = %hex::encode(self.in_transaction_hash),
                    to = %txn.to,
                    error = ?res.error,
                    "bounce transaction failed"
                );
            } else if self.should_bounce(txn) {
                bounced = true;
                if let Err(err) = self.send_bounce(txn, &res) {
                    res.set_error(err);
                    return res;
                }
            }
        } else {
            let available = self.txn_fee_credit.saturating_sub(res.coins_used());
            match self.calculate_gas_forwarding(available) {
                Ok(forwarded) => res.coins_forwarded = forwarded,
                Err(err) => {
                    self.revert_to_snapshot(self.revert_id);
                    self.revert_id = self.journal.snapshot();
                    res.set_error(ExecError::keep_or_wrap(ErrorCode::ForwardingFailed, err));
                    res.coins_forwarded = Value::ZERO;
                    if self.should_bounce(txn) {
                        bounced = true;
                        if let Err(err) = self.send_bounce(txn, &res) {
                            res.set_error(err);
                            return res;
                        }
                    }
                }
            }
        }

        if !bounced {
            let left_over = res.left_over(self.txn_fee_credit);
            let refunded = if txn.refund_to == txn.to {
                self.add_balance(txn.to, left_over)
            } else {
                refund_gas(payer, self, left_over)
            };
            match refunded {
                Ok(()) => {}
                Err(TxnError::Fatal(err)) => {
                    res.set_fatal(err);
                    return res;
                }
                Err(TxnError::Exec(err)) => {
                    let err = ExecError::wrap(ErrorCode::GasRefundFailed, err);
                    tracing::warn!(%payer, %left_over, %err, "gas refund failed");
                }
            }
        }

        self.gas_used = self.gas_used.saturating_add(res.gas_used);
        res
    }

    /// Gas price of `txn`: the base fee plus its effective priority fee.
    /// Read-only execution skips the max-fee check.
    pub fn update_gas_price(&mut self, txn: &Transaction) -> Result<(), ExecError> {
        let priority = if self.is_read_only() {
            txn.max_priority_fee_per_gas
        } else {
            effective_priority_fee(self.base_fee, txn)?
        };
        self.gas_price = self.base_fee.saturating_add(priority);
        if self.gas_price.is_zero() {
            return Err(ExecError::new(ErrorCode::MaxFeePerGasIsZero));
        }
        Ok(())
    }

    fn should_bounce(&self, txn: &Transaction) -> bool {
        txn.is_internal()
            && (!txn.value.is_zero() || !txn.token.is_empty())
            && !txn.bounce_to.is_empty()
    }

    /// Credit the value and tokens an internal transaction carries.
    fn transfer_in(&mut self, txn: &Transaction) -> TxnResult<()> {
        self.add_balance(txn.to, txn.value)?;
        for token in &txn.token {
            self.add_token(txn.to, token.token, token.balance)?;
        }
        Ok(())
    }

    /// Roll back to the revision taken before the transaction ran and
    /// open a fresh one for the failure path.
    fn revert_execution(&mut self) {
        self.revert_to_snapshot(self.revert_id);
        self.revert_id = self.journal.snapshot();
        self.was_await_call = false;
    }

    fn apply_outcome(&mut self, res: &mut ExecutionResult, gas: Gas, out: VmOutcome) {
        res.set_used(gas.saturating_sub(out.gas_left));
        res.return_data = out.return_data;
        if let Some(err) = out.error {
            res.failed_pc = out.pc;
            res.set_error(err);
            if !res.is_fatal() {
                self.revert_execution();
            }
        }
    }

    fn handle_deploy(&mut self, txn: &Transaction) -> ExecutionResult {
        let mut res = ExecutionResult::new().with_gas_price(self.gas_price);
        let Some(payload) = DeployPayload::parse(&txn.data) else {
            return res.with_error(ErrorCode::InvalidPayload);
        };
        let address = txn.to;
        match self.contract_exists(address) {
            Ok(false) => {}
            Ok(true) => {
                return res.with_error(ExecError::verbose(
                    ErrorCode::ContractAlreadyExists,
                    address.to_string(),
                ))
            }
            Err(err) => return res.with_error(err),
        }

        if let Err(err) = self.prepare_deploy(txn) {
            res.set_error(err);
            if !res.is_fatal() {
                self.revert_execution();
            }
            return res;
        }

        let gas = self.txn_fee_credit.to_gas(self.gas_price);
        let frame = CallFrame {
            caller: txn.from,
            address,
            value: txn.value,
            gas,
            read_only: false,
            context: self.block_context(),
        };
        let vm = Arc::clone(&self.vm);
        let out = vm.deploy(self, &frame, payload.code());
        self.apply_outcome(&mut res, gas, out);
        if !res.failed() {
            tracing::debug!(%address, gas_used = %res.gas_used, "contract deployed");
        }
        res
    }

    fn prepare_deploy(&mut self, txn: &Transaction) -> TxnResult<()> {
        let (account, journal, _) = self.parts(txn.to)?;
        account.mark_new_contract(journal);
        if account.seqno() == 0 {
            account.set_seqno(journal, 1);
        }
        if txn.is_internal() {
            self.transfer_in(txn)?;
        }
        Ok(())
    }

    fn handle_execution(&mut self, txn: &Transaction) -> ExecutionResult {
        let mut res = ExecutionResult::new().with_gas_price(self.gas_price);
        let (input, resume) = match self.try_process_response(txn) {
            Ok(v) => v,
            Err(err) => return res.with_error(err),
        };

        if txn.is_external() {
            if let Err(err) = self.bump_ext_seqno(txn.to) {
                return res.with_error(err);
            }
        }

        self.revert_id = self.journal.snapshot();

        if txn.is_internal() {
            if let Err(err) = self.transfer_in(txn) {
                res.set_error(err);
                if !res.is_fatal() {
                    self.revert_execution();
                }
                return res;
            }
        }

        let gas = self.txn_fee_credit.to_gas(self.gas_price);
        let code = match self.code(txn.to) {
            Ok(code) => code,
            Err(err) => return res.with_error(err),
        };
        if code.is_empty() && resume.is_none() {
            return res;
        }

        let frame = CallFrame {
            caller: txn.from,
            address: txn.to,
            value: txn.value,
            gas,
            read_only: false,
            context: self.block_context(),
        };
        let vm = Arc::clone(&self.vm);
        let out = vm.call(self, &frame, &code, &input, resume);
        self.apply_outcome(&mut res, gas, out);

        let refund = self.refund.min(res.gas_used.0 / MAX_REFUND_QUOTIENT);
        res.set_used(Gas(res.gas_used.0 - refund));
        res
    }

    fn bump_ext_seqno(&mut self, address: Address) -> TxnResult<()> {
        let seqno = self.ext_seqno(address)?;
        let next = seqno
            .checked_add(1)
            .ok_or_else(|| ExecError::new(ErrorCode::SeqnoOverflow))?;
        self.set_ext_seqno(address, next)?;
        Ok(())
    }

    /// Call input and continuation for `txn`. For responses this consumes
    /// the stored async context and credits its response gas.
    fn try_process_response(&mut self, txn: &Transaction) -> TxnResult<(Vec<u8>, Option<Resume>)> {
        if !txn.is_response() {
            return Ok((txn.data.clone(), None));
        }
        if txn.request_id == 0 {
            return Err(ExecError::verbose(ErrorCode::Validation, "response without request id").into());
        }
        let context = self.take_async_context(txn.to, txn.request_id)?.ok_or_else(|| {
            ExecError::verbose(
                ErrorCode::Validation,
                format!("no async context for request {} of {}", txn.request_id, txn.to),
            )
        })?;
        let response = AsyncResponsePayload::decode(&txn.data)
            .map_err(|e| ExecError::wrap(ErrorCode::InvalidPayload, e))?;

        self.txn_fee_credit = self
            .txn_fee_credit
            .saturating_add(context.response_processing_gas.to_value(self.gas_price));

        if context.is_await {
            return Ok((
                Vec::new(),
                Some(Resume {
                    state: context.data,
                    success: response.success,
                    return_data: response.return_data,
                }),
            ));
        }

        if context.data.len() < CALLBACK_SELECTOR_LEN {
            return Err(ExecError::new(ErrorCode::AwaitCallTooShortContextData).into());
        }
        let (selector, extra) = context.data.split_at(CALLBACK_SELECTOR_LEN);
        let mut input = selector.to_vec();
        write_bool(&mut input, response.success);
        write_var_bytes(&mut input, &response.return_data);
        write_var_bytes(&mut input, extra);
        Ok((input, None))
    }

    // ── Outbound transactions ──

    /// Queue a transaction from `caller`. Bumps the caller's seqno and
    /// debits the tokens it carries unless it is a bounce or a refund.
    pub fn add_out_transaction(
        &mut self,
        caller: Address,
        payload: InternalTransactionPayload,
    ) -> TxnResult<Hash> {
        self.push_out_transaction(caller, payload, 0, Vec::new())
    }

    fn push_out_transaction(
        &mut self,
        caller: Address,
        payload: InternalTransactionPayload,
        request_id: u64,
        request_chain: Vec<AsyncRequestInfo>,
    ) -> TxnResult<Hash> {
        let seqno = self.seqno(caller)?;
        let next = seqno
            .checked_add(1)
            .ok_or_else(|| ExecError::new(ErrorCode::SeqnoOverflow))?;
        self.set_seqno(caller, next)?;

        let mut txn = payload.to_transaction(caller, seqno);
        txn.request_id = request_id;
        txn.request_chain = request_chain;
        if !txn.is_bounce() && !txn.is_refund() {
            for token in &txn.token {
                self.sub_token(caller, token.token, token.balance)?;
            }
        }
        if let Some(in_txn) = self.in_transaction() {
            txn.max_fee_per_gas = in_txn.max_fee_per_gas;
            txn.max_priority_fee_per_gas = in_txn.max_priority_fee_per_gas;
        }

        let parent = self.in_transaction_hash;
        let index = self.out_transactions.get(&parent).map_or(0, Vec::len);
        self.journal.append(JournalEntry::OutTransaction { parent, index });
        let outbound = txn.to_outbound(payload.forward_kind);
        let hash = outbound.hash;
        tracing::trace!(
            from = %caller,
            to = %outbound.transaction.to,
            txn_hash = %hex::encode(hash),
            flags = %outbound.transaction.flags,
            "outbound transaction added"
        );
        self.out_transactions.entry(parent).or_default().push(outbound);
        Ok(hash)
    }

    /// Queue a request from `caller`. Await requests extend the request
    /// chain of the current transaction; other requests keep their callback
    /// context until the response arrives.
    pub fn add_request(
        &mut self,
        caller: Address,
        payload: InternalTransactionPayload,
        response_gas: Gas,
        is_await: bool,
    ) -> TxnResult<Hash> {
        let request_id = self.fetch_request_id(caller)?;
        let chain = if is_await {
            self.was_await_call = true;
            match self.in_transaction() {
                Some(in_txn) if in_txn.is_request() => {
                    let mut chain = in_txn.request_chain.clone();
                    chain.push(AsyncRequestInfo {
                        id: in_txn.request_id,
                        caller: in_txn.from,
                    });
                    chain
                }
                Some(in_txn) => in_txn.request_chain.clone(),
                None => Vec::new(),
            }
        } else {
            self.set_async_context(
                caller,
                request_id,
                AsyncContext {
                    is_await: false,
                    data: payload.request_context.clone(),
                    response_processing_gas: response_gas,
                },
            )?;
            Vec::new()
        };
        self.push_out_transaction(caller, payload, request_id, chain)
    }

    /// Attach `state` to the await request just queued by `address`.
    pub fn save_continuation(&mut self, address: Address, state: Vec<u8>, response_gas: Gas) -> TxnResult<()> {
        let request_id = self
            .out_transactions(&self.in_transaction_hash)
            .last()
            .map_or(0, |out| out.transaction.request_id);
        if request_id == 0 {
            return Err(ExecError::verbose(ErrorCode::Execution, "no pending await request").into());
        }
        self.set_async_context(
            address,
            request_id,
            AsyncContext {
                is_await: true,
                data: state,
                response_processing_gas: response_gas,
            },
        )?;
        Ok(())
    }

    fn send_response(&mut self, txn: &Transaction, res: &ExecutionResult) -> TxnResult<()> {
        let body = AsyncResponsePayload {
            success: !res.failed(),
            return_data: res.return_data.clone(),
        };
        let (to, request_id, chain) = if txn.is_request() {
            (txn.from, txn.request_id, txn.request_chain.clone())
        } else {
            let mut chain = txn.request_chain.clone();
            let pending = chain
                .pop()
                .ok_or_else(|| FatalError::invariant("response sent for an empty request chain"))?;
            (pending.caller, pending.id, chain)
        };
        let payload = InternalTransactionPayload {
            kind: TransactionKind::Response,
            forward_kind: ForwardKind::Remaining,
            to,
            refund_to: txn.refund_to,
            value: if res.failed() { txn.value } else { Value::ZERO },
            data: body.encode(),
            ..Default::default()
        };
        self.push_out_transaction(txn.to, payload, request_id, chain)
            .map(|_| ())
    }

    fn send_bounce(&mut self, txn: &Transaction, res: &ExecutionResult) -> TxnResult<()> {
        let message = res.error.as_ref().map(|e| e.to_string()).unwrap_or_default();
        tracing::debug!(to = %txn.bounce_to, value = %txn.value, %message, "bouncing transaction");
        let payload = InternalTransactionPayload {
            kind: TransactionKind::Execution,
            bounce: true,
            forward_kind: ForwardKind::None,
            fee_credit: self.txn_fee_credit.saturating_sub(res.coins_used()),
            to: txn.bounce_to,
            refund_to: txn.refund_to,
            value: txn.value,
            token: txn.token.clone(),
            data: message.into_bytes(),
            ..Default::default()
        };
        self.add_out_transaction(txn.to, payload).map(|_| ())
    }

    /// Split `initial` between the outbound transactions of the current
    /// in-transaction according to their forward kinds. Returns the amount
    /// handed out.
    pub fn calculate_gas_forwarding(&mut self, initial: Value) -> Result<Value, ExecError> {
        let refund_to = self.in_transaction().map_or(Address::EMPTY, |t| t.refund_to);
        let Some(outs) = self.out_transactions.get_mut(&self.in_transaction_hash) else {
            return Ok(Value::ZERO);
        };

        let mut available = initial;
        let mut remaining = Vec::new();
        for (i, out) in outs.iter_mut().enumerate() {
            let txn = &mut out.transaction;
            match out.forward_kind {
                ForwardKind::Value => {
                    available = available.checked_sub(txn.fee_credit).ok_or_else(|| {
                        ExecError::verbose(
                            ErrorCode::ForwardingFailed,
                            format!("cannot forward {}: {} left", txn.fee_credit, available),
                        )
                    })?;
                }
                ForwardKind::Percentage => {
                    let percent = txn.fee_credit.0;
                    if percent > 100 {
                        return Err(ExecError::verbose(
                            ErrorCode::ForwardingFailed,
                            format!("invalid percentage {percent}"),
                        ));
                    }
                    let credit = Value((initial.0 / 100) * percent + (initial.0 % 100) * percent / 100);
                    txn.fee_credit = credit;
                    available = available.checked_sub(credit).ok_or_else(|| {
                        ExecError::verbose(
                            ErrorCode::ForwardingFailed,
                            format!("cannot forward {percent}%: {available} left"),
                        )
                    })?;
                }
                ForwardKind::Remaining => remaining.push(i),
                ForwardKind::None => {}
            }
            if out.forward_kind != ForwardKind::None && txn.refund_to.is_empty() {
                txn.refund_to = refund_to;
            }
        }

        if !remaining.is_empty() {
            let n = remaining.len() as u128;
            let share = available.0 / n;
            let extra = available.0 % n;
            for (k, i) in remaining.into_iter().enumerate() {
                outs[i].transaction.fee_credit = Value(if k == 0 { share + extra } else { share });
            }
            available = Value::ZERO;
        }
        for out in outs.iter_mut() {
            out.hash = out.transaction.hash();
        }
        Ok(initial.saturating_sub(available))
    }

    // ── Validation helpers ──

    /// Run the destination's signature check for external `txn`. Only a
    /// successful check charges the destination for the gas spent.
    pub fn call_verify_external(&mut self, txn: &Transaction) -> ExecutionResult {
        if let Err(err) = self.update_gas_price(txn) {
            return ExecutionResult::new().with_error(err);
        }
        let mut res = ExecutionResult::new().with_gas_price(self.gas_price);

        let balance = match self.balance(txn.to) {
            Ok(balance) => balance,
            Err(err) => return res.with_error(err),
        };
        let code = match self.code(txn.to) {
            Ok(code) => code,
            Err(err) => return res.with_error(err),
        };
        let limit = EXTERNAL_VERIFICATION_MAX_GAS.min(balance.to_gas(self.gas_price));
        let frame = CallFrame {
            caller: Address::EMPTY,
            address: txn.to,
            value: Value::ZERO,
            gas: limit,
            read_only: true,
            context: self.block_context(),
        };
        let vm = Arc::clone(&self.vm);
        let out = vm.verify_external(self, &frame, &code, &txn.signing_hash(), &txn.signature);

        match out.error {
            Some(TxnError::Fatal(err)) => return res.with_error(err),
            Some(TxnError::Exec(err)) => {
                if err.code() == ErrorCode::OutOfGas && limit < EXTERNAL_VERIFICATION_MAX_GAS {
                    return res.with_error(ExecError::verbose(
                        ErrorCode::InsufficientBalance,
                        format!("{} cannot pay for verification", txn.to),
                    ));
                }
                return res.with_error(ExecError::keep_or_wrap(ErrorCode::ExternalVerificationFailed, err));
            }
            None => {}
        }
        let verified = out.return_data.len() == 32
            && out.return_data[31] == 1
            && out.return_data[..31].iter().all(|b| *b == 0);
        if !verified {
            return res.with_error(ErrorCode::ExternalVerificationFailed);
        }

        // A failed check burns nothing, so it never reaches the block.
        res.set_used(limit.saturating_sub(out.gas_left));
        if let Err(err) = self.sub_balance(txn.to, res.coins_used()) {
            return res.with_error(err);
        }
        self.gas_used = self.gas_used.saturating_add(res.gas_used);
        res
    }

    /// Check that internal `txn` is the next one expected from its source
    /// shard and advance the counter.
    pub fn validate_internal_transaction(&mut self, txn: &Transaction) -> Result<(), ExecError> {
        let source = txn.from.shard_id();
        let expected = self.in_tx_count(source);
        if txn.tx_id != expected {
            return Err(ExecError::verbose(
                ErrorCode::TxIdGap,
                format!("from shard {source}: expected tx id {expected}, got {}", txn.tx_id),
            ));
        }
        self.in_tx_counts.insert(source, expected + 1);
        if txn.is_deploy() {
            crate::validation::validate_deploy_transaction(txn)?;
        }
        Ok(())
    }
}
