//! The execution state as seen from contract code.

use meridian_primitives::{Address, Gas, Hash, InternalTransactionPayload, Log, Value};

use super::ExecutionState;
use crate::result::TxnResult;
use crate::vm::VmHost;

impl VmHost for ExecutionState {
    fn get_state(&mut self, address: Address, key: &Hash) -> TxnResult<Hash> {
        Ok(ExecutionState::get_state(self, address, key)?)
    }

    fn set_state(&mut self, address: Address, key: Hash, value: Hash) -> TxnResult<()> {
        Ok(ExecutionState::set_state(self, address, key, value)?)
    }

    fn get_transient_state(&self, address: Address, key: &Hash) -> Hash {
        self.transient_state(address, key)
    }

    fn set_transient_state(&mut self, address: Address, key: Hash, value: Hash) {
        ExecutionState::set_transient_state(self, address, key, value)
    }

    fn balance(&mut self, address: Address) -> TxnResult<Value> {
        Ok(ExecutionState::balance(self, address)?)
    }

    fn add_balance(&mut self, address: Address, amount: Value) -> TxnResult<()> {
        ExecutionState::add_balance(self, address, amount)
    }

    fn sub_balance(&mut self, address: Address, amount: Value) -> TxnResult<()> {
        ExecutionState::sub_balance(self, address, amount)
    }

    fn set_code(&mut self, address: Address, code: Vec<u8>) -> TxnResult<()> {
        Ok(ExecutionState::set_code(self, address, code)?)
    }

    fn contract_exists(&mut self, address: Address) -> TxnResult<bool> {
        Ok(ExecutionState::contract_exists(self, address)?)
    }

    fn self_destruct(&mut self, address: Address) -> TxnResult<()> {
        Ok(ExecutionState::self_destruct(self, address)?)
    }

    fn add_log(&mut self, log: Log) {
        ExecutionState::add_log(self, log)
    }

    fn add_refund(&mut self, gas: u64) {
        ExecutionState::add_refund(self, gas)
    }

    fn sub_refund(&mut self, gas: u64) {
        ExecutionState::sub_refund(self, gas)
    }

    fn add_out_transaction(
        &mut self,
        caller: Address,
        payload: InternalTransactionPayload,
    ) -> TxnResult<()> {
        ExecutionState::add_out_transaction(self, caller, payload).map(|_| ())
    }

    fn add_request(
        &mut self,
        caller: Address,
        payload: InternalTransactionPayload,
        response_gas: Gas,
        is_await: bool,
    ) -> TxnResult<()> {
        ExecutionState::add_request(self, caller, payload, response_gas, is_await).map(|_| ())
    }

    fn save_continuation(&mut self, address: Address, state: Vec<u8>, response_gas: Gas) -> TxnResult<()> {
        ExecutionState::save_continuation(self, address, state, response_gas)
    }
}
