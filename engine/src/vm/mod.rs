//! VM collaborator interface.
//!
//! The execution state drives contract code through the [`Vm`] trait and
//! exposes account state to it through [`VmHost`]. Opcode semantics live
//! behind the trait; [`Interpreter`] is the reference implementation used by
//! the node and the tests.
//!
//! - [`Vm`]: deploy, call and external-verification entry points
//! - [`VmHost`]: state access the VM needs (implemented by `ExecutionState`)
//! - [`Interpreter`]: byte-coded reference VM
//! - [`Program`]: builder for interpreter byte code

mod interpreter;
mod program;

pub use interpreter::{decode_revert_reason, encode_revert_reason, Interpreter, Opcode};
pub use program::{Program, SendMessage};

use meridian_primitives::{
    Address, Gas, Hash, InternalTransactionPayload, Log, ShardId, Value,
};

use crate::result::{TxnError, TxnResult};

/// Block-level values visible to contract code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockContext {
    pub shard_id: ShardId,
    pub block_number: u64,
    pub gas_limit: Gas,
    pub base_fee: Value,
    pub gas_price: Value,
    pub prev_block: Hash,
}

/// One invocation of contract code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    pub caller: Address,
    pub address: Address,
    pub value: Value,
    pub gas: Gas,
    /// Static calls may not mutate state.
    pub read_only: bool,
    pub context: BlockContext,
}

/// Continuation of an awaited request, handed back when its response arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resume {
    pub state: Vec<u8>,
    pub success: bool,
    pub return_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmOutcome {
    pub return_data: Vec<u8>,
    pub gas_left: Gas,
    pub error: Option<TxnError>,
    /// Position of the failing instruction, zero on success.
    pub pc: u32,
}

impl VmOutcome {
    pub fn success(return_data: Vec<u8>, gas_left: Gas) -> Self {
        Self {
            return_data,
            gas_left,
            error: None,
            pc: 0,
        }
    }

    pub fn failure(err: impl Into<TxnError>, gas_left: Gas, pc: u32) -> Self {
        Self {
            return_data: Vec::new(),
            gas_left,
            error: Some(err.into()),
            pc,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Executes contract code.
///
/// Implementations must be deterministic: the same frame, code and host
/// state always produce the same outcome and the same host calls.
pub trait Vm: Send + Sync {
    /// Install `code` at `frame.address`. The account already exists.
    fn deploy(&self, host: &mut dyn VmHost, frame: &CallFrame, code: &[u8]) -> VmOutcome;

    /// Run `code` with `input`, or continue a saved continuation.
    fn call(
        &self,
        host: &mut dyn VmHost,
        frame: &CallFrame,
        code: &[u8],
        input: &[u8],
        resume: Option<Resume>,
    ) -> VmOutcome;

    /// Ask the contract whether `signature` authorizes `signing_hash`.
    /// Success returns a 32-byte word whose last byte is 1.
    fn verify_external(
        &self,
        host: &mut dyn VmHost,
        frame: &CallFrame,
        code: &[u8],
        signing_hash: &Hash,
        signature: &[u8],
    ) -> VmOutcome;
}

/// State access for contract code.
///
/// Every mutation goes through the execution state's journal, so a failed
/// call can be reverted by the caller.
pub trait VmHost {
    fn get_state(&mut self, address: Address, key: &Hash) -> TxnResult<Hash>;

    fn set_state(&mut self, address: Address, key: Hash, value: Hash) -> TxnResult<()>;

    /// Block-scoped storage, dropped when the block is built.
    fn get_transient_state(&self, address: Address, key: &Hash) -> Hash;

    fn set_transient_state(&mut self, address: Address, key: Hash, value: Hash);

    fn balance(&mut self, address: Address) -> TxnResult<Value>;

    fn add_balance(&mut self, address: Address, amount: Value) -> TxnResult<()>;

    fn sub_balance(&mut self, address: Address, amount: Value) -> TxnResult<()>;

    fn set_code(&mut self, address: Address, code: Vec<u8>) -> TxnResult<()>;

    fn contract_exists(&mut self, address: Address) -> TxnResult<bool>;

    fn self_destruct(&mut self, address: Address) -> TxnResult<()>;

    fn add_log(&mut self, log: Log);

    fn add_refund(&mut self, gas: u64);

    fn sub_refund(&mut self, gas: u64);

    fn add_out_transaction(
        &mut self,
        caller: Address,
        payload: InternalTransactionPayload,
    ) -> TxnResult<()>;

    /// Send a request. Non-await requests keep `payload.request_context`
    /// for the callback; await requests are followed by
    /// [`VmHost::save_continuation`].
    fn add_request(
        &mut self,
        caller: Address,
        payload: InternalTransactionPayload,
        response_gas: Gas,
        is_await: bool,
    ) -> TxnResult<()>;

    /// Store the VM state to resume when the last request's response arrives.
    fn save_continuation(&mut self, address: Address, state: Vec<u8>, response_gas: Gas) -> TxnResult<()>;
}
