//! Reference byte-code interpreter.
//!
//! A program is a flat sequence of instructions, each an opcode byte followed
//! by fixed-layout operands. Integers are big-endian; byte strings carry a
//! `u16` length prefix. Running off the end of the program is a `STOP`.
//!
//! Failed calls burn all remaining gas except on `REVERT`, which returns the
//! unused gas and an encoded reason string.

use std::collections::BTreeSet;

use meridian_primitives::crypto::verify_ed25519;
use meridian_primitives::gas::{
    gas_cost_code_deposit, gas_cost_log, gas_cost_state_set, G_CALL, G_PER_BYTE, G_SEND,
    G_STATE_GET, G_STATE_SET, G_VERIFY_ED25519,
};
use meridian_primitives::{
    Address, ErrorCode, ExecError, ForwardKind, Gas, GasMeter, Hash, InternalTransactionPayload,
    Log, TokenBalance, TransactionKind, Value, ZERO_HASH,
};

use super::{CallFrame, Resume, Vm, VmHost, VmOutcome};
use crate::result::{TxnError, TxnResult};

/// Flat charge for decoding and dispatching any instruction.
const STEP_GAS: u64 = 3;

/// Selector prefixed to revert reasons.
const REVERT_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
const REVERT_HEADER_LEN: usize = 68;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Stop = 0x00,
    /// `pk[32]`: marks the account as authenticated by an ed25519 key.
    Auth = 0x01,
    SStore = 0x02,
    Log = 0x03,
    Send = 0x04,
    Request = 0x05,
    Return = 0x06,
    Revert = 0x07,
    Burn = 0x08,
    /// Continue with the call input as the program.
    ExecInput = 0x09,
    /// Increment the `u64` counter kept in a storage slot.
    SInc = 0x0A,
    SelfDestruct = 0x0B,
    TStore = 0x0C,
    /// Return the data of the response that resumed this program.
    ResponseData = 0x0D,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Self::Stop,
            0x01 => Self::Auth,
            0x02 => Self::SStore,
            0x03 => Self::Log,
            0x04 => Self::Send,
            0x05 => Self::Request,
            0x06 => Self::Return,
            0x07 => Self::Revert,
            0x08 => Self::Burn,
            0x09 => Self::ExecInput,
            0x0A => Self::SInc,
            0x0B => Self::SelfDestruct,
            0x0C => Self::TStore,
            0x0D => Self::ResponseData,
            _ => return None,
        })
    }

    /// Whether the instruction may not run inside a static call.
    fn mutates(self) -> bool {
        matches!(
            self,
            Self::SStore
                | Self::Log
                | Self::Send
                | Self::Request
                | Self::SInc
                | Self::SelfDestruct
                | Self::TStore
        )
    }
}

/// ABI-style revert payload: selector, offset word, length word, padded string.
pub fn encode_revert_reason(reason: &str) -> Vec<u8> {
    let bytes = reason.as_bytes();
    let padded = bytes.len().div_ceil(32) * 32;
    let mut out = Vec::with_capacity(REVERT_HEADER_LEN + padded);
    out.extend_from_slice(&REVERT_SELECTOR);
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&32u64.to_be_bytes());
    out.extend_from_slice(&word);
    word[24..].copy_from_slice(&(bytes.len() as u64).to_be_bytes());
    out.extend_from_slice(&word);
    out.extend_from_slice(bytes);
    out.resize(REVERT_HEADER_LEN + padded, 0);
    out
}

/// Reason string of a revert payload, up to the first NUL byte.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    if data.len() <= REVERT_HEADER_LEN {
        return None;
    }
    let tail = &data[REVERT_HEADER_LEN..];
    let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&tail[..end]).into_owned())
}

fn invalid_code(what: &str) -> TxnError {
    ExecError::verbose(ErrorCode::InvalidCode, what.to_string()).into()
}

struct Cursor<'a> {
    code: &'a [u8],
    pc: usize,
}

impl<'a> Cursor<'a> {
    fn new(code: &'a [u8], pc: usize) -> Self {
        Self { code, pc }
    }

    fn at_end(&self) -> bool {
        self.pc >= self.code.len()
    }

    fn bytes(&mut self, n: usize) -> TxnResult<&'a [u8]> {
        let end = self.pc.checked_add(n).filter(|end| *end <= self.code.len());
        let Some(end) = end else {
            return Err(invalid_code("truncated operand"));
        };
        let code = self.code;
        let out = &code[self.pc..end];
        self.pc = end;
        Ok(out)
    }

    fn u8(&mut self) -> TxnResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> TxnResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> TxnResult<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn u128(&mut self) -> TxnResult<u128> {
        let mut buf = [0u8; 16];
        buf.copy_from_slice(self.bytes(16)?);
        Ok(u128::from_be_bytes(buf))
    }

    fn hash(&mut self) -> TxnResult<Hash> {
        let mut buf = [0u8; 32];
        buf.copy_from_slice(self.bytes(32)?);
        Ok(buf)
    }

    fn address(&mut self) -> TxnResult<Address> {
        let mut buf = [0u8; 20];
        buf.copy_from_slice(self.bytes(20)?);
        Ok(Address::from_bytes(buf))
    }

    fn var_bytes(&mut self) -> TxnResult<Vec<u8>> {
        let len = self.u16()? as usize;
        Ok(self.bytes(len)?.to_vec())
    }
}

enum Halt {
    Stop,
    Return(Vec<u8>),
    Revert(String),
}

enum Flow {
    Next,
    ExecInput,
    Halt(Halt),
}

fn encode_continuation(pc: usize, program: &[u8]) -> Vec<u8> {
    let mut state = Vec::with_capacity(4 + program.len());
    state.extend_from_slice(&(pc as u32).to_be_bytes());
    state.extend_from_slice(program);
    state
}

fn decode_continuation(state: &[u8]) -> TxnResult<(usize, &[u8])> {
    if state.len() < 4 {
        return Err(invalid_code("continuation too short"));
    }
    let pc = u32::from_be_bytes([state[0], state[1], state[2], state[3]]) as usize;
    Ok((pc, &state[4..]))
}

struct Machine<'h> {
    host: &'h mut dyn VmHost,
    frame: &'h CallFrame,
    meter: GasMeter,
    response: Vec<u8>,
    cleared: BTreeSet<Hash>,
}

impl<'h> Machine<'h> {
    fn new(host: &'h mut dyn VmHost, frame: &'h CallFrame) -> Self {
        Self {
            host,
            frame,
            meter: GasMeter::new(frame.gas),
            response: Vec::new(),
            cleared: BTreeSet::new(),
        }
    }

    fn charge(&mut self, gas: u64) -> TxnResult<()> {
        Ok(self.meter.consume(gas)?)
    }

    fn finish(mut self, result: Result<Halt, (TxnError, u32)>) -> VmOutcome {
        match result {
            Ok(Halt::Stop) => VmOutcome::success(Vec::new(), self.meter.remaining()),
            Ok(Halt::Return(data)) => VmOutcome::success(data, self.meter.remaining()),
            Ok(Halt::Revert(reason)) => VmOutcome {
                return_data: encode_revert_reason(&reason),
                gas_left: self.meter.remaining(),
                error: Some(ExecError::new(ErrorCode::ExecutionReverted).into()),
                pc: 0,
            },
            Err((err, pc)) => {
                self.meter.exhaust();
                VmOutcome::failure(err, self.meter.remaining(), pc)
            }
        }
    }

    fn run(&mut self, code: &[u8], input: &[u8], start_pc: usize) -> Result<Halt, (TxnError, u32)> {
        let mut program = code;
        let mut cursor = Cursor::new(program, start_pc);
        loop {
            if cursor.at_end() {
                return Ok(Halt::Stop);
            }
            let pc = cursor.pc;
            match self.step(&mut cursor, program) {
                Ok(Flow::Next) => {}
                Ok(Flow::ExecInput) => {
                    program = input;
                    cursor = Cursor::new(program, 0);
                }
                Ok(Flow::Halt(halt)) => return Ok(halt),
                Err(err) => return Err((err, pc as u32)),
            }
        }
    }

    fn step(&mut self, cur: &mut Cursor<'_>, program: &[u8]) -> TxnResult<Flow> {
        let byte = cur.u8()?;
        let op = Opcode::from_u8(byte).ok_or_else(|| {
            ExecError::verbose(ErrorCode::InvalidOpcode, format!("0x{byte:02x}"))
        })?;
        self.charge(STEP_GAS)?;
        if self.frame.read_only && op.mutates() {
            return Err(ExecError::verbose(ErrorCode::Execution, format!("{op:?} in static call")).into());
        }
        let me = self.frame.address;

        match op {
            Opcode::Stop => return Ok(Flow::Halt(Halt::Stop)),
            Opcode::Auth => {
                cur.bytes(32)?;
            }
            Opcode::SStore => {
                let key = cur.hash()?;
                let value = cur.hash()?;
                self.charge(gas_cost_state_set(32, 32))?;
                let old = self.host.get_state(me, &key)?;
                if old != ZERO_HASH && value == ZERO_HASH {
                    self.host.add_refund(G_STATE_SET);
                    self.cleared.insert(key);
                } else if value != ZERO_HASH && self.cleared.remove(&key) {
                    self.host.sub_refund(G_STATE_SET);
                }
                self.host.set_state(me, key, value)?;
            }
            Opcode::SInc => {
                let key = cur.hash()?;
                self.charge(gas_cost_state_set(32, 32))?;
                let old = self.host.get_state(me, &key)?;
                let mut counter = [0u8; 8];
                counter.copy_from_slice(&old[24..]);
                let next = u64::from_be_bytes(counter)
                    .checked_add(1)
                    .ok_or_else(|| ExecError::verbose(ErrorCode::Execution, "counter overflow"))?;
                let mut value = ZERO_HASH;
                value[24..].copy_from_slice(&next.to_be_bytes());
                self.host.set_state(me, key, value)?;
            }
            Opcode::TStore => {
                let key = cur.hash()?;
                let value = cur.hash()?;
                self.charge(G_STATE_GET)?;
                self.host.set_transient_state(me, key, value);
            }
            Opcode::Log => {
                let n = cur.u8()? as usize;
                let mut topics = Vec::with_capacity(n);
                for _ in 0..n {
                    topics.push(cur.hash()?);
                }
                let data = cur.var_bytes()?;
                self.charge(gas_cost_log(topics.len(), data.len()))?;
                self.host.add_log(Log {
                    address: me,
                    topics,
                    data,
                });
            }
            Opcode::Send => {
                let to = cur.address()?;
                let value = Value(cur.u128()?);
                let forward_kind =
                    ForwardKind::from_u8(cur.u8()?).ok_or_else(|| invalid_code("forward kind"))?;
                let fee_credit = Value(cur.u128()?);
                let bounce = cur.u8()? != 0;
                let n = cur.u8()? as usize;
                let mut token = Vec::with_capacity(n);
                for _ in 0..n {
                    token.push(TokenBalance {
                        token: cur.address()?,
                        balance: Value(cur.u128()?),
                    });
                }
                let data = cur.var_bytes()?;
                self.charge(G_SEND.saturating_add((data.len() as u64).saturating_mul(G_PER_BYTE)))?;
                self.host.sub_balance(me, value)?;
                let payload = InternalTransactionPayload {
                    kind: TransactionKind::Execution,
                    fee_credit,
                    forward_kind,
                    to,
                    bounce_to: if bounce { me } else { Address::EMPTY },
                    token,
                    value,
                    data,
                    ..Default::default()
                };
                self.host.add_out_transaction(me, payload)?;
            }
            Opcode::Request => {
                let to = cur.address()?;
                let value = Value(cur.u128()?);
                let is_await = cur.u8()? != 0;
                let response_gas = Gas(cur.u64()?);
                let request_context = cur.var_bytes()?;
                let data = cur.var_bytes()?;
                self.charge(
                    G_SEND
                        .saturating_add(response_gas.0)
                        .saturating_add((data.len() as u64).saturating_mul(G_PER_BYTE)),
                )?;
                self.host.sub_balance(me, value)?;
                let payload = InternalTransactionPayload {
                    kind: TransactionKind::Execution,
                    forward_kind: ForwardKind::Remaining,
                    to,
                    value,
                    data,
                    request_context,
                    ..Default::default()
                };
                self.host.add_request(me, payload, response_gas, is_await)?;
                if is_await {
                    let state = encode_continuation(cur.pc, program);
                    self.host.save_continuation(me, state, response_gas)?;
                    return Ok(Flow::Halt(Halt::Stop));
                }
            }
            Opcode::Return => {
                let data = cur.var_bytes()?;
                return Ok(Flow::Halt(Halt::Return(data)));
            }
            Opcode::Revert => {
                let reason = cur.var_bytes()?;
                return Ok(Flow::Halt(Halt::Revert(String::from_utf8_lossy(&reason).into_owned())));
            }
            Opcode::ResponseData => {
                return Ok(Flow::Halt(Halt::Return(std::mem::take(&mut self.response))));
            }
            Opcode::Burn => {
                let gas = cur.u64()?;
                self.charge(gas)?;
            }
            Opcode::ExecInput => {
                self.charge(G_CALL)?;
                return Ok(Flow::ExecInput);
            }
            Opcode::SelfDestruct => {
                self.host.self_destruct(me)?;
                return Ok(Flow::Halt(Halt::Stop));
            }
        }
        Ok(Flow::Next)
    }
}

/// The reference VM.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interpreter;

impl Interpreter {
    pub fn new() -> Self {
        Self
    }
}

impl Vm for Interpreter {
    fn deploy(&self, host: &mut dyn VmHost, frame: &CallFrame, code: &[u8]) -> VmOutcome {
        let mut m = Machine::new(host, frame);
        let result = m
            .charge(gas_cost_code_deposit(code.len()))
            .and_then(|_| m.host.set_code(frame.address, code.to_vec()))
            .map(|_| Halt::Stop)
            .map_err(|e| (e, 0));
        m.finish(result)
    }

    fn call(
        &self,
        host: &mut dyn VmHost,
        frame: &CallFrame,
        code: &[u8],
        input: &[u8],
        resume: Option<Resume>,
    ) -> VmOutcome {
        let mut m = Machine::new(host, frame);
        if let Err(e) = m.charge(G_CALL) {
            return m.finish(Err((e, 0)));
        }
        let result = match resume {
            None => m.run(code, input, 0),
            Some(resume) => {
                m.response = resume.return_data;
                match decode_continuation(&resume.state) {
                    Ok((pc, program)) => m.run(program, input, pc),
                    Err(e) => Err((e, 0)),
                }
            }
        };
        m.finish(result)
    }

    fn verify_external(
        &self,
        host: &mut dyn VmHost,
        frame: &CallFrame,
        code: &[u8],
        signing_hash: &Hash,
        signature: &[u8],
    ) -> VmOutcome {
        let mut m = Machine::new(host, frame);
        if let Err(e) = m.charge(G_VERIFY_ED25519) {
            return m.finish(Err((e, 0)));
        }
        if code.len() < 33 || code[0] != Opcode::Auth as u8 {
            let err = ExecError::verbose(ErrorCode::ExternalVerificationFailed, "no auth header");
            return m.finish(Err((err.into(), 0)));
        }
        let mut pk = [0u8; 32];
        pk.copy_from_slice(&code[1..33]);
        let mut word = vec![0u8; 32];
        if verify_ed25519(signing_hash, signature, &pk) {
            word[31] = 1;
        }
        m.finish(Ok(Halt::Return(word)))
    }
}
