//! Builder for interpreter byte code.

use meridian_primitives::{Address, ForwardKind, Gas, Hash, TokenBalance, Value};

use super::interpreter::Opcode;

/// Operands of a `SEND` instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendMessage {
    pub to: Address,
    pub value: Value,
    pub forward_kind: ForwardKind,
    pub fee_credit: Value,
    /// Return value and tokens to the sender if the message fails.
    pub bounce: bool,
    pub tokens: Vec<TokenBalance>,
    pub data: Vec<u8>,
}

/// Append-only program builder.
///
/// Byte-string operands are limited to `u16::MAX` bytes; longer ones panic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    code: Vec<u8>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Code of a wallet owned by `public_key`: authenticates external
    /// messages and runs each call's input as a program.
    pub fn wallet(public_key: &[u8; 32]) -> Vec<u8> {
        Self::new().auth(public_key).exec_input().build()
    }

    fn op(mut self, op: Opcode) -> Self {
        self.code.push(op as u8);
        self
    }

    fn var_bytes(mut self, data: &[u8]) -> Self {
        let len = u16::try_from(data.len());
        assert!(len.is_ok(), "operand of {} bytes does not fit a u16 length", data.len());
        self.code.extend_from_slice(&(data.len() as u16).to_be_bytes());
        self.code.extend_from_slice(data);
        self
    }

    fn raw(mut self, bytes: &[u8]) -> Self {
        self.code.extend_from_slice(bytes);
        self
    }

    pub fn stop(self) -> Self {
        self.op(Opcode::Stop)
    }

    pub fn auth(self, public_key: &[u8; 32]) -> Self {
        self.op(Opcode::Auth).raw(public_key)
    }

    pub fn exec_input(self) -> Self {
        self.op(Opcode::ExecInput)
    }

    pub fn sstore(self, key: Hash, value: Hash) -> Self {
        self.op(Opcode::SStore).raw(&key).raw(&value)
    }

    pub fn sinc(self, key: Hash) -> Self {
        self.op(Opcode::SInc).raw(&key)
    }

    pub fn tstore(self, key: Hash, value: Hash) -> Self {
        self.op(Opcode::TStore).raw(&key).raw(&value)
    }

    pub fn log(self, topics: &[Hash], data: &[u8]) -> Self {
        assert!(topics.len() <= u8::MAX as usize, "too many topics");
        let mut p = self.op(Opcode::Log).raw(&[topics.len() as u8]);
        for topic in topics {
            p = p.raw(topic);
        }
        p.var_bytes(data)
    }

    pub fn send(self, msg: &SendMessage) -> Self {
        assert!(msg.tokens.len() <= u8::MAX as usize, "too many tokens");
        let mut p = self
            .op(Opcode::Send)
            .raw(msg.to.as_bytes())
            .raw(&msg.value.0.to_be_bytes())
            .raw(&[msg.forward_kind as u8])
            .raw(&msg.fee_credit.0.to_be_bytes())
            .raw(&[msg.bounce as u8])
            .raw(&[msg.tokens.len() as u8]);
        for token in &msg.tokens {
            p = p.raw(token.token.as_bytes()).raw(&token.balance.0.to_be_bytes());
        }
        p.var_bytes(&msg.data)
    }

    pub fn request(
        self,
        to: Address,
        value: Value,
        is_await: bool,
        response_gas: Gas,
        context: &[u8],
        data: &[u8],
    ) -> Self {
        self.op(Opcode::Request)
            .raw(to.as_bytes())
            .raw(&value.0.to_be_bytes())
            .raw(&[is_await as u8])
            .raw(&response_gas.0.to_be_bytes())
            .var_bytes(context)
            .var_bytes(data)
    }

    pub fn ret(self, data: &[u8]) -> Self {
        self.op(Opcode::Return).var_bytes(data)
    }

    pub fn revert(self, reason: &str) -> Self {
        self.op(Opcode::Revert).var_bytes(reason.as_bytes())
    }

    pub fn response_data(self) -> Self {
        self.op(Opcode::ResponseData)
    }

    pub fn burn(self, gas: Gas) -> Self {
        self.op(Opcode::Burn).raw(&gas.0.to_be_bytes())
    }

    pub fn self_destruct(self) -> Self {
        self.op(Opcode::SelfDestruct)
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn build(self) -> Vec<u8> {
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_layout() {
        let code = Program::wallet(&[7u8; 32]);
        assert_eq!(code.len(), 34);
        assert_eq!(code[0], Opcode::Auth as u8);
        assert_eq!(&code[1..33], &[7u8; 32]);
        assert_eq!(code[33], Opcode::ExecInput as u8);
    }

    #[test]
    fn test_send_layout() {
        let msg = SendMessage {
            to: Address([1u8; 20]),
            value: Value(5),
            tokens: vec![TokenBalance {
                token: Address([2u8; 20]),
                balance: Value(3),
            }],
            data: vec![9, 9],
            ..Default::default()
        };
        let code = Program::new().send(&msg).build();
        // op + to + value + kind + credit + bounce + ntok + token + amount + len + data
        assert_eq!(code.len(), 1 + 20 + 16 + 1 + 16 + 1 + 1 + 20 + 16 + 2 + 2);
    }
}
