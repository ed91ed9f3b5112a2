//! Outcome of handling one transaction.

use meridian_primitives::{ErrorCode, ExecError, FatalError, Gas, Value};
use meridian_storage::StorageError;

/// Either tier of failure, for paths that can produce both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnError {
    Exec(ExecError),
    Fatal(FatalError),
}

impl TxnError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Exec(e) => e.code(),
            Self::Fatal(_) => ErrorCode::Unknown,
        }
    }

    /// Rewrap a recoverable error under `code`; fatal errors pass through.
    pub fn wrap(self, code: ErrorCode) -> Self {
        match self {
            Self::Exec(e) => Self::Exec(ExecError::wrap(code, e)),
            fatal => fatal,
        }
    }
}

impl std::fmt::Display for TxnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exec(e) => e.fmt(f),
            Self::Fatal(e) => e.fmt(f),
        }
    }
}

impl From<ExecError> for TxnError {
    fn from(e: ExecError) -> Self {
        Self::Exec(e)
    }
}

impl From<ErrorCode> for TxnError {
    fn from(code: ErrorCode) -> Self {
        Self::Exec(ExecError::new(code))
    }
}

impl From<FatalError> for TxnError {
    fn from(e: FatalError) -> Self {
        Self::Fatal(e)
    }
}

impl From<StorageError> for TxnError {
    fn from(e: StorageError) -> Self {
        Self::Fatal(e.into())
    }
}

pub type TxnResult<T> = Result<T, TxnError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub return_data: Vec<u8>,
    pub error: Option<ExecError>,
    pub fatal: Option<FatalError>,
    pub gas_used: Gas,
    pub gas_price: Value,
    pub coins_forwarded: Value,
    /// Program counter the VM stopped at when it failed.
    pub failed_pc: u32,
}

impl ExecutionResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error(mut self, err: impl Into<TxnError>) -> Self {
        self.set_error(err);
        self
    }

    pub fn set_error(&mut self, err: impl Into<TxnError>) {
        match err.into() {
            TxnError::Exec(e) => self.error = Some(e),
            TxnError::Fatal(e) => self.fatal = Some(e),
        }
    }

    pub fn set_fatal(&mut self, err: FatalError) {
        self.fatal = Some(err);
    }

    pub fn with_gas_price(mut self, price: Value) -> Self {
        self.gas_price = price;
        self
    }

    pub fn set_used(&mut self, gas: Gas) {
        self.gas_used = gas;
    }

    pub fn add_used(&mut self, gas: Gas) {
        self.gas_used = self.gas_used.saturating_add(gas);
    }

    pub fn coins_used(&self) -> Value {
        self.gas_used.to_value(self.gas_price)
    }

    /// Credit left after paying for gas and forwarding to child messages.
    pub fn left_over(&self, credit: Value) -> Value {
        credit
            .saturating_sub(self.coins_used())
            .saturating_sub(self.coins_forwarded)
    }

    pub fn failed(&self) -> bool {
        self.error.is_some() || self.fatal.is_some()
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    /// Receipt status of this result.
    pub fn status(&self) -> ErrorCode {
        match (&self.error, &self.fatal) {
            (_, Some(_)) => ErrorCode::Unknown,
            (Some(e), None) => e.code(),
            (None, None) => ErrorCode::Success,
        }
    }

    /// Split off the fatal error, if any.
    pub fn into_fatal(self) -> Result<Self, FatalError> {
        match self.fatal {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}
