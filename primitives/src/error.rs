//! Error types for the Meridian execution layer.
//!
//! Two tiers:
//! - [`ExecError`] is recoverable. It is recorded in the transaction's receipt
//!   under a stable [`ErrorCode`], consumes gas, and never aborts a block.
//! - [`FatalError`] aborts the whole block or proposal build and leaves no
//!   partial commit behind.

use core::fmt;

use crate::codec::CodecError;

/// Stable receipt status codes.
///
/// The numeric values are persisted in receipts and MUST never be reordered.
/// New codes are appended at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    Unknown = 1,
    Execution = 2,
    OutOfGas = 3,
    Bounce = 4,
    BuyGas = 5,
    Validation = 6,
    InsufficientBalance = 7,
    NoAccount = 8,
    ContractAddressCollision = 9,
    ExecutionReverted = 10,
    InvalidCode = 11,
    SeqnoOverflow = 12,
    ForwardingFailed = 13,
    ExternalVerificationFailed = 14,
    InsufficientFunds = 15,
    DestinationContractDoesNotExist = 16,
    ContractAlreadyExists = 17,
    ContractDoesNotExist = 18,
    SeqnoGap = 19,
    InvalidChainId = 20,
    InvalidPayload = 21,
    DeployToMainShard = 22,
    IncorrectDeploymentAddress = 23,
    RefundTransactionIsNotAllowedInExternalTransactions = 24,
    MaxFeePerGasIsZero = 25,
    BaseFeeTooHigh = 26,
    RefundAddressIsEmpty = 27,
    GasRefundFailed = 28,
    PanicDuringExecution = 29,
    TxIdGap = 30,
    AwaitCallTooShortContextData = 31,
    InvalidOpcode = 32,
    InvalidTransactionFlags = 33,
    BalanceOverflow = 34,
}

impl ErrorCode {
    const ALL: [ErrorCode; 35] = [
        Self::Success,
        Self::Unknown,
        Self::Execution,
        Self::OutOfGas,
        Self::Bounce,
        Self::BuyGas,
        Self::Validation,
        Self::InsufficientBalance,
        Self::NoAccount,
        Self::ContractAddressCollision,
        Self::ExecutionReverted,
        Self::InvalidCode,
        Self::SeqnoOverflow,
        Self::ForwardingFailed,
        Self::ExternalVerificationFailed,
        Self::InsufficientFunds,
        Self::DestinationContractDoesNotExist,
        Self::ContractAlreadyExists,
        Self::ContractDoesNotExist,
        Self::SeqnoGap,
        Self::InvalidChainId,
        Self::InvalidPayload,
        Self::DeployToMainShard,
        Self::IncorrectDeploymentAddress,
        Self::RefundTransactionIsNotAllowedInExternalTransactions,
        Self::MaxFeePerGasIsZero,
        Self::BaseFeeTooHigh,
        Self::RefundAddressIsEmpty,
        Self::GasRefundFailed,
        Self::PanicDuringExecution,
        Self::TxIdGap,
        Self::AwaitCallTooShortContextData,
        Self::InvalidOpcode,
        Self::InvalidTransactionFlags,
        Self::BalanceOverflow,
    ];

    /// Convert from the numeric code stored in a receipt.
    pub fn from_u32(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Return the numeric representation of this error code.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The variant name is the canonical string form.
        fmt::Debug::fmt(self, f)
    }
}

/// Recoverable transaction error.
///
/// Carries the stable code and an optional human-readable detail, e.g. the
/// decoded revert reason or the wrapped lower-level error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecError {
    code: ErrorCode,
    message: Option<String>,
}

impl ExecError {
    pub fn new(code: ErrorCode) -> Self {
        Self { code, message: None }
    }

    /// An error with an additional message, e.g. a revert reason.
    pub fn verbose(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Wrap a foreign error under `code`.
    pub fn wrap(code: ErrorCode, inner: impl fmt::Display) -> Self {
        Self::verbose(code, inner.to_string())
    }

    /// Keep an existing `ExecError` as is, otherwise wrap it under `code`.
    pub fn keep_or_wrap(code: ErrorCode, err: impl Into<AnyError>) -> Self {
        match err.into() {
            AnyError::Exec(e) => e,
            AnyError::Other(msg) => Self::verbose(code, msg),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.code, msg),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for ExecError {}

impl From<ErrorCode> for ExecError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

/// Input accepted by [`ExecError::keep_or_wrap`].
#[derive(Debug)]
pub enum AnyError {
    Exec(ExecError),
    Other(String),
}

impl From<ExecError> for AnyError {
    fn from(e: ExecError) -> Self {
        Self::Exec(e)
    }
}

impl From<String> for AnyError {
    fn from(s: String) -> Self {
        Self::Other(s)
    }
}

impl From<&str> for AnyError {
    fn from(s: &str) -> Self {
        Self::Other(s.to_string())
    }
}

/// Errors that abort the whole block or proposal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("config error: {0}")]
    Config(String),
}

impl FatalError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience result type for fatal-only paths.
pub type FatalResult<T> = Result<T, FatalError>;
