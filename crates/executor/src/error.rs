use quill_gas::GasError;
use quill_ledger::LedgerError;
use quill_mempool::MempoolError;
use quill_types::{Amount, TxError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Synchronous rejection of a submitted transaction. A rejected
/// transaction never consumes a nonce.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("malformed transaction: {0}")]
    Malformed(String),
    #[error("invalid chain id: expected {expected}, got {got}")]
    InvalidChainId { expected: u32, got: u32 },
    #[error("invalid signature: {0}")]
    InvalidSignature(#[source] TxError),
    #[error("invalid gas parameters: {0}")]
    InvalidGas(#[from] GasError),
    #[error("invalid nonce: expected {expected}..={max_allowed}, got {got}")]
    InvalidNonce {
        expected: u64,
        max_allowed: u64,
        got: u64,
    },
    #[error("insufficient funds: have {available}, need {required} for gas")]
    InsufficientFunds { available: Amount, required: Amount },
    #[error("rejected by mempool: {0}")]
    Pool(#[from] MempoolError),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<LedgerError> for SubmitError {
    fn from(err: LedgerError) -> Self {
        SubmitError::Internal(err.into())
    }
}

impl SubmitError {
    pub fn kind(&self) -> SubmitErrorKind {
        match self {
            SubmitError::Malformed(_) => SubmitErrorKind::Malformed,
            SubmitError::InvalidChainId { .. } => SubmitErrorKind::InvalidChainId,
            SubmitError::InvalidSignature(_) => SubmitErrorKind::InvalidSignature,
            SubmitError::InvalidGas(_) => SubmitErrorKind::InvalidGas,
            SubmitError::InvalidNonce { .. } => SubmitErrorKind::InvalidNonce,
            SubmitError::InsufficientFunds { .. } => SubmitErrorKind::InsufficientFunds,
            SubmitError::Pool(_) => SubmitErrorKind::Pool,
            SubmitError::Internal(_) => SubmitErrorKind::Internal,
        }
    }

    /// Whether the client supplied something invalid, as opposed to a node fault.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, SubmitError::Internal(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubmitErrorKind {
    Malformed,
    InvalidChainId,
    InvalidSignature,
    InvalidGas,
    InvalidNonce,
    InsufficientFunds,
    Pool,
    Internal,
}

impl SubmitErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmitErrorKind::Malformed => "malformed",
            SubmitErrorKind::InvalidChainId => "invalid_chain_id",
            SubmitErrorKind::InvalidSignature => "invalid_signature",
            SubmitErrorKind::InvalidGas => "invalid_gas",
            SubmitErrorKind::InvalidNonce => "invalid_nonce",
            SubmitErrorKind::InsufficientFunds => "insufficient_funds",
            SubmitErrorKind::Pool => "pool",
            SubmitErrorKind::Internal => "internal",
        }
    }
}

/// Reasons a pooled transaction could not be applied in a block. Failures
/// that still consume the nonce are not errors; they produce a failed
/// receipt instead.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("nonce not ready (expected {expected}, got {got})")]
    NonceMismatch { expected: u64, got: u64 },
    #[error("sender can no longer cover the gas limit: have {available}, need {required}")]
    Unaffordable { available: Amount, required: Amount },
    #[error("balance arithmetic overflowed")]
    Overflow,
    #[error(transparent)]
    Gas(#[from] GasError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Outcome of a receipt or event lookup that did not yield a result.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("transaction not found")]
    NotFound,
    #[error("transaction is pending")]
    Pending,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
