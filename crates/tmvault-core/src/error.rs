use crate::types::{AccountId, AdapterId, WithdrawalStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Coarse error taxonomy used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authorization,
    State,
    Resource,
    External,
    Internal,
}

/// Vault errors.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("amount {amount} exceeds the single-withdrawal ceiling of {ceiling}")]
    AmountOverCeiling { amount: u64, ceiling: u64 },

    #[error("withdrawal request {index} does not exist (queue length {len})")]
    IndexOutOfRange { index: u64, len: u64 },

    #[error("adapter '{0}' is not registered")]
    AdapterNotRegistered(AdapterId),

    #[error("adapter '{0}' is already registered")]
    AdapterAlreadyRegistered(AdapterId),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("caller '{caller}' is not the vault manager")]
    NotManager { caller: AccountId },

    #[error("caller '{caller}' does not own withdrawal request {index}")]
    NotRequestOwner { caller: AccountId, index: u64 },

    #[error("withdrawal request {index} is already {status}")]
    RequestFinalized { index: u64, status: WithdrawalStatus },

    #[error("reentrant vault call rejected during '{operation}'")]
    Reentrancy { operation: &'static str },

    #[error("insufficient balance for '{account}': requested {requested}, available {available}")]
    InsufficientBalance {
        account: AccountId,
        requested: u64,
        available: u64,
    },

    #[error("insufficient liquidity: requested {requested}, available {available}")]
    InsufficientLiquidity { requested: u64, available: u64 },

    #[error("adapter '{adapter}' holds {allocated}, cannot deallocate {requested}")]
    InsufficientAllocation {
        adapter: AdapterId,
        requested: u64,
        allocated: u64,
    },

    #[error("withdrawal queue is at capacity ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("withdrawal request {index} is cooling down until {ready_at}")]
    CooldownActive { index: u64, ready_at: DateTime<Utc> },

    #[error("custody transfer rejected: {0}")]
    TransferRejected(String),

    #[error("adapter '{adapter}' failed: {message}")]
    AdapterFailure { adapter: AdapterId, message: String },

    #[error("custody asset error: {0}")]
    Custody(String),

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ZeroAmount
            | Self::AmountOverCeiling { .. }
            | Self::IndexOutOfRange { .. }
            | Self::AdapterNotRegistered(_)
            | Self::AdapterAlreadyRegistered(_)
            | Self::Config(_) => ErrorKind::Validation,
            Self::NotManager { .. } | Self::NotRequestOwner { .. } => ErrorKind::Authorization,
            Self::RequestFinalized { .. } | Self::Reentrancy { .. } => ErrorKind::State,
            Self::InsufficientBalance { .. }
            | Self::InsufficientLiquidity { .. }
            | Self::InsufficientAllocation { .. }
            | Self::QueueFull { .. }
            | Self::CooldownActive { .. }
            | Self::TransferRejected(_) => ErrorKind::Resource,
            Self::AdapterFailure { .. } | Self::Custody(_) => ErrorKind::External,
            Self::Overflow(_) | Self::InvariantViolation(_) => ErrorKind::Internal,
        }
    }

    pub fn adapter_failure(adapter: &AdapterId, message: impl Into<String>) -> Self {
        Self::AdapterFailure {
            adapter: adapter.clone(),
            message: message.into(),
        }
    }
}
