use crate::error::VaultError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a depositor, the manager, the vault itself or any custody holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AccountId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Registry identity of a yield adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdapterId(String);

impl AdapterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AdapterId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AdapterId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle of a queued withdrawal. `Processed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Processed,
    Cancelled,
}

impl WithdrawalStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Validate a status change for the request at `index`.
    pub fn transition(self, index: u64, next: WithdrawalStatus) -> Result<Self, VaultError> {
        let allowed = matches!(
            (self, next),
            (Self::Pending, Self::Processed) | (Self::Pending, Self::Cancelled)
        );
        if !allowed {
            if self.is_terminal() {
                return Err(VaultError::RequestFinalized {
                    index,
                    status: self,
                });
            }
            return Err(VaultError::InvariantViolation(format!(
                "withdrawal {index} transition not allowed: {:?} -> {:?}",
                self, next
            )));
        }
        Ok(next)
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Queued withdrawal. The index is a permanent handle; entries are never removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub index: u64,
    pub owner: AccountId,
    pub amount_minor: u64,
    pub requested_at: DateTime<Utc>,
    pub status: WithdrawalStatus,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Aggregate view over the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultTotals {
    pub total_deposited_minor: u64,
    pub total_allocated_minor: u64,
    pub total_yield_minor: u64,
    pub local_liquidity_minor: u64,
    pub total_assets_minor: u64,
    pub pending_withdrawals: usize,
}

/// Router bookkeeping for one registered adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterPosition {
    pub adapter: AdapterId,
    /// Zero-based cascade priority (registration order).
    pub priority: usize,
    pub allocated_minor: u64,
    pub credited_yield_minor: u64,
}

pub(crate) fn checked_add(lhs: u64, rhs: u64, context: &'static str) -> Result<u64, VaultError> {
    lhs.checked_add(rhs).ok_or(VaultError::Overflow(context))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_moves_to_either_terminal_state() {
        assert_eq!(
            WithdrawalStatus::Pending
                .transition(0, WithdrawalStatus::Processed)
                .unwrap(),
            WithdrawalStatus::Processed
        );
        assert_eq!(
            WithdrawalStatus::Pending
                .transition(0, WithdrawalStatus::Cancelled)
                .unwrap(),
            WithdrawalStatus::Cancelled
        );
    }

    #[test]
    fn terminal_states_are_sticky() {
        let err = WithdrawalStatus::Cancelled
            .transition(4, WithdrawalStatus::Processed)
            .unwrap_err();
        assert!(matches!(
            err,
            VaultError::RequestFinalized {
                index: 4,
                status: WithdrawalStatus::Cancelled
            }
        ));
        assert!(WithdrawalStatus::Processed
            .transition(4, WithdrawalStatus::Processed)
            .is_err());
    }

    #[test]
    fn identities_serialize_transparently() {
        let json = serde_json::to_string(&AccountId::from("alice")).unwrap();
        assert_eq!(json, "\"alice\"");
    }
}
