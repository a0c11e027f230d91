//! Pooled-asset custody ledger.
//!
//! Depositors place a fungible asset into a shared pool. The manager routes idle
//! liquidity to pluggable yield adapters, and depositors withdraw either
//! instantly from local liquidity or through a cool-down queue that may pull
//! funds back from adapters. Every public operation on [`PoolVault`] commits
//! all-or-nothing and appends to a hash-chained event journal.

#![deny(unsafe_code)]

pub mod access;
pub mod clock;
pub mod connectors;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod queue;
pub mod router;
pub mod runtime;
pub mod types;

pub use access::AccessControl;
pub use clock::{Clock, ManualClock, SystemClock};
pub use connectors::{require_success, CustodyAsset, InMemoryAsset, YieldAdapter};
pub use error::{ErrorKind, VaultError};
pub use journal::{EventJournal, JournalEntry, VaultEvent};
pub use ledger::{Ledger, LedgerTotals};
pub use queue::{QueuePolicy, WithdrawalQueue};
pub use router::{AllocationRouter, CascadeStep};
pub use runtime::{PoolVault, VaultConfig};
pub use types::{
    AccountId, AdapterId, AdapterPosition, VaultTotals, WithdrawalRequest, WithdrawalStatus,
};
