use crate::error::VaultError;
use crate::types::{AccountId, AdapterId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Observable vault event. Each carries the acting identity and amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VaultEvent {
    Deposited {
        caller: AccountId,
        receiver: AccountId,
        amount_minor: u64,
    },
    InstantWithdrawn {
        owner: AccountId,
        amount_minor: u64,
    },
    ProtocolSet {
        caller: AccountId,
        adapter: AdapterId,
    },
    AdapterRemoved {
        caller: AccountId,
        adapter: AdapterId,
    },
    Allocated {
        caller: AccountId,
        adapter: AdapterId,
        amount_minor: u64,
    },
    /// `acknowledged` is false when the adapter's withdraw call failed and the
    /// bookkeeping moved anyway.
    Deallocated {
        caller: AccountId,
        adapter: AdapterId,
        amount_minor: u64,
        acknowledged: bool,
    },
    YieldCollected {
        caller: AccountId,
        adapter: AdapterId,
        amount_minor: u64,
    },
    WithdrawalQueued {
        owner: AccountId,
        amount_minor: u64,
        index: u64,
    },
    WithdrawalProcessed {
        caller: AccountId,
        owner: AccountId,
        amount_minor: u64,
        index: u64,
    },
    WithdrawalCancelled {
        owner: AccountId,
        amount_minor: u64,
        index: u64,
    },
    ManagerTransferred {
        previous: AccountId,
        next: AccountId,
    },
    EmergencyRecall {
        caller: AccountId,
        amount_minor: u64,
    },
}

impl VaultEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Deposited { .. } => "deposited",
            Self::InstantWithdrawn { .. } => "instant_withdrawn",
            Self::ProtocolSet { .. } => "protocol_set",
            Self::AdapterRemoved { .. } => "adapter_removed",
            Self::Allocated { .. } => "allocated",
            Self::Deallocated { .. } => "deallocated",
            Self::YieldCollected { .. } => "yield_collected",
            Self::WithdrawalQueued { .. } => "withdrawal_queued",
            Self::WithdrawalProcessed { .. } => "withdrawal_processed",
            Self::WithdrawalCancelled { .. } => "withdrawal_cancelled",
            Self::ManagerTransferred { .. } => "manager_transferred",
            Self::EmergencyRecall { .. } => "emergency_recall",
        }
    }
}

/// Hash-chained journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub entry_id: String,
    pub index: u64,
    pub event: VaultEvent,
    pub recorded_at: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Append-only event journal with hash-chain proofs.
///
/// No in-place mutation APIs are exposed; state changes only ever add records.
#[derive(Debug, Default, Clone)]
pub struct EventJournal {
    entries: Vec<JournalEntry>,
}

impl EventJournal {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild a journal from persisted entries and verify hash-chain integrity.
    pub fn from_entries(entries: Vec<JournalEntry>) -> Result<Self, VaultError> {
        let journal = Self { entries };

        for (expected_index, entry) in journal.entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(VaultError::InvariantViolation(format!(
                    "journal index gap detected at position {} (found {})",
                    expected_index, entry.index
                )));
            }
        }

        if !journal.verify_chain() {
            return Err(VaultError::InvariantViolation(
                "persisted journal hash-chain verification failed".to_string(),
            ));
        }

        Ok(journal)
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries with `index >= since`, at most `limit` of them.
    pub fn since(&self, since: u64, limit: usize) -> Vec<JournalEntry> {
        let start = usize::try_from(since).unwrap_or(usize::MAX);
        self.entries.iter().skip(start).take(limit).cloned().collect()
    }

    pub fn append(&mut self, event: VaultEvent, recorded_at: DateTime<Utc>) -> JournalEntry {
        let index = self.entries.len() as u64;
        let previous_hash = self.entries.last().map(|entry| entry.entry_hash.clone());
        let entry_hash = compute_entry_hash(index, &event, recorded_at, previous_hash.as_deref());

        let entry = JournalEntry {
            entry_id: Uuid::new_v4().to_string(),
            index,
            event,
            recorded_at,
            previous_hash,
            entry_hash,
        };
        self.entries.push(entry.clone());
        entry
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            let expected_hash = compute_entry_hash(
                entry.index,
                &entry.event,
                entry.recorded_at,
                previous_hash.as_deref(),
            );
            if entry.entry_hash != expected_hash {
                return false;
            }
            if entry.previous_hash != previous_hash {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }
}

fn compute_entry_hash(
    index: u64,
    event: &VaultEvent,
    recorded_at: DateTime<Utc>,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "index": index,
        "event": event,
        "recorded_at": recorded_at,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}
