use crate::error::VaultError;
use crate::types::{AccountId, WithdrawalRequest, WithdrawalStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fixed limits applied to queued withdrawals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePolicy {
    pub cooldown_secs: i64,
    pub max_withdrawal_minor: u64,
    pub max_pending: usize,
}

impl QueuePolicy {
    pub fn cooldown(&self) -> Result<Duration, VaultError> {
        Duration::try_seconds(self.cooldown_secs)
            .ok_or(VaultError::Overflow("withdrawal cooldown"))
    }

    /// Earliest instant a request made at `requested_at` may be processed.
    pub fn release_time(&self, requested_at: DateTime<Utc>) -> Result<DateTime<Utc>, VaultError> {
        requested_at
            .checked_add_signed(self.cooldown()?)
            .ok_or(VaultError::Overflow("withdrawal ready time"))
    }
}

/// Append-only withdrawal queue.
///
/// Indices are assigned sequentially and are permanent handles: entries are
/// never removed, only moved to a terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalQueue {
    policy: QueuePolicy,
    requests: Vec<WithdrawalRequest>,
    by_owner: BTreeMap<AccountId, Vec<u64>>,
    pending: usize,
}

impl WithdrawalQueue {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            requests: Vec::new(),
            by_owner: BTreeMap::new(),
            pending: 0,
        }
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    /// Number of requests ever created.
    pub fn len(&self) -> u64 {
        self.requests.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Requests still waiting to be processed or cancelled.
    pub fn pending_count(&self) -> usize {
        self.pending
    }

    pub fn requests(&self) -> &[WithdrawalRequest] {
        &self.requests
    }

    pub fn get(&self, index: u64) -> Result<&WithdrawalRequest, VaultError> {
        usize::try_from(index)
            .ok()
            .and_then(|position| self.requests.get(position))
            .ok_or(VaultError::IndexOutOfRange {
                index,
                len: self.len(),
            })
    }

    pub fn indices_of(&self, owner: &AccountId) -> &[u64] {
        self.by_owner
            .get(owner)
            .map(|indices| indices.as_slice())
            .unwrap_or(&[])
    }

    /// Amount and capacity checks that must pass before funds are reserved.
    pub fn check_admission(&self, amount: u64) -> Result<(), VaultError> {
        if amount == 0 {
            return Err(VaultError::ZeroAmount);
        }
        if amount > self.policy.max_withdrawal_minor {
            return Err(VaultError::AmountOverCeiling {
                amount,
                ceiling: self.policy.max_withdrawal_minor,
            });
        }
        if self.pending >= self.policy.max_pending {
            return Err(VaultError::QueueFull {
                capacity: self.policy.max_pending,
            });
        }
        Ok(())
    }

    /// Append a pending request and return its index.
    pub(crate) fn enqueue(
        &mut self,
        owner: &AccountId,
        amount: u64,
        requested_at: DateTime<Utc>,
    ) -> Result<u64, VaultError> {
        self.check_admission(amount)?;
        self.policy.release_time(requested_at)?;
        let index = self.len();
        self.requests.push(WithdrawalRequest {
            index,
            owner: owner.clone(),
            amount_minor: amount,
            requested_at,
            status: WithdrawalStatus::Pending,
            settled_at: None,
        });
        self.by_owner.entry(owner.clone()).or_default().push(index);
        self.pending += 1;
        Ok(index)
    }

    pub fn ready_at(&self, index: u64) -> Result<DateTime<Utc>, VaultError> {
        let request = self.get(index)?;
        self.policy.release_time(request.requested_at)
    }

    /// True iff the request is pending and its cool-down has elapsed at `now`.
    pub fn is_ready(&self, index: u64, now: DateTime<Utc>) -> bool {
        match (self.get(index), self.ready_at(index)) {
            (Ok(request), Ok(ready_at)) => {
                request.status == WithdrawalStatus::Pending && now >= ready_at
            }
            _ => false,
        }
    }

    /// Move a pending request whose cool-down has elapsed to `Processed`.
    pub(crate) fn mark_processed(
        &mut self,
        index: u64,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, VaultError> {
        let ready_at = self.ready_at(index)?;
        let status = self.get(index)?.status;
        status.transition(index, WithdrawalStatus::Processed)?;
        if now < ready_at {
            return Err(VaultError::CooldownActive { index, ready_at });
        }
        self.settle(index, WithdrawalStatus::Processed, now)
    }

    /// Move a pending request to `Cancelled`. Ownership is checked here so a
    /// foreign caller learns nothing beyond the authorization failure.
    pub(crate) fn mark_cancelled(
        &mut self,
        index: u64,
        caller: &AccountId,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, VaultError> {
        let request = self.get(index)?;
        if &request.owner != caller {
            return Err(VaultError::NotRequestOwner {
                caller: caller.clone(),
                index,
            });
        }
        request.status.transition(index, WithdrawalStatus::Cancelled)?;
        self.settle(index, WithdrawalStatus::Cancelled, now)
    }

    /// Check dense, increasing indices and the pending counter.
    pub fn verify(&self) -> Result<(), VaultError> {
        for (position, request) in self.requests.iter().enumerate() {
            if request.index != position as u64 {
                return Err(VaultError::InvariantViolation(format!(
                    "withdrawal index gap at position {position} (found {})",
                    request.index
                )));
            }
        }
        let pending = self
            .requests
            .iter()
            .filter(|request| request.status == WithdrawalStatus::Pending)
            .count();
        if pending != self.pending {
            return Err(VaultError::InvariantViolation(format!(
                "pending counter {} != pending entries {pending}",
                self.pending
            )));
        }
        if pending > self.policy.max_pending {
            return Err(VaultError::InvariantViolation(format!(
                "pending entries {pending} exceed capacity {}",
                self.policy.max_pending
            )));
        }
        Ok(())
    }

    fn settle(
        &mut self,
        index: u64,
        status: WithdrawalStatus,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalRequest, VaultError> {
        let position = usize::try_from(index).map_err(|_| VaultError::IndexOutOfRange {
            index,
            len: self.len(),
        })?;
        let len = self.len();
        let request = self
            .requests
            .get_mut(position)
            .ok_or(VaultError::IndexOutOfRange { index, len })?;
        request.status = status;
        request.settled_at = Some(now);
        self.pending = self.pending.saturating_sub(1);
        Ok(request.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy() -> QueuePolicy {
        QueuePolicy {
            cooldown_secs: 3_600,
            max_withdrawal_minor: 1_000,
            max_pending: 2,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_736_100_000, 0).unwrap()
    }

    fn alice() -> AccountId {
        AccountId::from("alice")
    }

    #[test]
    fn indices_are_sequential_and_tracked_per_owner() {
        let mut queue = WithdrawalQueue::new(policy());
        assert_eq!(queue.enqueue(&alice(), 10, t0()).unwrap(), 0);
        assert_eq!(queue.enqueue(&AccountId::from("bob"), 10, t0()).unwrap(), 1);
        assert_eq!(queue.indices_of(&alice()), &[0]);
        assert_eq!(queue.pending_count(), 2);
        queue.verify().unwrap();
    }

    #[test]
    fn admission_enforces_ceiling_and_capacity() {
        let mut queue = WithdrawalQueue::new(policy());
        assert!(matches!(
            queue.enqueue(&alice(), 0, t0()),
            Err(VaultError::ZeroAmount)
        ));
        assert!(matches!(
            queue.enqueue(&alice(), 1_001, t0()),
            Err(VaultError::AmountOverCeiling { .. })
        ));
        queue.enqueue(&alice(), 1, t0()).unwrap();
        queue.enqueue(&alice(), 1, t0()).unwrap();
        assert!(matches!(
            queue.enqueue(&alice(), 1, t0()),
            Err(VaultError::QueueFull { capacity: 2 })
        ));
    }

    #[test]
    fn cancelled_slot_frees_capacity_but_keeps_index() {
        let mut queue = WithdrawalQueue::new(policy());
        queue.enqueue(&alice(), 1, t0()).unwrap();
        queue.enqueue(&alice(), 1, t0()).unwrap();
        queue.mark_cancelled(0, &alice(), t0()).unwrap();

        assert_eq!(queue.enqueue(&alice(), 1, t0()).unwrap(), 2);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.get(0).unwrap().status, WithdrawalStatus::Cancelled);
        queue.verify().unwrap();
    }

    #[test]
    fn processing_respects_cooldown() {
        let mut queue = WithdrawalQueue::new(policy());
        queue.enqueue(&alice(), 5, t0()).unwrap();

        let early = t0() + Duration::seconds(3_599);
        assert!(!queue.is_ready(0, early));
        assert!(matches!(
            queue.mark_processed(0, early),
            Err(VaultError::CooldownActive { index: 0, .. })
        ));

        let ready = t0() + Duration::seconds(3_600);
        assert!(queue.is_ready(0, ready));
        let processed = queue.mark_processed(0, ready).unwrap();
        assert_eq!(processed.status, WithdrawalStatus::Processed);
        assert_eq!(processed.settled_at, Some(ready));
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn oversized_cooldown_reports_overflow() {
        let mut queue = WithdrawalQueue::new(policy());
        queue.enqueue(&alice(), 5, t0()).unwrap();
        queue.policy.cooldown_secs = i64::MAX;

        assert!(matches!(
            queue.ready_at(0),
            Err(VaultError::Overflow("withdrawal cooldown"))
        ));
        assert!(!queue.is_ready(0, t0()));
        assert!(matches!(
            queue.mark_processed(0, t0()),
            Err(VaultError::Overflow(_))
        ));
        assert!(matches!(
            queue.enqueue(&alice(), 5, t0()),
            Err(VaultError::Overflow(_))
        ));

        queue.policy.cooldown_secs = i64::MAX / 1_000;
        assert!(matches!(
            queue.ready_at(0),
            Err(VaultError::Overflow("withdrawal ready time"))
        ));
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn terminal_requests_reject_further_transitions() {
        let mut queue = WithdrawalQueue::new(policy());
        queue.enqueue(&alice(), 5, t0()).unwrap();
        let later = t0() + Duration::hours(2);
        queue.mark_processed(0, later).unwrap();

        assert!(matches!(
            queue.mark_processed(0, later),
            Err(VaultError::RequestFinalized { index: 0, .. })
        ));
        assert!(matches!(
            queue.mark_cancelled(0, &alice(), later),
            Err(VaultError::RequestFinalized { .. })
        ));
        assert!(!queue.is_ready(0, later));
    }

    #[test]
    fn only_owner_may_cancel() {
        let mut queue = WithdrawalQueue::new(policy());
        queue.enqueue(&alice(), 5, t0()).unwrap();
        assert!(matches!(
            queue.mark_cancelled(0, &AccountId::from("mallory"), t0()),
            Err(VaultError::NotRequestOwner { index: 0, .. })
        ));
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn unknown_index_is_out_of_range() {
        let queue = WithdrawalQueue::new(policy());
        assert!(matches!(
            queue.get(9),
            Err(VaultError::IndexOutOfRange { index: 9, len: 0 })
        ));
        assert!(!queue.is_ready(9, t0()));
    }
}
