use crate::connectors::YieldAdapter;
use crate::error::VaultError;
use crate::ledger::Ledger;
use crate::types::{checked_add, AdapterId, AdapterPosition};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// One deallocation planned by the cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeStep {
    pub adapter: AdapterId,
    pub amount_minor: u64,
}

/// Adapter registry and per-adapter allocation bookkeeping.
///
/// Registration order is the cascade priority: first registered, first drained.
/// The router never calls adapters itself; the engine sequences external calls
/// after the bookkeeping here has been staged.
#[derive(Clone, Default)]
pub struct AllocationRouter {
    order: Vec<AdapterId>,
    adapters: HashMap<AdapterId, Arc<dyn YieldAdapter>>,
    allocations: HashMap<AdapterId, u64>,
    credited_excess: HashMap<AdapterId, u64>,
}

impl fmt::Debug for AllocationRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationRouter")
            .field("order", &self.order)
            .field("allocations", &self.allocations)
            .field("credited_excess", &self.credited_excess)
            .finish()
    }
}

impl AllocationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> &[AdapterId] {
        &self.order
    }

    pub fn contains(&self, id: &AdapterId) -> bool {
        self.adapters.contains_key(id)
    }

    pub fn adapter(&self, id: &AdapterId) -> Result<Arc<dyn YieldAdapter>, VaultError> {
        self.adapters
            .get(id)
            .cloned()
            .ok_or_else(|| VaultError::AdapterNotRegistered(id.clone()))
    }

    pub fn allocation_of(&self, id: &AdapterId) -> u64 {
        self.allocations.get(id).copied().unwrap_or(0)
    }

    pub fn positions(&self) -> Vec<AdapterPosition> {
        self.order
            .iter()
            .enumerate()
            .map(|(priority, id)| AdapterPosition {
                adapter: id.clone(),
                priority,
                allocated_minor: self.allocation_of(id),
                credited_yield_minor: self.credited_excess.get(id).copied().unwrap_or(0),
            })
            .collect()
    }

    pub(crate) fn register(&mut self, adapter: Arc<dyn YieldAdapter>) -> Result<(), VaultError> {
        let id = adapter.id();
        if self.contains(&id) {
            return Err(VaultError::AdapterAlreadyRegistered(id));
        }
        self.order.push(id.clone());
        self.allocations.insert(id.clone(), 0);
        self.adapters.insert(id, adapter);
        Ok(())
    }

    /// Drop an adapter from the registry. Callers must drain it first.
    ///
    /// The credited-excess watermark survives so that re-registering the same
    /// id cannot credit yield still sitting in its custody a second time.
    pub(crate) fn unregister(&mut self, id: &AdapterId) -> Result<Arc<dyn YieldAdapter>, VaultError> {
        let allocated = self.allocation_of(id);
        if allocated != 0 {
            return Err(VaultError::InvariantViolation(format!(
                "adapter '{id}' still tracks {allocated} at removal"
            )));
        }
        let adapter = self
            .adapters
            .remove(id)
            .ok_or_else(|| VaultError::AdapterNotRegistered(id.clone()))?;
        self.order.retain(|registered| registered != id);
        self.allocations.remove(id);
        Ok(adapter)
    }

    pub(crate) fn record_allocation(
        &mut self,
        id: &AdapterId,
        amount: u64,
        ledger: &mut Ledger,
    ) -> Result<(), VaultError> {
        if !self.contains(id) {
            return Err(VaultError::AdapterNotRegistered(id.clone()));
        }
        let tracked = checked_add(self.allocation_of(id), amount, "adapter allocation")?;
        ledger.record_allocation(amount)?;
        self.allocations.insert(id.clone(), tracked);
        Ok(())
    }

    pub(crate) fn record_deallocation(
        &mut self,
        id: &AdapterId,
        amount: u64,
        ledger: &mut Ledger,
    ) -> Result<(), VaultError> {
        if !self.contains(id) {
            return Err(VaultError::AdapterNotRegistered(id.clone()));
        }
        let allocated = self.allocation_of(id);
        if allocated < amount {
            return Err(VaultError::InsufficientAllocation {
                adapter: id.clone(),
                requested: amount,
                allocated,
            });
        }
        ledger.record_deallocation(amount)?;
        self.allocations.insert(id.clone(), allocated - amount);
        Ok(())
    }

    /// Walk adapters in priority order and take `min(tracked, remaining)` from
    /// each until `needed` is covered or adapters run out. An unmet remainder is
    /// not an error here.
    pub fn plan_cascade(&self, needed: u64) -> Vec<CascadeStep> {
        let mut remaining = needed;
        let mut steps = Vec::new();
        for id in &self.order {
            if remaining == 0 {
                break;
            }
            let take = self.allocation_of(id).min(remaining);
            if take == 0 {
                continue;
            }
            steps.push(CascadeStep {
                adapter: id.clone(),
                amount_minor: take,
            });
            remaining -= take;
        }
        steps
    }

    /// Credit the part of `reported - tracked` that has not been credited yet.
    pub(crate) fn record_reported_balance(
        &mut self,
        id: &AdapterId,
        reported: u64,
        ledger: &mut Ledger,
    ) -> Result<u64, VaultError> {
        if !self.contains(id) {
            return Err(VaultError::AdapterNotRegistered(id.clone()));
        }
        let excess = reported.saturating_sub(self.allocation_of(id));
        let watermark = self.credited_excess.get(id).copied().unwrap_or(0);
        let credit = excess.saturating_sub(watermark);
        if credit > 0 {
            ledger.record_yield(credit)?;
            self.credited_excess.insert(id.clone(), excess);
        }
        Ok(credit)
    }

    /// Check that tracked allocations sum to the ledger's total allocated.
    pub fn verify(&self, ledger: &Ledger) -> Result<(), VaultError> {
        let mut sum: u64 = 0;
        for id in &self.order {
            sum = checked_add(sum, self.allocation_of(id), "allocation sum")?;
        }
        let total = ledger.totals().total_allocated_minor;
        if sum != total {
            return Err(VaultError::InvariantViolation(format!(
                "sum of tracked allocations {sum} != total allocated {total}"
            )));
        }
        if self.order.len() != self.adapters.len() {
            return Err(VaultError::InvariantViolation(
                "adapter order list out of sync with registry".to_string(),
            ));
        }
        Ok(())
    }
}
