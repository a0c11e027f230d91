use crate::error::VaultError;
use crate::types::{checked_add, AccountId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Snapshot of the ledger's global aggregates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub total_deposited_minor: u64,
    pub total_allocated_minor: u64,
    pub total_yield_minor: u64,
}

/// Principal balances plus the pool-wide conservation counters.
///
/// Every mutation keeps `sum(balances) == total_deposited`. Debits are checked
/// against the current balance before anything is written, so a failed call
/// leaves the ledger untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    balances: BTreeMap<AccountId, u64>,
    totals: LedgerTotals,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, account: &AccountId) -> u64 {
        self.balances.get(account).copied().unwrap_or(0)
    }

    pub fn totals(&self) -> LedgerTotals {
        self.totals
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&AccountId, u64)> {
        self.balances.iter().map(|(account, balance)| (account, *balance))
    }

    /// Credit a fresh deposit. Principal is 1:1, so the credited amount is the
    /// deposited amount.
    pub fn credit_deposit(&mut self, account: &AccountId, amount: u64) -> Result<u64, VaultError> {
        if amount == 0 {
            return Err(VaultError::ZeroAmount);
        }
        self.credit(account, amount)?;
        Ok(amount)
    }

    /// Debit `amount` from `account` and from total deposited.
    pub(crate) fn reserve(&mut self, account: &AccountId, amount: u64) -> Result<(), VaultError> {
        if amount == 0 {
            return Err(VaultError::ZeroAmount);
        }
        let available = self.balance_of(account);
        if available < amount {
            return Err(VaultError::InsufficientBalance {
                account: account.clone(),
                requested: amount,
                available,
            });
        }
        let total = self
            .totals
            .total_deposited_minor
            .checked_sub(amount)
            .ok_or_else(|| {
                VaultError::InvariantViolation(
                    "total deposited is below an account balance".to_string(),
                )
            })?;

        self.balances.insert(account.clone(), available - amount);
        self.totals.total_deposited_minor = total;
        Ok(())
    }

    /// Return a previous reservation to `account`.
    pub(crate) fn release(&mut self, account: &AccountId, amount: u64) -> Result<(), VaultError> {
        self.credit(account, amount)
    }

    pub(crate) fn record_allocation(&mut self, amount: u64) -> Result<(), VaultError> {
        self.totals.total_allocated_minor =
            checked_add(self.totals.total_allocated_minor, amount, "total allocated")?;
        Ok(())
    }

    pub(crate) fn record_deallocation(&mut self, amount: u64) -> Result<(), VaultError> {
        self.totals.total_allocated_minor = self
            .totals
            .total_allocated_minor
            .checked_sub(amount)
            .ok_or_else(|| {
                VaultError::InvariantViolation(format!(
                    "deallocating {amount} exceeds total allocated {}",
                    self.totals.total_allocated_minor
                ))
            })?;
        Ok(())
    }

    pub(crate) fn record_yield(&mut self, amount: u64) -> Result<(), VaultError> {
        self.totals.total_yield_minor =
            checked_add(self.totals.total_yield_minor, amount, "total yield")?;
        Ok(())
    }

    /// Check `sum(balances) == total_deposited`.
    pub fn verify_conservation(&self) -> Result<(), VaultError> {
        let mut sum: u64 = 0;
        for balance in self.balances.values() {
            sum = checked_add(sum, *balance, "balance sum")?;
        }
        if sum != self.totals.total_deposited_minor {
            return Err(VaultError::InvariantViolation(format!(
                "sum of balances {sum} != total deposited {}",
                self.totals.total_deposited_minor
            )));
        }
        Ok(())
    }

    fn credit(&mut self, account: &AccountId, amount: u64) -> Result<(), VaultError> {
        let balance = checked_add(self.balance_of(account), amount, "account balance")?;
        let total = checked_add(self.totals.total_deposited_minor, amount, "total deposited")?;
        self.balances.insert(account.clone(), balance);
        self.totals.total_deposited_minor = total;
        Ok(())
    }
}
