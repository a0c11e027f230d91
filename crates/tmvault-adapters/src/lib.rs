//! Reference yield adapters for tmvault.
//!
//! All adapters here settle against an [`InMemoryAsset`], so they are suited to
//! local development, demos and chaos testing rather than real backends.

#![deny(unsafe_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tmvault_core::connectors::{require_success, CustodyAsset, InMemoryAsset, YieldAdapter};
use tmvault_core::error::VaultError;
use tmvault_core::types::{AccountId, AdapterId};
use tracing::debug;

/// Deterministic adapter that parks funds in its own custody account.
///
/// `deposit` pulls an approved amount from the vault, `withdraw` pushes funds
/// straight back to it, and [`MockYieldAdapter::accrue`] mints simulated yield.
#[derive(Debug)]
pub struct MockYieldAdapter {
    id: AdapterId,
    custody: AccountId,
    vault_account: AccountId,
    asset: Arc<InMemoryAsset>,
    principal: AtomicU64,
}

impl MockYieldAdapter {
    pub fn new(id: impl Into<AdapterId>, asset: Arc<InMemoryAsset>, vault_account: AccountId) -> Self {
        let id = id.into();
        let custody = AccountId::new(format!("adapter:{id}"));
        Self {
            id,
            custody,
            vault_account,
            asset,
            principal: AtomicU64::new(0),
        }
    }

    /// Mint `amount` into the adapter's custody account as earned yield.
    pub fn accrue(&self, amount_minor: u64) -> Result<(), VaultError> {
        self.asset.mint(&self.custody, amount_minor)
    }

    fn rejected(&self, action: &str, err: VaultError) -> VaultError {
        VaultError::adapter_failure(&self.id, format!("{action}: {err}"))
    }
}

#[async_trait]
impl YieldAdapter for MockYieldAdapter {
    fn id(&self) -> AdapterId {
        self.id.clone()
    }

    fn custody_account(&self) -> AccountId {
        self.custody.clone()
    }

    async fn deposit(&self, amount_minor: u64) -> Result<(), VaultError> {
        let accepted = self
            .asset
            .transfer_from(&self.custody, &self.vault_account, &self.custody, amount_minor)
            .await?;
        require_success(accepted, "pull from vault").map_err(|err| self.rejected("deposit", err))?;
        self.principal.fetch_add(amount_minor, Ordering::SeqCst);
        debug!(adapter = %self.id, amount_minor, "mock adapter accepted deposit");
        Ok(())
    }

    async fn withdraw(&self, amount_minor: u64) -> Result<(), VaultError> {
        let accepted = self
            .asset
            .transfer(&self.custody, &self.vault_account, amount_minor)
            .await?;
        require_success(accepted, "return to vault").map_err(|err| self.rejected("withdraw", err))?;
        let _ = self
            .principal
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |principal| {
                Some(principal.saturating_sub(amount_minor))
            });
        debug!(adapter = %self.id, amount_minor, "mock adapter returned funds");
        Ok(())
    }

    async fn balance(&self) -> Result<u64, VaultError> {
        self.asset.balance_of(&self.custody).await
    }

    async fn accrued_yield(&self) -> Result<u64, VaultError> {
        let balance = self.balance().await?;
        Ok(balance.saturating_sub(self.principal.load(Ordering::SeqCst)))
    }
}

/// Adapter whose every call fails. Useful for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailAdapter {
    id: AdapterId,
    reason: String,
}

impl AlwaysFailAdapter {
    pub fn new(id: impl Into<AdapterId>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl YieldAdapter for AlwaysFailAdapter {
    fn id(&self) -> AdapterId {
        self.id.clone()
    }

    fn custody_account(&self) -> AccountId {
        AccountId::new(format!("adapter:{}", self.id))
    }

    async fn deposit(&self, _amount_minor: u64) -> Result<(), VaultError> {
        Err(VaultError::adapter_failure(&self.id, self.reason.clone()))
    }

    async fn withdraw(&self, _amount_minor: u64) -> Result<(), VaultError> {
        Err(VaultError::adapter_failure(&self.id, self.reason.clone()))
    }

    async fn balance(&self) -> Result<u64, VaultError> {
        Err(VaultError::adapter_failure(&self.id, self.reason.clone()))
    }
}

/// Wraps a [`MockYieldAdapter`] with switchable faults: refused withdrawals,
/// failing deposits or balance queries, and an under-reported balance.
#[derive(Debug)]
pub struct FaultyAdapter {
    inner: MockYieldAdapter,
    refuse_withdraw: AtomicBool,
    refuse_deposit: AtomicBool,
    fail_balance: AtomicBool,
    balance_haircut: AtomicU64,
}

impl FaultyAdapter {
    pub fn new(inner: MockYieldAdapter) -> Self {
        Self {
            inner,
            refuse_withdraw: AtomicBool::new(false),
            refuse_deposit: AtomicBool::new(false),
            fail_balance: AtomicBool::new(false),
            balance_haircut: AtomicU64::new(0),
        }
    }

    pub fn refuse_withdraw(&self, refuse: bool) {
        self.refuse_withdraw.store(refuse, Ordering::SeqCst);
    }

    pub fn refuse_deposit(&self, refuse: bool) {
        self.refuse_deposit.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_balance(&self, fail: bool) {
        self.fail_balance.store(fail, Ordering::SeqCst);
    }

    /// Report `haircut` less than the adapter actually holds.
    pub fn under_report(&self, haircut: u64) {
        self.balance_haircut.store(haircut, Ordering::SeqCst);
    }

    pub fn accrue(&self, amount_minor: u64) -> Result<(), VaultError> {
        self.inner.accrue(amount_minor)
    }
}

#[async_trait]
impl YieldAdapter for FaultyAdapter {
    fn id(&self) -> AdapterId {
        self.inner.id()
    }

    fn custody_account(&self) -> AccountId {
        self.inner.custody_account()
    }

    async fn deposit(&self, amount_minor: u64) -> Result<(), VaultError> {
        if self.refuse_deposit.load(Ordering::SeqCst) {
            return Err(VaultError::adapter_failure(&self.id(), "deposit refused"));
        }
        self.inner.deposit(amount_minor).await
    }

    async fn withdraw(&self, amount_minor: u64) -> Result<(), VaultError> {
        if self.refuse_withdraw.load(Ordering::SeqCst) {
            return Err(VaultError::adapter_failure(&self.id(), "withdraw refused"));
        }
        self.inner.withdraw(amount_minor).await
    }

    async fn balance(&self) -> Result<u64, VaultError> {
        if self.fail_balance.load(Ordering::SeqCst) {
            return Err(VaultError::adapter_failure(&self.id(), "balance unavailable"));
        }
        let actual = self.inner.balance().await?;
        Ok(actual.saturating_sub(self.balance_haircut.load(Ordering::SeqCst)))
    }

    async fn accrued_yield(&self) -> Result<u64, VaultError> {
        self.inner.accrued_yield().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> AccountId {
        AccountId::from("vault")
    }

    async fn funded_adapter(amount: u64) -> (Arc<InMemoryAsset>, MockYieldAdapter) {
        let asset = Arc::new(InMemoryAsset::new("USDC"));
        asset.mint(&vault(), amount).unwrap();
        let adapter = MockYieldAdapter::new("aave", asset.clone(), vault());
        asset
            .approve(&vault(), &adapter.custody_account(), amount)
            .await
            .unwrap();
        (asset, adapter)
    }

    #[tokio::test]
    async fn mock_adapter_round_trips_funds() {
        let (asset, adapter) = funded_adapter(1_000).await;

        adapter.deposit(600).await.unwrap();
        assert_eq!(adapter.balance().await.unwrap(), 600);
        assert_eq!(asset.balance_of(&vault()).await.unwrap(), 400);

        adapter.withdraw(200).await.unwrap();
        assert_eq!(adapter.balance().await.unwrap(), 400);
        assert_eq!(asset.balance_of(&vault()).await.unwrap(), 600);
    }

    #[tokio::test]
    async fn deposit_without_approval_fails() {
        let asset = Arc::new(InMemoryAsset::new("USDC"));
        asset.mint(&vault(), 100).unwrap();
        let adapter = MockYieldAdapter::new("aave", asset, vault());

        let err = adapter.deposit(50).await.unwrap_err();
        assert!(matches!(err, VaultError::AdapterFailure { .. }));
    }

    #[tokio::test]
    async fn accrued_yield_excludes_principal() {
        let (_asset, adapter) = funded_adapter(500).await;
        adapter.deposit(500).await.unwrap();
        adapter.accrue(25).unwrap();

        assert_eq!(adapter.balance().await.unwrap(), 525);
        assert_eq!(adapter.accrued_yield().await.unwrap(), 25);
    }

    #[tokio::test]
    async fn faulty_adapter_applies_switches() {
        let (_asset, inner) = funded_adapter(100).await;
        let adapter = FaultyAdapter::new(inner);
        adapter.deposit(100).await.unwrap();

        adapter.under_report(30);
        assert_eq!(adapter.balance().await.unwrap(), 70);

        adapter.refuse_withdraw(true);
        assert!(adapter.withdraw(10).await.is_err());
        adapter.refuse_withdraw(false);
        adapter.withdraw(10).await.unwrap();

        adapter.fail_balance(true);
        assert!(adapter.balance().await.is_err());
    }

    #[tokio::test]
    async fn always_fail_adapter_fails_everything() {
        let adapter = AlwaysFailAdapter::new("broken", "backend offline");
        assert!(adapter.deposit(1).await.is_err());
        assert!(adapter.withdraw(1).await.is_err());
        let err = adapter.balance().await.unwrap_err();
        assert_eq!(err.to_string(), "adapter 'broken' failed: backend offline");
    }
}
