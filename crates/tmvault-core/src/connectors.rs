use crate::error::VaultError;
use crate::types::{checked_add, AccountId, AdapterId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Fungible asset held in custody by the pool.
///
/// Mutating calls report an explicit success flag. Callers must treat `Ok(false)`
/// as a hard failure; see [`require_success`].
#[async_trait]
pub trait CustodyAsset: Send + Sync {
    fn symbol(&self) -> &str;

    async fn balance_of(&self, holder: &AccountId) -> Result<u64, VaultError>;

    async fn transfer(
        &self,
        from: &AccountId,
        to: &AccountId,
        amount_minor: u64,
    ) -> Result<bool, VaultError>;

    async fn transfer_from(
        &self,
        spender: &AccountId,
        from: &AccountId,
        to: &AccountId,
        amount_minor: u64,
    ) -> Result<bool, VaultError>;

    async fn approve(
        &self,
        owner: &AccountId,
        spender: &AccountId,
        amount_minor: u64,
    ) -> Result<bool, VaultError>;

    async fn allowance(&self, owner: &AccountId, spender: &AccountId) -> Result<u64, VaultError>;
}

/// Pluggable yield-generating backend.
///
/// Funds live under the adapter's `custody_account`. `deposit` pulls an amount the
/// vault has approved; `withdraw` pushes funds back to the vault's custody account.
#[async_trait]
pub trait YieldAdapter: Send + Sync {
    fn id(&self) -> AdapterId;

    fn custody_account(&self) -> AccountId;

    async fn deposit(&self, amount_minor: u64) -> Result<(), VaultError>;

    async fn withdraw(&self, amount_minor: u64) -> Result<(), VaultError>;

    /// Externally reported balance, including any yield accrued so far.
    async fn balance(&self) -> Result<u64, VaultError>;

    async fn accrued_yield(&self) -> Result<u64, VaultError> {
        Ok(0)
    }
}

/// Turn a `false` success flag into a resource error.
pub fn require_success(accepted: bool, context: impl Into<String>) -> Result<(), VaultError> {
    if accepted {
        Ok(())
    } else {
        Err(VaultError::TransferRejected(context.into()))
    }
}

#[derive(Debug, Default)]
struct AssetBook {
    balances: HashMap<AccountId, u64>,
    allowances: HashMap<(AccountId, AccountId), u64>,
    supply: u64,
}

impl AssetBook {
    fn balance(&self, holder: &AccountId) -> u64 {
        self.balances.get(holder).copied().unwrap_or(0)
    }

    fn move_funds(&mut self, from: &AccountId, to: &AccountId, amount: u64) -> bool {
        let available = self.balance(from);
        if available < amount {
            return false;
        }
        if from == to {
            return true;
        }
        let Some(credited) = self.balance(to).checked_add(amount) else {
            return false;
        };
        self.balances.insert(from.clone(), available - amount);
        self.balances.insert(to.clone(), credited);
        true
    }
}

/// Process-local asset with ERC-20 style balances and allowances.
///
/// Transfers that would overdraw a holder or exceed an allowance return
/// `Ok(false)` rather than an error, like a token that reports failure.
#[derive(Debug)]
pub struct InMemoryAsset {
    symbol: String,
    book: Mutex<AssetBook>,
}

impl InMemoryAsset {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            book: Mutex::new(AssetBook::default()),
        }
    }

    pub fn mint(&self, to: &AccountId, amount_minor: u64) -> Result<(), VaultError> {
        let mut book = self.lock()?;
        let balance = checked_add(book.balance(to), amount_minor, "asset balance")?;
        let supply = checked_add(book.supply, amount_minor, "asset supply")?;
        book.balances.insert(to.clone(), balance);
        book.supply = supply;
        Ok(())
    }

    pub fn total_supply(&self) -> Result<u64, VaultError> {
        Ok(self.lock()?.supply)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, AssetBook>, VaultError> {
        self.book
            .lock()
            .map_err(|_| VaultError::Custody("asset book lock poisoned".to_string()))
    }
}

#[async_trait]
impl CustodyAsset for InMemoryAsset {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    async fn balance_of(&self, holder: &AccountId) -> Result<u64, VaultError> {
        Ok(self.lock()?.balance(holder))
    }

    async fn transfer(
        &self,
        from: &AccountId,
        to: &AccountId,
        amount_minor: u64,
    ) -> Result<bool, VaultError> {
        Ok(self.lock()?.move_funds(from, to, amount_minor))
    }

    async fn transfer_from(
        &self,
        spender: &AccountId,
        from: &AccountId,
        to: &AccountId,
        amount_minor: u64,
    ) -> Result<bool, VaultError> {
        let mut book = self.lock()?;
        let key = (from.clone(), spender.clone());
        let allowed = book.allowances.get(&key).copied().unwrap_or(0);
        if allowed < amount_minor {
            return Ok(false);
        }
        if !book.move_funds(from, to, amount_minor) {
            return Ok(false);
        }
        book.allowances.insert(key, allowed - amount_minor);
        Ok(true)
    }

    async fn approve(
        &self,
        owner: &AccountId,
        spender: &AccountId,
        amount_minor: u64,
    ) -> Result<bool, VaultError> {
        self.lock()?
            .allowances
            .insert((owner.clone(), spender.clone()), amount_minor);
        Ok(true)
    }

    async fn allowance(&self, owner: &AccountId, spender: &AccountId) -> Result<u64, VaultError> {
        Ok(self
            .lock()?
            .allowances
            .get(&(owner.clone(), spender.clone()))
            .copied()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acct(id: &str) -> AccountId {
        AccountId::from(id)
    }

    #[tokio::test]
    async fn transfer_reports_overdraw_as_false() {
        let asset = InMemoryAsset::new("USDC");
        asset.mint(&acct("alice"), 100).unwrap();

        assert!(asset.transfer(&acct("alice"), &acct("bob"), 60).await.unwrap());
        assert!(!asset.transfer(&acct("alice"), &acct("bob"), 41).await.unwrap());
        assert_eq!(asset.balance_of(&acct("alice")).await.unwrap(), 40);
        assert_eq!(asset.balance_of(&acct("bob")).await.unwrap(), 60);
        assert_eq!(asset.total_supply().unwrap(), 100);
    }

    #[tokio::test]
    async fn transfer_from_consumes_allowance() {
        let asset = InMemoryAsset::new("USDC");
        asset.mint(&acct("alice"), 100).unwrap();
        asset.approve(&acct("alice"), &acct("vault"), 70).await.unwrap();

        assert!(!asset
            .transfer_from(&acct("vault"), &acct("alice"), &acct("vault"), 80)
            .await
            .unwrap());
        assert!(asset
            .transfer_from(&acct("vault"), &acct("alice"), &acct("vault"), 50)
            .await
            .unwrap());
        assert_eq!(
            asset.allowance(&acct("alice"), &acct("vault")).await.unwrap(),
            20
        );
    }

    #[test]
    fn rejected_transfer_is_a_resource_error() {
        let err = require_success(false, "payout").unwrap_err();
        assert!(matches!(err, VaultError::TransferRejected(_)));
        assert!(require_success(true, "payout").is_ok());
    }
}
