#![allow(dead_code)]

use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use tmvault_adapters::{FaultyAdapter, MockYieldAdapter};
use tmvault_core::{AccountId, CustodyAsset, InMemoryAsset, ManualClock, PoolVault, VaultConfig};

pub const COOLDOWN_SECS: i64 = 86_400;

pub fn acct(id: &str) -> AccountId {
    AccountId::from(id)
}

pub fn manager() -> AccountId {
    acct("ops")
}

pub fn vault_account() -> AccountId {
    acct("vault")
}

pub fn config() -> VaultConfig {
    VaultConfig {
        vault_account: vault_account(),
        manager: manager(),
        withdrawal_cooldown_secs: COOLDOWN_SECS,
        ..VaultConfig::default()
    }
}

pub struct Harness {
    pub asset: Arc<InMemoryAsset>,
    pub clock: Arc<ManualClock>,
    pub vault: Arc<PoolVault>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: VaultConfig) -> Self {
        let asset = Arc::new(InMemoryAsset::new("USDC"));
        Self::with_custody(config, asset.clone(), asset)
    }

    /// Build a vault that talks to `custody` while adapters settle on `asset`.
    pub fn with_custody(
        config: VaultConfig,
        asset: Arc<InMemoryAsset>,
        custody: Arc<dyn CustodyAsset>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_736_100_000, 0).unwrap(),
        ));
        let vault = Arc::new(PoolVault::new(config, custody, clock.clone()).unwrap());
        Self {
            asset,
            clock,
            vault,
        }
    }

    /// Mint `amount` to `who`, approve the vault and deposit it.
    pub async fn fund(&self, who: &str, amount: u64) {
        self.asset.mint(&acct(who), amount).unwrap();
        self.asset
            .approve(&acct(who), &vault_account(), amount)
            .await
            .unwrap();
        self.vault
            .deposit(&acct(who), &acct(who), amount)
            .await
            .unwrap();
    }

    pub fn mock(&self, id: &str) -> Arc<MockYieldAdapter> {
        Arc::new(MockYieldAdapter::new(id, self.asset.clone(), vault_account()))
    }

    pub fn faulty(&self, id: &str) -> Arc<FaultyAdapter> {
        Arc::new(FaultyAdapter::new(MockYieldAdapter::new(
            id,
            self.asset.clone(),
            vault_account(),
        )))
    }

    pub async fn liquidity(&self) -> u64 {
        self.asset.balance_of(&vault_account()).await.unwrap()
    }

    pub async fn wallet(&self, who: &str) -> u64 {
        self.asset.balance_of(&acct(who)).await.unwrap()
    }

    pub fn wait_cooldown(&self) {
        self.clock.advance(Duration::seconds(COOLDOWN_SECS));
    }
}
