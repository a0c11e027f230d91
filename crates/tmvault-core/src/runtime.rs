use crate::access::AccessControl;
use crate::clock::Clock;
use crate::connectors::{require_success, CustodyAsset, YieldAdapter};
use crate::error::VaultError;
use crate::journal::{EventJournal, JournalEntry, VaultEvent};
use crate::ledger::Ledger;
use crate::queue::{QueuePolicy, WithdrawalQueue};
use crate::router::AllocationRouter;
use crate::types::{checked_add, AccountId, AdapterId, AdapterPosition, VaultTotals, WithdrawalRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex, RwLock};
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

tokio::task_local! {
    static ACTIVE_OPERATION: &'static str;
}

/// Vault runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Custody account holding the pool's local liquidity.
    pub vault_account: AccountId,
    pub manager: AccountId,
    pub withdrawal_cooldown_secs: i64,
    pub max_withdrawal_minor: u64,
    pub max_pending_withdrawals: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            vault_account: AccountId::from("tmvault"),
            manager: AccountId::from("vault-manager"),
            withdrawal_cooldown_secs: 86_400,
            max_withdrawal_minor: 1_000_000_000,
            max_pending_withdrawals: 100,
        }
    }
}

impl VaultConfig {
    pub fn validate(&self) -> Result<(), VaultError> {
        if self.vault_account.as_str().trim().is_empty() {
            return Err(VaultError::Config("vault_account must not be empty".to_string()));
        }
        if self.manager.as_str().trim().is_empty() {
            return Err(VaultError::Config("manager must not be empty".to_string()));
        }
        if self.vault_account == self.manager {
            return Err(VaultError::Config(
                "manager identity must differ from the vault custody account".to_string(),
            ));
        }
        if self.withdrawal_cooldown_secs < 0 {
            return Err(VaultError::Config(
                "withdrawal_cooldown_secs must not be negative".to_string(),
            ));
        }
        if self.queue_policy().release_time(Utc::now()).is_err() {
            return Err(VaultError::Config(format!(
                "withdrawal_cooldown_secs {} is out of range",
                self.withdrawal_cooldown_secs
            )));
        }
        if self.max_withdrawal_minor == 0 {
            return Err(VaultError::Config(
                "max_withdrawal_minor must be greater than zero".to_string(),
            ));
        }
        if self.max_pending_withdrawals == 0 {
            return Err(VaultError::Config(
                "max_pending_withdrawals must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn queue_policy(&self) -> QueuePolicy {
        QueuePolicy {
            cooldown_secs: self.withdrawal_cooldown_secs,
            max_withdrawal_minor: self.max_withdrawal_minor,
            max_pending: self.max_pending_withdrawals,
        }
    }
}

/// Everything a single operation may mutate. Operations stage changes on a
/// clone and swap it in only once every external call has succeeded.
#[derive(Debug, Clone)]
struct VaultState {
    ledger: Ledger,
    queue: WithdrawalQueue,
    router: AllocationRouter,
    access: AccessControl,
}

/// Outcome of one adapter withdraw issued after bookkeeping was staged.
struct Recall {
    adapter: Arc<dyn YieldAdapter>,
    amount_minor: u64,
    acknowledged: bool,
}

impl Recall {
    fn event(&self, caller: &AccountId) -> VaultEvent {
        VaultEvent::Deallocated {
            caller: caller.clone(),
            adapter: self.adapter.id(),
            amount_minor: self.amount_minor,
            acknowledged: self.acknowledged,
        }
    }
}

/// Pooled custody vault.
///
/// Every public call runs as one serialized unit: state is locked, changes
/// are staged on a copy, external calls are issued, and the copy is committed
/// together with its journal events. A failure before commit leaves the live
/// state exactly as it was.
///
/// Calls made back into the vault from inside an adapter or asset callback on
/// the same task are rejected with [`VaultError::Reentrancy`].
///
/// The guard is task-local and the state lock is held across adapter calls,
/// so a callback that hands a vault call to another task (for example through
/// `tokio::spawn`) and waits on it deadlocks instead of failing.
pub struct PoolVault {
    config: VaultConfig,
    asset: Arc<dyn CustodyAsset>,
    clock: Arc<dyn Clock>,
    state: AsyncMutex<VaultState>,
    journal: RwLock<EventJournal>,
    events: broadcast::Sender<JournalEntry>,
}

impl PoolVault {
    pub fn new(
        config: VaultConfig,
        asset: Arc<dyn CustodyAsset>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, VaultError> {
        config.validate()?;
        let state = VaultState {
            ledger: Ledger::new(),
            queue: WithdrawalQueue::new(config.queue_policy()),
            router: AllocationRouter::new(),
            access: AccessControl::new(config.manager.clone()),
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            asset,
            clock,
            state: AsyncMutex::new(state),
            journal: RwLock::new(EventJournal::new()),
            events,
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn vault_account(&self) -> &AccountId {
        &self.config.vault_account
    }

    pub fn asset(&self) -> Arc<dyn CustodyAsset> {
        self.asset.clone()
    }

    /// Move `amount` from `caller` into custody and credit `receiver`.
    /// The caller must have approved the vault account as spender.
    pub async fn deposit(
        &self,
        caller: &AccountId,
        receiver: &AccountId,
        amount: u64,
    ) -> Result<u64, VaultError> {
        guarded("deposit", async {
            let mut state = self.state.lock().await;
            let mut staged = state.clone();

            let credited = staged.ledger.credit_deposit(receiver, amount)?;

            let vault = &self.config.vault_account;
            let accepted = self
                .asset
                .transfer_from(vault, caller, vault, amount)
                .await?;
            require_success(accepted, format!("deposit pull from '{caller}'"))?;

            self.commit(
                &mut state,
                staged,
                vec![VaultEvent::Deposited {
                    caller: caller.clone(),
                    receiver: receiver.clone(),
                    amount_minor: amount,
                }],
            )
            .await;
            info!(caller = %caller, receiver = %receiver, amount_minor = amount, "deposit committed");
            Ok(credited)
        })
        .await
    }

    /// Pay out directly from local liquidity. Never touches adapters.
    pub async fn instant_withdraw(&self, caller: &AccountId, amount: u64) -> Result<(), VaultError> {
        guarded("instant_withdraw", async {
            let mut state = self.state.lock().await;
            let mut staged = state.clone();

            staged.ledger.reserve(caller, amount)?;
            let liquidity = self.local_liquidity().await?;
            if liquidity < amount {
                return Err(VaultError::InsufficientLiquidity {
                    requested: amount,
                    available: liquidity,
                });
            }

            let accepted = self
                .asset
                .transfer(&self.config.vault_account, caller, amount)
                .await?;
            require_success(accepted, format!("instant payout to '{caller}'"))?;

            self.commit(
                &mut state,
                staged,
                vec![VaultEvent::InstantWithdrawn {
                    owner: caller.clone(),
                    amount_minor: amount,
                }],
            )
            .await;
            info!(caller = %caller, amount_minor = amount, "instant withdrawal committed");
            Ok(())
        })
        .await
    }

    /// Reserve `amount` from the caller's balance and queue it for payout.
    pub async fn request_withdrawal(&self, caller: &AccountId, amount: u64) -> Result<u64, VaultError> {
        guarded("request_withdrawal", async {
            let mut state = self.state.lock().await;
            let mut staged = state.clone();
            let now = self.clock.now();

            staged.queue.check_admission(amount)?;
            staged.ledger.reserve(caller, amount)?;
            let index = staged.queue.enqueue(caller, amount, now)?;

            self.commit(
                &mut state,
                staged,
                vec![VaultEvent::WithdrawalQueued {
                    owner: caller.clone(),
                    amount_minor: amount,
                    index,
                }],
            )
            .await;
            info!(caller = %caller, amount_minor = amount, index, "withdrawal queued");
            Ok(index)
        })
        .await
    }

    /// Settle a queued withdrawal once its cool-down has elapsed.
    ///
    /// Any caller may trigger settlement; funds always go to the request owner.
    /// A shortfall in local liquidity is covered by the deallocation cascade. If
    /// the final payout fails the request stays pending and acknowledged cascade
    /// withdrawals are pushed back to their adapters.
    pub async fn process_withdrawal(
        &self,
        caller: &AccountId,
        index: u64,
    ) -> Result<WithdrawalRequest, VaultError> {
        guarded("process_withdrawal", async {
            let mut state = self.state.lock().await;
            let mut staged = state.clone();
            let now = self.clock.now();

            let request = staged.queue.mark_processed(index, now)?;
            let amount = request.amount_minor;
            let liquidity = self.local_liquidity().await?;
            let shortfall = amount.saturating_sub(liquidity);
            let steps = if shortfall > 0 {
                staged.router.plan_cascade(shortfall)
            } else {
                Vec::new()
            };
            let planned: u64 = steps.iter().map(|step| step.amount_minor).sum();
            let available = liquidity.saturating_add(planned);
            if available < amount {
                return Err(VaultError::InsufficientLiquidity {
                    requested: amount,
                    available,
                });
            }

            let mut pulls = Vec::with_capacity(steps.len());
            for step in &steps {
                let adapter = staged.router.adapter(&step.adapter)?;
                staged
                    .router
                    .record_deallocation(&step.adapter, step.amount_minor, &mut staged.ledger)?;
                pulls.push((adapter, step.amount_minor));
            }

            let mut recalled = Vec::with_capacity(pulls.len());
            for (adapter, amount_minor) in pulls {
                debug!(index, adapter = %adapter.id(), amount_minor, "cascade deallocation");
                let acknowledged = recall(&adapter, amount_minor).await;
                recalled.push(Recall {
                    adapter,
                    amount_minor,
                    acknowledged,
                });
            }

            let payout = match self
                .asset
                .transfer(&self.config.vault_account, &request.owner, amount)
                .await
            {
                Ok(accepted) => require_success(accepted, format!("payout of withdrawal {index}")),
                Err(err) => Err(err),
            };
            if let Err(err) = payout {
                warn!(index, amount_minor = amount, error = %err, "withdrawal payout failed; discarding staged settlement");
                drop(staged);
                self.compensate(&mut state, caller, &recalled).await;
                return Err(err);
            }

            let mut events: Vec<VaultEvent> = recalled.iter().map(|r| r.event(caller)).collect();
            events.push(VaultEvent::WithdrawalProcessed {
                caller: caller.clone(),
                owner: request.owner.clone(),
                amount_minor: amount,
                index,
            });
            self.commit(&mut state, staged, events).await;
            info!(
                caller = %caller,
                owner = %request.owner,
                amount_minor = amount,
                index,
                cascade_steps = recalled.len(),
                "withdrawal processed"
            );
            Ok(request)
        })
        .await
    }

    /// Cancel a pending request and credit the reservation back to its owner.
    pub async fn cancel_withdrawal(
        &self,
        caller: &AccountId,
        index: u64,
    ) -> Result<WithdrawalRequest, VaultError> {
        guarded("cancel_withdrawal", async {
            let mut state = self.state.lock().await;
            let mut staged = state.clone();
            let now = self.clock.now();

            let request = staged.queue.mark_cancelled(index, caller, now)?;
            staged.ledger.release(&request.owner, request.amount_minor)?;

            self.commit(
                &mut state,
                staged,
                vec![VaultEvent::WithdrawalCancelled {
                    owner: request.owner.clone(),
                    amount_minor: request.amount_minor,
                    index,
                }],
            )
            .await;
            info!(caller = %caller, amount_minor = request.amount_minor, index, "withdrawal cancelled");
            Ok(request)
        })
        .await
    }

    pub async fn register_adapter(
        &self,
        caller: &AccountId,
        adapter: Arc<dyn YieldAdapter>,
    ) -> Result<(), VaultError> {
        guarded("register_adapter", async {
            let mut state = self.state.lock().await;
            let mut staged = state.clone();

            staged.access.ensure_manager(caller)?;
            let id = adapter.id();
            staged.router.register(adapter)?;

            self.commit(
                &mut state,
                staged,
                vec![VaultEvent::ProtocolSet {
                    caller: caller.clone(),
                    adapter: id.clone(),
                }],
            )
            .await;
            info!(caller = %caller, adapter = %id, "adapter registered");
            Ok(())
        })
        .await
    }

    /// Register whichever of the two adapters is missing, `primary` first.
    /// Returns the ids actually added.
    pub async fn set_primary_adapters(
        &self,
        caller: &AccountId,
        primary: Arc<dyn YieldAdapter>,
        secondary: Arc<dyn YieldAdapter>,
    ) -> Result<Vec<AdapterId>, VaultError> {
        guarded("set_primary_adapters", async {
            let mut state = self.state.lock().await;
            let mut staged = state.clone();

            staged.access.ensure_manager(caller)?;
            let mut added = Vec::new();
            for adapter in [primary, secondary] {
                let id = adapter.id();
                if staged.router.contains(&id) {
                    continue;
                }
                staged.router.register(adapter)?;
                added.push(id);
            }

            let events = added
                .iter()
                .map(|id| VaultEvent::ProtocolSet {
                    caller: caller.clone(),
                    adapter: id.clone(),
                })
                .collect();
            self.commit(&mut state, staged, events).await;
            info!(caller = %caller, added = added.len(), "primary adapters set");
            Ok(added)
        })
        .await
    }

    /// Route `amount` of local liquidity into an adapter.
    pub async fn allocate(
        &self,
        caller: &AccountId,
        adapter_id: &AdapterId,
        amount: u64,
    ) -> Result<(), VaultError> {
        guarded("allocate", async {
            let mut state = self.state.lock().await;
            let mut staged = state.clone();

            staged.access.ensure_manager(caller)?;
            if amount == 0 {
                return Err(VaultError::ZeroAmount);
            }
            let adapter = staged.router.adapter(adapter_id)?;
            let liquidity = self.local_liquidity().await?;
            if liquidity < amount {
                return Err(VaultError::InsufficientLiquidity {
                    requested: amount,
                    available: liquidity,
                });
            }
            staged
                .router
                .record_allocation(adapter_id, amount, &mut staged.ledger)?;

            self.push_to_adapter(&adapter, amount).await?;

            self.commit(
                &mut state,
                staged,
                vec![VaultEvent::Allocated {
                    caller: caller.clone(),
                    adapter: adapter_id.clone(),
                    amount_minor: amount,
                }],
            )
            .await;
            info!(caller = %caller, adapter = %adapter_id, amount_minor = amount, "allocation committed");
            Ok(())
        })
        .await
    }

    /// Pull `amount` back from an adapter. Bookkeeping moves even when the
    /// adapter fails to acknowledge; the returned flag reports the ack.
    pub async fn deallocate(
        &self,
        caller: &AccountId,
        adapter_id: &AdapterId,
        amount: u64,
    ) -> Result<bool, VaultError> {
        guarded("deallocate", async {
            let mut state = self.state.lock().await;
            let mut staged = state.clone();

            staged.access.ensure_manager(caller)?;
            if amount == 0 {
                return Err(VaultError::ZeroAmount);
            }
            let adapter = staged.router.adapter(adapter_id)?;
            staged
                .router
                .record_deallocation(adapter_id, amount, &mut staged.ledger)?;

            let acknowledged = recall(&adapter, amount).await;
            let pulled = Recall {
                adapter,
                amount_minor: amount,
                acknowledged,
            };

            self.commit(&mut state, staged, vec![pulled.event(caller)]).await;
            info!(caller = %caller, adapter = %adapter_id, amount_minor = amount, acknowledged, "deallocation committed");
            Ok(acknowledged)
        })
        .await
    }

    /// Credit newly reported adapter excess into the shared yield pool.
    ///
    /// Every id must be registered before any adapter is queried. Adapters
    /// whose balance query fails are skipped for this round.
    pub async fn collect_yield(
        &self,
        caller: &AccountId,
        adapter_ids: &[AdapterId],
    ) -> Result<u64, VaultError> {
        guarded("collect_yield", async {
            let mut state = self.state.lock().await;
            let mut staged = state.clone();

            staged.access.ensure_manager(caller)?;
            let mut adapters = Vec::with_capacity(adapter_ids.len());
            for id in adapter_ids {
                adapters.push(staged.router.adapter(id)?);
            }

            let mut credited_total: u64 = 0;
            let mut events = Vec::new();
            for adapter in adapters {
                let id = adapter.id();
                let reported = match adapter.balance().await {
                    Ok(reported) => reported,
                    Err(err) => {
                        warn!(adapter = %id, error = %err, "adapter balance query failed; skipped this round");
                        continue;
                    }
                };
                let credit = staged
                    .router
                    .record_reported_balance(&id, reported, &mut staged.ledger)?;
                if credit == 0 {
                    continue;
                }
                credited_total = checked_add(credited_total, credit, "collected yield")?;
                events.push(VaultEvent::YieldCollected {
                    caller: caller.clone(),
                    adapter: id,
                    amount_minor: credit,
                });
            }

            self.commit(&mut state, staged, events).await;
            info!(caller = %caller, amount_minor = credited_total, "yield collected");
            Ok(credited_total)
        })
        .await
    }

    /// Force full deallocation of an adapter, then drop it from the registry.
    /// Returns the amount that was still tracked.
    pub async fn remove_adapter(&self, caller: &AccountId, adapter_id: &AdapterId) -> Result<u64, VaultError> {
        guarded("remove_adapter", async {
            let mut state = self.state.lock().await;
            let mut staged = state.clone();

            staged.access.ensure_manager(caller)?;
            let adapter = staged.router.adapter(adapter_id)?;
            let tracked = staged.router.allocation_of(adapter_id);
            if tracked > 0 {
                staged
                    .router
                    .record_deallocation(adapter_id, tracked, &mut staged.ledger)?;
            }
            staged.router.unregister(adapter_id)?;

            let mut events = Vec::new();
            if tracked > 0 {
                let acknowledged = recall(&adapter, tracked).await;
                let pulled = Recall {
                    adapter,
                    amount_minor: tracked,
                    acknowledged,
                };
                events.push(pulled.event(caller));
            }
            events.push(VaultEvent::AdapterRemoved {
                caller: caller.clone(),
                adapter: adapter_id.clone(),
            });

            self.commit(&mut state, staged, events).await;
            info!(caller = %caller, adapter = %adapter_id, amount_minor = tracked, "adapter removed");
            Ok(tracked)
        })
        .await
    }

    /// Deallocate every tracked unit from every adapter.
    pub async fn emergency_recall_all(&self, caller: &AccountId) -> Result<u64, VaultError> {
        guarded("emergency_recall_all", async {
            let mut state = self.state.lock().await;
            let mut staged = state.clone();

            staged.access.ensure_manager(caller)?;
            let mut pulls = Vec::new();
            let mut recalled_total: u64 = 0;
            for id in staged.router.ids().to_vec() {
                let tracked = staged.router.allocation_of(&id);
                if tracked == 0 {
                    continue;
                }
                let adapter = staged.router.adapter(&id)?;
                staged
                    .router
                    .record_deallocation(&id, tracked, &mut staged.ledger)?;
                recalled_total = checked_add(recalled_total, tracked, "recalled total")?;
                pulls.push((adapter, tracked));
            }

            let mut events = Vec::with_capacity(pulls.len() + 1);
            for (adapter, amount_minor) in pulls {
                let acknowledged = recall(&adapter, amount_minor).await;
                let pulled = Recall {
                    adapter,
                    amount_minor,
                    acknowledged,
                };
                events.push(pulled.event(caller));
            }
            events.push(VaultEvent::EmergencyRecall {
                caller: caller.clone(),
                amount_minor: recalled_total,
            });

            self.commit(&mut state, staged, events).await;
            warn!(caller = %caller, amount_minor = recalled_total, "emergency recall committed");
            Ok(recalled_total)
        })
        .await
    }

    /// Single-step manager handoff.
    pub async fn transfer_manager(&self, caller: &AccountId, next: AccountId) -> Result<(), VaultError> {
        guarded("transfer_manager", async {
            let mut state = self.state.lock().await;
            let mut staged = state.clone();

            if next.as_str().trim().is_empty() {
                return Err(VaultError::Config("new manager must not be empty".to_string()));
            }
            let previous = staged.access.transfer(caller, next.clone())?;

            self.commit(
                &mut state,
                staged,
                vec![VaultEvent::ManagerTransferred {
                    previous: previous.clone(),
                    next: next.clone(),
                }],
            )
            .await;
            info!(previous = %previous, next = %next, "manager transferred");
            Ok(())
        })
        .await
    }

    pub async fn balance_of(&self, account: &AccountId) -> Result<u64, VaultError> {
        self.read("balance_of", |state| Ok(state.ledger.balance_of(account)))
            .await
    }

    pub async fn withdrawal_request(&self, index: u64) -> Result<WithdrawalRequest, VaultError> {
        self.read("withdrawal_request", |state| state.queue.get(index).cloned())
            .await
    }

    pub async fn withdrawals_of(&self, owner: &AccountId) -> Result<Vec<WithdrawalRequest>, VaultError> {
        self.read("withdrawals_of", |state| {
            state
                .queue
                .indices_of(owner)
                .iter()
                .map(|index| state.queue.get(*index).cloned())
                .collect()
        })
        .await
    }

    pub async fn adapters(&self) -> Result<Vec<AdapterId>, VaultError> {
        self.read("adapters", |state| Ok(state.router.ids().to_vec()))
            .await
    }

    pub async fn adapter_positions(&self) -> Result<Vec<AdapterPosition>, VaultError> {
        self.read("adapter_positions", |state| Ok(state.router.positions()))
            .await
    }

    pub async fn allocation_of(&self, adapter_id: &AdapterId) -> Result<u64, VaultError> {
        self.read("allocation_of", |state| {
            if !state.router.contains(adapter_id) {
                return Err(VaultError::AdapterNotRegistered(adapter_id.clone()));
            }
            Ok(state.router.allocation_of(adapter_id))
        })
        .await
    }

    /// Pending requests only.
    pub async fn queue_size(&self) -> Result<usize, VaultError> {
        self.read("queue_size", |state| Ok(state.queue.pending_count()))
            .await
    }

    /// False for unknown indices as well as terminal or cooling requests.
    pub async fn is_withdrawal_ready(&self, index: u64) -> Result<bool, VaultError> {
        let now = self.clock.now();
        self.read("is_withdrawal_ready", |state| Ok(state.queue.is_ready(index, now)))
            .await
    }

    /// Earliest time the request at `index` may be processed.
    pub async fn withdrawal_ready_at(&self, index: u64) -> Result<DateTime<Utc>, VaultError> {
        self.read("withdrawal_ready_at", |state| state.queue.ready_at(index))
            .await
    }

    pub async fn manager(&self) -> Result<AccountId, VaultError> {
        self.read("manager", |state| Ok(state.access.manager().clone()))
            .await
    }

    /// Local liquidity + total allocated + total yield. Informational only.
    pub async fn total_assets(&self) -> Result<u64, VaultError> {
        Ok(self.totals().await?.total_assets_minor)
    }

    pub async fn totals(&self) -> Result<VaultTotals, VaultError> {
        guarded("totals", async {
            let state = self.state.lock().await;
            let liquidity = self.local_liquidity().await?;
            let ledger = state.ledger.totals();
            let total_assets = checked_add(
                checked_add(liquidity, ledger.total_allocated_minor, "total assets")?,
                ledger.total_yield_minor,
                "total assets",
            )?;
            Ok(VaultTotals {
                total_deposited_minor: ledger.total_deposited_minor,
                total_allocated_minor: ledger.total_allocated_minor,
                total_yield_minor: ledger.total_yield_minor,
                local_liquidity_minor: liquidity,
                total_assets_minor: total_assets,
                pending_withdrawals: state.queue.pending_count(),
            })
        })
        .await
    }

    pub async fn journal_entries(&self, since: u64, limit: usize) -> Vec<JournalEntry> {
        self.journal.read().await.since(since, limit)
    }

    pub async fn verify_journal(&self) -> bool {
        self.journal.read().await.verify_chain()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JournalEntry> {
        self.events.subscribe()
    }

    /// Check the conservation and bookkeeping invariants on the live state.
    pub async fn verify_invariants(&self) -> Result<(), VaultError> {
        self.read("verify_invariants", |state| {
            state.ledger.verify_conservation()?;
            state.router.verify(&state.ledger)?;
            state.queue.verify()
        })
        .await
    }

    async fn read<T>(
        &self,
        operation: &'static str,
        view: impl FnOnce(&VaultState) -> Result<T, VaultError> + Send,
    ) -> Result<T, VaultError>
    where
        T: Send,
    {
        guarded(operation, async {
            let state = self.state.lock().await;
            view(&state)
        })
        .await
    }

    async fn local_liquidity(&self) -> Result<u64, VaultError> {
        self.asset.balance_of(&self.config.vault_account).await
    }

    /// Approve the adapter's custody account and have it pull `amount`.
    async fn push_to_adapter(&self, adapter: &Arc<dyn YieldAdapter>, amount: u64) -> Result<(), VaultError> {
        let vault = &self.config.vault_account;
        let custody = adapter.custody_account();
        let approved = self.asset.approve(vault, &custody, amount).await?;
        require_success(approved, format!("approval for adapter '{}'", adapter.id()))?;

        if let Err(err) = adapter.deposit(amount).await {
            if let Err(reset) = self.asset.approve(vault, &custody, 0).await {
                warn!(adapter = %adapter.id(), error = %reset, "failed to reset adapter approval");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Undo acknowledged cascade withdrawals after a failed payout. Each is
    /// pushed back to its adapter; one that cannot be returned stays in custody
    /// and its deallocation is applied to the committed state.
    async fn compensate(&self, state: &mut VaultState, caller: &AccountId, recalled: &[Recall]) {
        let mut events = Vec::new();
        for pulled in recalled.iter().filter(|pulled| pulled.acknowledged) {
            let id = pulled.adapter.id();
            match self.push_to_adapter(&pulled.adapter, pulled.amount_minor).await {
                Ok(()) => {
                    debug!(adapter = %id, amount_minor = pulled.amount_minor, "returned cascade funds to adapter");
                }
                Err(err) => {
                    warn!(
                        adapter = %id,
                        amount_minor = pulled.amount_minor,
                        error = %err,
                        "could not return cascade funds; keeping them in custody"
                    );
                    match state
                        .router
                        .record_deallocation(&id, pulled.amount_minor, &mut state.ledger)
                    {
                        Ok(()) => events.push(pulled.event(caller)),
                        Err(err) => {
                            error!(adapter = %id, error = %err, "compensating deallocation rejected");
                        }
                    }
                }
            }
        }
        self.record(events).await;
    }

    async fn commit(&self, state: &mut VaultState, staged: VaultState, events: Vec<VaultEvent>) {
        *state = staged;
        self.record(events).await;
    }

    async fn record(&self, events: Vec<VaultEvent>) {
        if events.is_empty() {
            return;
        }
        let recorded_at = self.clock.now();
        let mut journal = self.journal.write().await;
        for event in events {
            let entry = journal.append(event, recorded_at);
            // No subscribers is not an error.
            let _ = self.events.send(entry);
        }
    }
}

async fn recall(adapter: &Arc<dyn YieldAdapter>, amount: u64) -> bool {
    match adapter.withdraw(amount).await {
        Ok(()) => true,
        Err(err) => {
            warn!(
                adapter = %adapter.id(),
                amount_minor = amount,
                error = %err,
                "adapter withdraw failed; bookkeeping already decremented"
            );
            false
        }
    }
}

async fn guarded<T, F>(operation: &'static str, body: F) -> Result<T, VaultError>
where
    F: Future<Output = Result<T, VaultError>>,
{
    if let Ok(active) = ACTIVE_OPERATION.try_with(|active| *active) {
        warn!(operation, active, "rejected reentrant vault call");
        return Err(VaultError::Reentrancy { operation });
    }
    ACTIVE_OPERATION.scope(operation, body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::connectors::InMemoryAsset;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::sync::{Mutex, OnceLock, Weak};

    fn acct(id: &str) -> AccountId {
        AccountId::from(id)
    }

    fn config() -> VaultConfig {
        VaultConfig {
            vault_account: acct("vault"),
            manager: acct("ops"),
            withdrawal_cooldown_secs: 3_600,
            max_withdrawal_minor: 1_000_000,
            max_pending_withdrawals: 4,
        }
    }

    struct Fixture {
        vault: Arc<PoolVault>,
        asset: Arc<InMemoryAsset>,
        clock: Arc<ManualClock>,
    }

    async fn fixture() -> Fixture {
        let asset = Arc::new(InMemoryAsset::new("USDC"));
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_736_100_000, 0).unwrap()));
        let vault = Arc::new(PoolVault::new(config(), asset.clone(), clock.clone()).unwrap());
        Fixture { vault, asset, clock }
    }

    async fn fund(fx: &Fixture, who: &str, amount: u64) {
        fx.asset.mint(&acct(who), amount).unwrap();
        fx.asset.approve(&acct(who), &acct("vault"), amount).await.unwrap();
        fx.vault.deposit(&acct(who), &acct(who), amount).await.unwrap();
    }

    #[test]
    fn default_config_is_valid() {
        VaultConfig::default().validate().unwrap();
        let bad = VaultConfig {
            max_pending_withdrawals: 0,
            ..VaultConfig::default()
        };
        assert!(matches!(bad.validate(), Err(VaultError::Config(_))));
    }

    #[test]
    fn out_of_range_cooldown_is_rejected() {
        for cooldown in [i64::MAX, i64::MAX / 1_000] {
            let config = VaultConfig {
                withdrawal_cooldown_secs: cooldown,
                ..VaultConfig::default()
            };
            assert!(matches!(config.validate(), Err(VaultError::Config(_))));
            let asset = Arc::new(InMemoryAsset::new("USDC"));
            let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_736_100_000, 0).unwrap()));
            assert!(PoolVault::new(config, asset, clock).is_err());
        }
    }

    #[tokio::test]
    async fn deposit_without_allowance_leaves_no_trace() {
        let fx = fixture().await;
        fx.asset.mint(&acct("alice"), 100).unwrap();

        let err = fx
            .vault
            .deposit(&acct("alice"), &acct("alice"), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::TransferRejected(_)));
        assert_eq!(fx.vault.balance_of(&acct("alice")).await.unwrap(), 0);
        assert!(fx.vault.journal_entries(0, 10).await.is_empty());
    }

    #[tokio::test]
    async fn instant_withdraw_pays_from_local_liquidity() {
        let fx = fixture().await;
        fund(&fx, "alice", 1_000).await;

        fx.vault.instant_withdraw(&acct("alice"), 400).await.unwrap();
        assert_eq!(fx.vault.balance_of(&acct("alice")).await.unwrap(), 600);
        assert_eq!(fx.asset.balance_of(&acct("alice")).await.unwrap(), 400);

        let err = fx.vault.instant_withdraw(&acct("alice"), 601).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Resource);
        fx.vault.verify_invariants().await.unwrap();
    }

    #[tokio::test]
    async fn double_processing_is_rejected() {
        let fx = fixture().await;
        fund(&fx, "alice", 1_000).await;
        let index = fx.vault.request_withdrawal(&acct("alice"), 300).await.unwrap();

        fx.clock.advance(Duration::seconds(3_600));
        fx.vault.process_withdrawal(&acct("keeper"), index).await.unwrap();
        let err = fx
            .vault
            .process_withdrawal(&acct("keeper"), index)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::RequestFinalized { .. }));
        assert_eq!(fx.asset.balance_of(&acct("alice")).await.unwrap(), 300);
    }

    #[tokio::test]
    async fn privileged_calls_require_manager() {
        let fx = fixture().await;
        let err = fx.vault.emergency_recall_all(&acct("alice")).await.unwrap_err();
        assert!(matches!(err, VaultError::NotManager { .. }));

        fx.vault.transfer_manager(&acct("ops"), acct("treasury")).await.unwrap();
        assert_eq!(fx.vault.manager().await.unwrap(), acct("treasury"));
        assert!(fx.vault.emergency_recall_all(&acct("ops")).await.is_err());
        assert_eq!(fx.vault.emergency_recall_all(&acct("treasury")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn subscribers_see_committed_events() {
        let fx = fixture().await;
        let mut events = fx.vault.subscribe();
        fund(&fx, "alice", 10).await;

        let entry = events.recv().await.unwrap();
        assert_eq!(entry.index, 0);
        assert_eq!(entry.event.name(), "deposited");
        assert!(fx.vault.verify_journal().await);
    }

    /// Adapter that calls back into the vault from inside `deposit`.
    struct CallbackAdapter {
        vault: OnceLock<Weak<PoolVault>>,
        observed: Mutex<Option<VaultError>>,
    }

    #[async_trait]
    impl YieldAdapter for CallbackAdapter {
        fn id(&self) -> AdapterId {
            AdapterId::from("callback")
        }

        fn custody_account(&self) -> AccountId {
            AccountId::from("callback-custody")
        }

        async fn deposit(&self, _amount_minor: u64) -> Result<(), VaultError> {
            let vault = self
                .vault
                .get()
                .and_then(Weak::upgrade)
                .ok_or_else(|| VaultError::adapter_failure(&self.id(), "vault gone"))?;
            let nested = vault.queue_size().await;
            *self.observed.lock().unwrap() = nested.err();
            Err(VaultError::adapter_failure(&self.id(), "callback rejected"))
        }

        async fn withdraw(&self, _amount_minor: u64) -> Result<(), VaultError> {
            Ok(())
        }

        async fn balance(&self) -> Result<u64, VaultError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn reentrant_callback_is_rejected_and_state_is_untouched() {
        let fx = fixture().await;
        fund(&fx, "alice", 1_000).await;

        let adapter = Arc::new(CallbackAdapter {
            vault: OnceLock::new(),
            observed: Mutex::new(None),
        });
        let _ = adapter.vault.set(Arc::downgrade(&fx.vault));
        fx.vault
            .register_adapter(&acct("ops"), adapter.clone())
            .await
            .unwrap();

        let err = fx
            .vault
            .allocate(&acct("ops"), &AdapterId::from("callback"), 500)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::AdapterFailure { .. }));
        assert!(matches!(
            adapter.observed.lock().unwrap().take(),
            Some(VaultError::Reentrancy {
                operation: "queue_size"
            })
        ));

        assert_eq!(
            fx.vault.allocation_of(&AdapterId::from("callback")).await.unwrap(),
            0
        );
        assert_eq!(
            fx.asset
                .allowance(&acct("vault"), &acct("callback-custody"))
                .await
                .unwrap(),
            0
        );
        fx.vault.verify_invariants().await.unwrap();
    }
}
