#![deny(unsafe_code)]

pub mod journal_store;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use journal_store::{JournalMirror, JournalStorageConfig, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tmvault_adapters::MockYieldAdapter;
use tmvault_core::{
    AccountId, AdapterId, AdapterPosition, CustodyAsset, ErrorKind, InMemoryAsset, JournalEntry,
    PoolVault, SystemClock, VaultConfig, VaultError, VaultTotals, WithdrawalRequest,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Reference adapters registered as the primary pair at bootstrap.
pub const PRIMARY_ADAPTERS: [&str; 2] = ["aave", "compound"];

const DEMO_DEPOSITOR: &str = "demo-depositor";
const DEMO_DEPOSIT_MINOR: u64 = 100_000;

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub vault: VaultConfig,
    pub journal_storage: JournalStorageConfig,
    /// Fund a demo depositor at startup.
    pub seed_demo: bool,
}

#[derive(Clone)]
pub struct ServiceState {
    pub vault: Arc<PoolVault>,
    pub asset: Arc<InMemoryAsset>,
    pub mirror: Arc<Mutex<JournalMirror>>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig {
            vault: vault_config,
            journal_storage,
            seed_demo,
        } = config;

        let asset = Arc::new(InMemoryAsset::new("USDC"));
        let manager = vault_config.manager.clone();
        let vault_account = vault_config.vault_account.clone();
        let vault = Arc::new(PoolVault::new(
            vault_config,
            asset.clone(),
            Arc::new(SystemClock),
        )?);

        let [primary, secondary] = PRIMARY_ADAPTERS.map(|id| {
            Arc::new(MockYieldAdapter::new(id, asset.clone(), vault_account.clone()))
        });
        vault
            .set_primary_adapters(&manager, primary, secondary)
            .await?;

        let mirror = JournalMirror::bootstrap(journal_storage).await?;
        let state = Self {
            vault,
            asset,
            mirror: Arc::new(Mutex::new(mirror)),
        };

        if seed_demo {
            let depositor = AccountId::from(DEMO_DEPOSITOR);
            state.faucet(&depositor, DEMO_DEPOSIT_MINOR).await?;
            state
                .vault
                .deposit(&depositor, &depositor, DEMO_DEPOSIT_MINOR)
                .await?;
            info!(account = DEMO_DEPOSITOR, amount_minor = DEMO_DEPOSIT_MINOR, "seeded demo deposit");
        }
        state.mirror_journal().await;

        Ok(state)
    }

    /// Mint development funds to `account` and approve the vault to pull them.
    pub async fn faucet(&self, account: &AccountId, amount_minor: u64) -> Result<u64, VaultError> {
        if amount_minor == 0 {
            return Err(VaultError::ZeroAmount);
        }
        self.asset.mint(account, amount_minor)?;
        let vault_account = self.vault.vault_account();
        let allowance = self.asset.allowance(account, vault_account).await?;
        let raised = allowance.saturating_add(amount_minor);
        self.asset.approve(account, vault_account, raised).await?;
        self.asset.balance_of(account).await
    }

    /// Copy new journal entries to the mirror. Failures are retried on the
    /// next call.
    pub async fn mirror_journal(&self) {
        let mut mirror = self.mirror.lock().await;
        if let Err(err) = mirror.sync(&self.vault).await {
            warn!(error = %err, cursor = mirror.cursor(), "journal mirror sync failed");
        }
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/totals", get(totals))
        .route("/v1/accounts/:account", get(account_summary))
        .route("/v1/accounts/:account/withdrawals", get(account_withdrawals))
        .route("/v1/deposits", post(deposit))
        .route("/v1/withdrawals", post(request_withdrawal))
        .route("/v1/withdrawals/instant", post(instant_withdraw))
        .route("/v1/withdrawals/:index", get(withdrawal_detail))
        .route("/v1/withdrawals/:index/process", post(process_withdrawal))
        .route("/v1/withdrawals/:index/cancel", post(cancel_withdrawal))
        .route("/v1/queue/size", get(queue_size))
        .route("/v1/adapters", get(list_adapters))
        .route("/v1/adapters/:adapter/allocate", post(allocate))
        .route("/v1/adapters/:adapter/deallocate", post(deallocate))
        .route("/v1/adapters/:adapter/remove", post(remove_adapter))
        .route("/v1/yield/collect", post(collect_yield))
        .route("/v1/emergency/recall", post(emergency_recall))
        .route("/v1/manager/transfer", post(transfer_manager))
        .route("/v1/journal", get(list_journal))
        .route("/v1/dev/faucet", post(faucet))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
    #[error("journal store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Vault(#[from] VaultError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Authorization => StatusCode::FORBIDDEN,
        ErrorKind::State => StatusCode::CONFLICT,
        ErrorKind::Resource => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::External => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Vault(err) => {
                let kind = err.kind();
                (
                    status_for(kind),
                    Json(serde_json::json!({ "error": err.to_string(), "kind": kind })),
                )
                    .into_response()
            }
        }
    }
}

/// Run a mutating vault call, mirror the journal, then surface the result.
async fn mutate<T>(
    state: &ServiceState,
    outcome: Result<T, VaultError>,
) -> Result<T, ApiError> {
    state.mirror_journal().await;
    Ok(outcome?)
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    journal_backend: &'static str,
    journal_verified: bool,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let journal_backend = state.mirror.lock().await.backend_label();
    Json(HealthResponse {
        status: "ok",
        service: "tmvault-service",
        journal_backend,
        journal_verified: state.vault.verify_journal().await,
    })
}

async fn totals(State(state): State<ServiceState>) -> Result<Json<VaultTotals>, ApiError> {
    Ok(Json(state.vault.totals().await?))
}

#[derive(Debug, Clone, Serialize)]
struct AccountSummary {
    account: AccountId,
    balance_minor: u64,
    wallet_minor: u64,
    pending_indices: Vec<u64>,
}

async fn account_summary(
    Path(account): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<AccountSummary>, ApiError> {
    let account = AccountId::from(account);
    let balance_minor = state.vault.balance_of(&account).await?;
    let wallet_minor = state.asset.balance_of(&account).await?;
    let pending_indices = state
        .vault
        .withdrawals_of(&account)
        .await?
        .into_iter()
        .filter(|request| !request.status.is_terminal())
        .map(|request| request.index)
        .collect();
    Ok(Json(AccountSummary {
        account,
        balance_minor,
        wallet_minor,
        pending_indices,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct WithdrawalListResponse {
    items: Vec<WithdrawalRequest>,
}

async fn account_withdrawals(
    Path(account): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<WithdrawalListResponse>, ApiError> {
    Ok(Json(WithdrawalListResponse {
        items: state.vault.withdrawals_of(&AccountId::from(account)).await?,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct DepositRequest {
    caller: AccountId,
    receiver: Option<AccountId>,
    amount_minor: u64,
}

#[derive(Debug, Clone, Serialize)]
struct DepositResponse {
    receiver: AccountId,
    credited_minor: u64,
    balance_minor: u64,
}

async fn deposit(
    State(state): State<ServiceState>,
    Json(request): Json<DepositRequest>,
) -> Result<Json<DepositResponse>, ApiError> {
    let receiver = request.receiver.unwrap_or_else(|| request.caller.clone());
    let outcome = state
        .vault
        .deposit(&request.caller, &receiver, request.amount_minor)
        .await;
    let credited_minor = mutate(&state, outcome).await?;
    let balance_minor = state.vault.balance_of(&receiver).await?;
    Ok(Json(DepositResponse {
        receiver,
        credited_minor,
        balance_minor,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct AmountRequest {
    caller: AccountId,
    amount_minor: u64,
}

#[derive(Debug, Clone, Serialize)]
struct InstantWithdrawResponse {
    owner: AccountId,
    amount_minor: u64,
    balance_minor: u64,
}

async fn instant_withdraw(
    State(state): State<ServiceState>,
    Json(request): Json<AmountRequest>,
) -> Result<Json<InstantWithdrawResponse>, ApiError> {
    let outcome = state
        .vault
        .instant_withdraw(&request.caller, request.amount_minor)
        .await;
    mutate(&state, outcome).await?;
    let balance_minor = state.vault.balance_of(&request.caller).await?;
    Ok(Json(InstantWithdrawResponse {
        owner: request.caller,
        amount_minor: request.amount_minor,
        balance_minor,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct QueuedWithdrawalResponse {
    index: u64,
    ready_at: DateTime<Utc>,
}

async fn request_withdrawal(
    State(state): State<ServiceState>,
    Json(request): Json<AmountRequest>,
) -> Result<Json<QueuedWithdrawalResponse>, ApiError> {
    let outcome = state
        .vault
        .request_withdrawal(&request.caller, request.amount_minor)
        .await;
    let index = mutate(&state, outcome).await?;
    Ok(Json(QueuedWithdrawalResponse {
        index,
        ready_at: state.vault.withdrawal_ready_at(index).await?,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct WithdrawalDetailResponse {
    request: WithdrawalRequest,
    ready: bool,
    ready_at: DateTime<Utc>,
}

async fn withdrawal_detail(
    Path(index): Path<u64>,
    State(state): State<ServiceState>,
) -> Result<Json<WithdrawalDetailResponse>, ApiError> {
    let request = state.vault.withdrawal_request(index).await?;
    Ok(Json(WithdrawalDetailResponse {
        request,
        ready: state.vault.is_withdrawal_ready(index).await?,
        ready_at: state.vault.withdrawal_ready_at(index).await?,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct CallerRequest {
    caller: AccountId,
}

async fn process_withdrawal(
    Path(index): Path<u64>,
    State(state): State<ServiceState>,
    Json(request): Json<CallerRequest>,
) -> Result<Json<WithdrawalRequest>, ApiError> {
    let outcome = state.vault.process_withdrawal(&request.caller, index).await;
    Ok(Json(mutate(&state, outcome).await?))
}

async fn cancel_withdrawal(
    Path(index): Path<u64>,
    State(state): State<ServiceState>,
    Json(request): Json<CallerRequest>,
) -> Result<Json<WithdrawalRequest>, ApiError> {
    let outcome = state.vault.cancel_withdrawal(&request.caller, index).await;
    Ok(Json(mutate(&state, outcome).await?))
}

#[derive(Debug, Clone, Serialize)]
struct QueueSizeResponse {
    pending: usize,
}

async fn queue_size(State(state): State<ServiceState>) -> Result<Json<QueueSizeResponse>, ApiError> {
    Ok(Json(QueueSizeResponse {
        pending: state.vault.queue_size().await?,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct AdapterListResponse {
    items: Vec<AdapterPosition>,
}

async fn list_adapters(
    State(state): State<ServiceState>,
) -> Result<Json<AdapterListResponse>, ApiError> {
    Ok(Json(AdapterListResponse {
        items: state.vault.adapter_positions().await?,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct AllocationResponse {
    adapter: AdapterId,
    allocated_minor: u64,
    acknowledged: bool,
}

async fn allocate(
    Path(adapter): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<AmountRequest>,
) -> Result<Json<AllocationResponse>, ApiError> {
    let adapter = AdapterId::from(adapter);
    let outcome = state
        .vault
        .allocate(&request.caller, &adapter, request.amount_minor)
        .await;
    mutate(&state, outcome).await?;
    Ok(Json(AllocationResponse {
        allocated_minor: state.vault.allocation_of(&adapter).await?,
        adapter,
        acknowledged: true,
    }))
}

async fn deallocate(
    Path(adapter): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<AmountRequest>,
) -> Result<Json<AllocationResponse>, ApiError> {
    let adapter = AdapterId::from(adapter);
    let outcome = state
        .vault
        .deallocate(&request.caller, &adapter, request.amount_minor)
        .await;
    let acknowledged = mutate(&state, outcome).await?;
    Ok(Json(AllocationResponse {
        allocated_minor: state.vault.allocation_of(&adapter).await?,
        adapter,
        acknowledged,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct RemovalResponse {
    adapter: AdapterId,
    forced_deallocation_minor: u64,
}

async fn remove_adapter(
    Path(adapter): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<CallerRequest>,
) -> Result<Json<RemovalResponse>, ApiError> {
    let adapter = AdapterId::from(adapter);
    let outcome = state.vault.remove_adapter(&request.caller, &adapter).await;
    Ok(Json(RemovalResponse {
        forced_deallocation_minor: mutate(&state, outcome).await?,
        adapter,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct CollectYieldRequest {
    caller: AccountId,
    /// Defaults to every registered adapter.
    adapters: Option<Vec<AdapterId>>,
}

#[derive(Debug, Clone, Serialize)]
struct CollectYieldResponse {
    credited_minor: u64,
    total_yield_minor: u64,
}

async fn collect_yield(
    State(state): State<ServiceState>,
    Json(request): Json<CollectYieldRequest>,
) -> Result<Json<CollectYieldResponse>, ApiError> {
    let adapters = match request.adapters {
        Some(adapters) => adapters,
        None => state.vault.adapters().await?,
    };
    let outcome = state.vault.collect_yield(&request.caller, &adapters).await;
    let credited_minor = mutate(&state, outcome).await?;
    Ok(Json(CollectYieldResponse {
        credited_minor,
        total_yield_minor: state.vault.totals().await?.total_yield_minor,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct RecallResponse {
    recalled_minor: u64,
}

async fn emergency_recall(
    State(state): State<ServiceState>,
    Json(request): Json<CallerRequest>,
) -> Result<Json<RecallResponse>, ApiError> {
    let outcome = state.vault.emergency_recall_all(&request.caller).await;
    Ok(Json(RecallResponse {
        recalled_minor: mutate(&state, outcome).await?,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct TransferManagerRequest {
    caller: AccountId,
    new_manager: AccountId,
}

#[derive(Debug, Clone, Serialize)]
struct ManagerResponse {
    manager: AccountId,
}

async fn transfer_manager(
    State(state): State<ServiceState>,
    Json(request): Json<TransferManagerRequest>,
) -> Result<Json<ManagerResponse>, ApiError> {
    let outcome = state
        .vault
        .transfer_manager(&request.caller, request.new_manager)
        .await;
    mutate(&state, outcome).await?;
    Ok(Json(ManagerResponse {
        manager: state.vault.manager().await?,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct JournalQuery {
    since: Option<u64>,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct JournalResponse {
    backend: &'static str,
    returned: usize,
    items: Vec<JournalEntry>,
}

async fn list_journal(
    State(state): State<ServiceState>,
    Query(query): Query<JournalQuery>,
) -> Result<Json<JournalResponse>, ApiError> {
    let limit = query.limit.unwrap_or(100);
    if limit == 0 || limit > 1000 {
        return Err(ApiError::bad_request(format!(
            "invalid limit {limit}; expected 1..=1000"
        )));
    }
    let items = state
        .vault
        .journal_entries(query.since.unwrap_or(0), limit)
        .await;
    Ok(Json(JournalResponse {
        backend: state.mirror.lock().await.backend_label(),
        returned: items.len(),
        items,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct FaucetRequest {
    account: AccountId,
    amount_minor: u64,
}

#[derive(Debug, Clone, Serialize)]
struct FaucetResponse {
    account: AccountId,
    wallet_minor: u64,
}

async fn faucet(
    State(state): State<ServiceState>,
    Json(request): Json<FaucetRequest>,
) -> Result<Json<FaucetResponse>, ApiError> {
    let wallet_minor = state.faucet(&request.account, request.amount_minor).await?;
    Ok(Json(FaucetResponse {
        account: request.account,
        wallet_minor,
    }))
}
