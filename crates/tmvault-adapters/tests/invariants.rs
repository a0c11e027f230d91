//! Property tests: random operation sequences never break pool conservation.

mod common;

use chrono::Duration;
use common::{acct, manager, vault_account, Harness};
use proptest::prelude::*;
use tmvault_core::{AdapterId, CustodyAsset, VaultError};

const USERS: [&str; 3] = ["alice", "bob", "carol"];
const ADAPTERS: [&str; 2] = ["aave", "compound"];

#[derive(Debug, Clone)]
enum Op {
    Deposit { user: usize, amount: u64 },
    InstantWithdraw { user: usize, amount: u64 },
    Request { user: usize, amount: u64 },
    Process { index: u64 },
    Cancel { user: usize, index: u64 },
    Allocate { adapter: usize, amount: u64 },
    Deallocate { adapter: usize, amount: u64 },
    Accrue { adapter: usize, amount: u64 },
    CollectYield,
    EmergencyRecall,
    Advance { hours: i64 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..USERS.len(), 1u64..50_000).prop_map(|(user, amount)| Op::Deposit { user, amount }),
        (0..USERS.len(), 1u64..60_000)
            .prop_map(|(user, amount)| Op::InstantWithdraw { user, amount }),
        (0..USERS.len(), 1u64..60_000).prop_map(|(user, amount)| Op::Request { user, amount }),
        (0u64..12).prop_map(|index| Op::Process { index }),
        (0..USERS.len(), 0u64..12).prop_map(|(user, index)| Op::Cancel { user, index }),
        (0..ADAPTERS.len(), 1u64..80_000)
            .prop_map(|(adapter, amount)| Op::Allocate { adapter, amount }),
        (0..ADAPTERS.len(), 1u64..80_000)
            .prop_map(|(adapter, amount)| Op::Deallocate { adapter, amount }),
        (0..ADAPTERS.len(), 1u64..5_000)
            .prop_map(|(adapter, amount)| Op::Accrue { adapter, amount }),
        Just(Op::CollectYield),
        Just(Op::EmergencyRecall),
        (0i64..30).prop_map(|hours| Op::Advance { hours }),
    ]
}

/// Apply one op. Returns true when it settled funds out of the pool.
async fn apply(h: &Harness, adapters: &[std::sync::Arc<tmvault_adapters::MockYieldAdapter>], op: &Op) -> bool {
    let result: Result<bool, VaultError> = match op {
        Op::Deposit { user, amount } => {
            let who = acct(USERS[*user]);
            h.asset.mint(&who, *amount).unwrap();
            h.asset
                .approve(&who, &vault_account(), *amount)
                .await
                .unwrap();
            h.vault.deposit(&who, &who, *amount).await.map(|_| false)
        }
        Op::InstantWithdraw { user, amount } => h
            .vault
            .instant_withdraw(&acct(USERS[*user]), *amount)
            .await
            .map(|_| true),
        Op::Request { user, amount } => {
            let before = h.vault.withdrawals_of(&acct(USERS[*user])).await.unwrap().len();
            let outcome = h.vault.request_withdrawal(&acct(USERS[*user]), *amount).await;
            if let Ok(index) = outcome {
                let request = h.vault.withdrawal_request(index).await.unwrap();
                assert_eq!(request.index, index);
                let after = h.vault.withdrawals_of(&acct(USERS[*user])).await.unwrap();
                assert_eq!(after.len(), before + 1);
                assert_eq!(after.last().map(|r| r.index), Some(index));
            }
            outcome.map(|_| false)
        }
        Op::Process { index } => h
            .vault
            .process_withdrawal(&acct("keeper"), *index)
            .await
            .map(|_| true),
        Op::Cancel { user, index } => h
            .vault
            .cancel_withdrawal(&acct(USERS[*user]), *index)
            .await
            .map(|_| false),
        Op::Allocate { adapter, amount } => h
            .vault
            .allocate(&manager(), &AdapterId::from(ADAPTERS[*adapter]), *amount)
            .await
            .map(|_| false),
        Op::Deallocate { adapter, amount } => h
            .vault
            .deallocate(&manager(), &AdapterId::from(ADAPTERS[*adapter]), *amount)
            .await
            .map(|_| false),
        Op::Accrue { adapter, amount } => {
            adapters[*adapter].accrue(*amount).unwrap();
            Ok(false)
        }
        Op::CollectYield => {
            let ids: Vec<AdapterId> = ADAPTERS.iter().map(|id| AdapterId::from(*id)).collect();
            h.vault.collect_yield(&manager(), &ids).await.map(|_| false)
        }
        Op::EmergencyRecall => h.vault.emergency_recall_all(&manager()).await.map(|_| false),
        Op::Advance { hours } => {
            h.clock.advance(Duration::hours(*hours));
            Ok(false)
        }
    };
    result.unwrap_or(false)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Conservation, allocation sums, queue capacity and index density hold
    /// after every operation, and total assets only shrink on settlement.
    #[test]
    fn random_operations_preserve_invariants(ops in prop::collection::vec(arb_op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let h = Harness::new();
            let adapters = vec![h.mock(ADAPTERS[0]), h.mock(ADAPTERS[1])];
            h.vault
                .set_primary_adapters(&manager(), adapters[0].clone(), adapters[1].clone())
                .await
                .unwrap();
            let capacity = h.vault.config().max_pending_withdrawals;

            for op in &ops {
                let assets_before = h.vault.total_assets().await.unwrap();
                let settled = apply(&h, &adapters, op).await;

                h.vault.verify_invariants().await.unwrap();
                assert!(h.vault.queue_size().await.unwrap() <= capacity);
                let assets_after = h.vault.total_assets().await.unwrap();
                if !settled {
                    assert!(
                        assets_after >= assets_before,
                        "total assets fell from {assets_before} to {assets_after} on {op:?}"
                    );
                }
            }
            assert!(h.vault.verify_journal().await);
        });
    }

    /// A processed request can never be processed again.
    #[test]
    fn processing_is_idempotent(amount in 1u64..100_000, extra_hours in 0i64..48) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let h = Harness::new();
            h.fund("alice", amount).await;
            let index = h.vault.request_withdrawal(&acct("alice"), amount).await.unwrap();
            h.wait_cooldown();
            h.clock.advance(Duration::hours(extra_hours));

            h.vault.process_withdrawal(&acct("alice"), index).await.unwrap();
            let second = h.vault.process_withdrawal(&acct("alice"), index).await;
            assert!(matches!(second, Err(VaultError::RequestFinalized { .. })));
            assert_eq!(h.wallet("alice").await, amount);
        });
    }
}
