mod common;

use anyhow::Result;
use pocketbook::application::{LedgerError, LedgerService};
use pocketbook::domain::{EntryId, User, UserId};
use proptest::prelude::*;

const USERS: [&str; 3] = [
    "ann@example.com",
    "ben@example.com",
    "cat@example.com",
];

#[derive(Debug, Clone)]
enum Op {
    Deposit { user: usize, amount: i64 },
    Withdraw { user: usize, amount: i64 },
    Transfer { from: usize, to: usize, amount: i64 },
    Edit { pick: usize, amount: i64 },
    Delete { pick: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let user = 0..USERS.len();
    let amount = 1i64..50_000;
    prop_oneof![
        (user.clone(), amount.clone()).prop_map(|(user, amount)| Op::Deposit { user, amount }),
        (user.clone(), amount.clone()).prop_map(|(user, amount)| Op::Withdraw { user, amount }),
        (user.clone(), user, amount.clone())
            .prop_map(|(from, to, amount)| Op::Transfer { from, to, amount }),
        (any::<usize>(), amount).prop_map(|(pick, amount)| Op::Edit { pick, amount }),
        any::<usize>().prop_map(|pick| Op::Delete { pick }),
    ]
}

async fn balances(service: &LedgerService, users: &[User]) -> Result<Vec<i64>> {
    let mut result = Vec::with_capacity(users.len());
    for user in users {
        result.push(service.balance(user.id).await?);
    }
    Ok(result)
}

async fn apply(
    service: &LedgerService,
    users: &[User],
    manual: &mut Vec<(EntryId, UserId)>,
    op: &Op,
) -> Result<(), LedgerError> {
    match *op {
        Op::Deposit { user, amount } => {
            let entry = service.deposit(users[user].id, amount).await?;
            manual.push((entry.id, entry.user_id));
        }
        Op::Withdraw { user, amount } => {
            let entry = service
                .withdraw(users[user].id, amount, Some("misc".to_string()))
                .await?;
            manual.push((entry.id, entry.user_id));
        }
        Op::Transfer { from, to, amount } => {
            service
                .transfer(users[from].id, &users[to].email, amount)
                .await?;
        }
        Op::Edit { pick, amount } => {
            if let Some(&(entry_id, user_id)) = manual.get(pick % manual.len().max(1)) {
                let entry = service.get_entry(entry_id, user_id).await?;
                let category = entry.category.clone();
                service.edit(entry_id, user_id, amount, category).await?;
            }
        }
        Op::Delete { pick } => {
            if !manual.is_empty() {
                let index = pick % manual.len();
                let (entry_id, user_id) = manual[index];
                service.delete(entry_id, user_id).await?;
                manual.remove(index);
            }
        }
    }
    Ok(())
}

async fn run_ops(service: &LedgerService, ops: Vec<Op>) -> Result<()> {
    let mut users = Vec::new();
    for email in USERS {
        users.push(common::register(service, email).await?);
    }
    let mut manual = Vec::new();

    for op in &ops {
        let before = balances(service, &users).await?;
        let outcome = apply(service, &users, &mut manual, op).await;
        let after = balances(service, &users).await?;

        match outcome {
            Ok(()) => {}
            Err(LedgerError::Storage(e)) => return Err(e),
            // Rejected operations leave every balance untouched
            Err(_) => assert_eq!(before, after, "rejected {op:?} changed balances"),
        }

        for user in &users {
            let check = service.reconcile(user.id).await?;
            assert!(check.is_consistent(), "after {op:?}: {check:?}");
            assert!(check.cached >= 0);
        }
    }
    Ok(())
}

async fn run_in_memory(ops: Vec<Op>) -> Result<()> {
    let service = LedgerService::in_memory().await?;
    run_ops(&service, ops).await
}

async fn run_on_sqlite(ops: Vec<Op>) -> Result<()> {
    let (service, _temp) = common::test_service().await?;
    run_ops(&service, ops).await
}

fn block_on(future: impl std::future::Future<Output = Result<()>>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(future).unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn cached_balance_always_equals_ledger_fold(ops in prop::collection::vec(op_strategy(), 1..40)) {
        block_on(run_in_memory(ops));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn cached_balance_always_equals_ledger_fold_on_sqlite(ops in prop::collection::vec(op_strategy(), 1..40)) {
        block_on(run_on_sqlite(ops));
    }
}
