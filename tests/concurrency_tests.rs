mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use dualentry::{AccountOptions, AccountRef, LedgerError, RetryPolicy, TransferRequest};
use dualentry_core::BalanceStore;

use common::*;

const THREADS: usize = 8;
const TRANSFERS_PER_THREAD: usize = 20;

fn policy() -> RetryPolicy {
    RetryPolicy::new(1_000, Duration::from_millis(1))
}

fn test_opposite_order_transfers_do_not_lose_updates(store: Arc<dyn BalanceStore>) {
    let ledger = ledger(store);

    std::thread::scope(|s| {
        for thread in 0..THREADS {
            let ledger = &ledger;
            s.spawn(move || {
                let request = if thread % 2 == 0 {
                    TransferRequest::new(usd(1), "left", "right", "swap")
                } else {
                    TransferRequest::new(usd(2), "right", "left", "swap")
                };
                for _ in 0..TRANSFERS_PER_THREAD {
                    ledger
                        .transfer_with_retry(&request, &policy())
                        .expect("Transfer should commit after retries");
                }
            });
        }
    });

    let per_direction = (THREADS / 2 * TRANSFERS_PER_THREAD) as i64;
    assert_eq!(balance(&ledger, "left"), per_direction * 2 - per_direction);
    assert_eq!(balance(&ledger, "right"), per_direction - per_direction * 2);

    let lines = ledger.lines("left", &AccountOptions::default()).unwrap();
    assert_eq!(lines.len(), THREADS * TRANSFERS_PER_THREAD);
    assert_balance_matches_lines(&ledger, "left", &AccountOptions::default());
    assert_balance_matches_lines(&ledger, "right", &AccountOptions::default());
}

fn test_positive_only_account_is_never_overdrawn(store: Arc<dyn BalanceStore>) {
    let ledger = ledger(store);
    let funded = 100;
    transfer(&ledger, funded, "equity", "checking", "fund");
    let committed = AtomicUsize::new(0);
    let rejected = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let request = TransferRequest::new(usd(1), "checking", "savings", "deposit");
                for _ in 0..TRANSFERS_PER_THREAD {
                    match ledger.transfer_with_retry(&request, &policy()) {
                        Ok(_) => committed.fetch_add(1, Ordering::SeqCst),
                        Err(LedgerError::InsufficientBalance { .. }) => rejected.fetch_add(1, Ordering::SeqCst),
                        Err(e) => panic!("Unexpected error: {}", e),
                    };
                }
            });
        }
    });

    assert_eq!(committed.load(Ordering::SeqCst), funded as usize);
    assert_eq!(
        rejected.load(Ordering::SeqCst),
        THREADS * TRANSFERS_PER_THREAD - funded as usize
    );
    assert_eq!(balance(&ledger, "checking"), 0);
    assert_eq!(balance(&ledger, "savings"), funded);
    assert_balance_matches_lines(&ledger, "checking", &AccountOptions::default());
    assert_balance_matches_lines(&ledger, "savings", &AccountOptions::default());
}

fn test_disjoint_scopes_proceed_in_parallel(store: Arc<dyn BalanceStore>) {
    let ledger = ledger(store);

    std::thread::scope(|s| {
        for thread in 0..THREADS {
            let ledger = &ledger;
            s.spawn(move || {
                let opts = AccountOptions::default().scope(&format!("user-{}", thread));
                let request = TransferRequest::new(
                    usd(3),
                    AccountRef::named("left", opts.clone()),
                    AccountRef::named("right", opts),
                    "swap",
                );
                for _ in 0..TRANSFERS_PER_THREAD {
                    ledger
                        .transfer_with_retry(&request, &policy())
                        .expect("Transfer should commit after retries");
                }
            });
        }
    });

    let expected = (3 * TRANSFERS_PER_THREAD) as i64;
    for thread in 0..THREADS {
        let opts = AccountOptions::default().scope(&format!("user-{}", thread));
        assert_eq!(balance_in(&ledger, "left", &opts), -expected);
        assert_eq!(balance_in(&ledger, "right", &opts), expected);
        assert_balance_matches_lines(&ledger, "right", &opts);
    }
}

macro_rules! backend_tests {
    ($backend:ident, $store:expr, [$($name:ident),* $(,)?]) => {
        paste::paste! {
            $(
                #[test]
                fn [<$name _ $backend>]() {
                    match $store {
                        Some(store) => $name(store),
                        None => eprintln!("skipping: {} is not set", POSTGRES_URL_VAR),
                    }
                }
            )*
        }
    };
}

macro_rules! all_backends {
    ($($name:ident),* $(,)?) => {
        backend_tests!(memory, memory_store(), [$($name),*]);
        backend_tests!(sqlite, sqlite_store(), [$($name),*]);
        backend_tests!(postgres, postgres_store(), [$($name),*]);
    };
}

all_backends!(
    test_opposite_order_transfers_do_not_lose_updates,
    test_positive_only_account_is_never_overdrawn,
    test_disjoint_scopes_proceed_in_parallel,
);
