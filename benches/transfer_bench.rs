use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dualentry::{AccountOptions, Ledger, LedgerConfig, Money, TransferRequest};
use dualentry_core::BalanceStore;
use dualentry_memory::InMemoryStore;
use dualentry_sqlite::SqliteStore;

fn setup(store: Arc<dyn BalanceStore>) -> Ledger {
    let config = LedgerConfig::builder()
        .default_currency("USD")
        .account("bank", true)
        .transfer("fund", "equity", "bank")
        .transfer("pay", "bank", "vendor")
        .transfer("pay", "bank", "payroll")
        .build();
    let ledger = Ledger::new(Arc::new(config), store);
    ledger
        .transfer(TransferRequest::new(Money::new(i64::MAX / 2, "USD"), "equity", "bank", "fund"))
        .unwrap();
    ledger
}

fn bench_transfer(c: &mut Criterion) {
    let memory = setup(Arc::new(InMemoryStore::new()));
    let request = TransferRequest::new(Money::new(1, "USD"), "bank", "vendor", "pay");
    c.bench_function("transfer_memory", |b| {
        b.iter(|| memory.transfer(black_box(request.clone())).unwrap())
    });

    let sqlite = setup(Arc::new(SqliteStore::new(":memory:").unwrap()));
    c.bench_function("transfer_sqlite", |b| {
        b.iter(|| sqlite.transfer(black_box(request.clone())).unwrap())
    });

    let scoped = TransferRequest::new(
        Money::new(1, "USD"),
        dualentry::AccountRef::named("bank", AccountOptions::default()),
        dualentry::AccountRef::named("payroll", AccountOptions::default().scope("team-a")),
        "pay",
    );
    c.bench_function("transfer_memory_scoped", |b| {
        b.iter(|| memory.transfer(black_box(scoped.clone())).unwrap())
    });
}

fn bench_rejection(c: &mut Criterion) {
    let ledger = setup(Arc::new(InMemoryStore::new()));
    let undefined = TransferRequest::new(Money::new(1, "USD"), "vendor", "bank", "pay");
    c.bench_function("reject_undefined_pair", |b| {
        b.iter(|| ledger.transfer(black_box(undefined.clone())).unwrap_err())
    });
}

fn bench_read_back(c: &mut Criterion) {
    let ledger = setup(Arc::new(InMemoryStore::new()));
    let request = TransferRequest::new(Money::new(1, "USD"), "bank", "vendor", "pay");
    for _ in 0..1000 {
        ledger.transfer(request.clone()).unwrap();
    }
    let opts = AccountOptions::default();

    c.bench_function("balance_lookup", |b| {
        b.iter(|| ledger.balance(black_box("bank"), &opts).unwrap())
    });
    c.bench_function("lines_for_1000", |b| {
        b.iter(|| ledger.lines(black_box("vendor"), &opts).unwrap())
    });
}

criterion_group!(benches, bench_transfer, bench_rejection, bench_read_back);
criterion_main!(benches);
