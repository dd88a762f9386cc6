// Share math and ledger benchmarks for the sharevault engine.
//
// Covers the raw multiply-divide, mint and burn against a populated
// ledger, and a full deposit through the service with the oracle in the
// loop.

use std::sync::Arc;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use sharevault_engine::config::{EngineConfig, VaultParams};
use sharevault_engine::math::{mul_div, Rounding};
use sharevault_engine::{
    Address, SharePrice, ShareLedger, StaticPriceOracle, VaultAccountingService,
};

fn bench_mul_div(c: &mut Criterion) {
    c.bench_function("math/mul_div_floor", |b| {
        b.iter(|| mul_div(123_456_789_012, 987_654_321, 1_000_000_007, Rounding::Floor));
    });
    c.bench_function("math/mul_div_ceiling", |b| {
        b.iter(|| mul_div(123_456_789_012, 987_654_321, 1_000_000_007, Rounding::Ceiling));
    });
}

fn bench_mint_burn(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger/mint_burn");

    for holders in [10u32, 1_000, 10_000] {
        let ledger = ShareLedger::new();
        let vault = Address::derive_vault("bench");
        let now = Utc::now();
        ledger
            .create_vault(vault, Address::new([0; 32]), VaultParams::default(), now)
            .unwrap();
        for i in 0..holders {
            let mut bytes = [0u8; 32];
            bytes[..4].copy_from_slice(&i.to_le_bytes());
            ledger
                .mint(&vault, &Address::new(bytes), 1_000_000, now)
                .unwrap();
        }

        let principal = Address::new([0xFF; 32]);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(holders), &holders, |b, _| {
            b.iter(|| {
                let shares = ledger.mint(&vault, &principal, 10_000, now).unwrap();
                ledger.burn(&vault, &principal, shares, now).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_service_deposit(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let vault = Address::derive_vault("bench-service");
    let oracle = Arc::new(StaticPriceOracle::new());
    oracle.set_price(vault, "1.000000123".parse::<SharePrice>().unwrap());
    let service = VaultAccountingService::new(oracle, EngineConfig::default());
    let now = Utc::now();
    runtime
        .block_on(service.create_vault(vault, Address::new([0; 32]), VaultParams::default(), now))
        .unwrap();
    let principal = Address::new([1; 32]);

    c.bench_function("service/deposit", |b| {
        b.iter(|| {
            runtime
                .block_on(service.deposit(&vault, &principal, 1_000, now))
                .unwrap()
        });
    });
}

criterion_group!(benches, bench_mul_div, bench_mint_burn, bench_service_deposit);
criterion_main!(benches);
