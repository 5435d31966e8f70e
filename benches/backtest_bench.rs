//! Performance benchmarks for ranking, simulation and optimization.
//!
//! Run with: cargo bench

use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use crossfactor::data::Panel;
use crossfactor::engine::{BacktestConfig, RunContext, StrategyBacktester};
use crossfactor::factors::{compute, rank, FactorKind};
use crossfactor::optimizer::{MeanVarianceOptimizer, OptimizerConfig, StrategyReturnMatrix};
use crossfactor::portfolio::MultiStrategyEngine;
use crossfactor::regime::{RegimeConfig, RegimeDetector};
use crossfactor::strategy::StrategyVariant;
use crossfactor::types::Observation;
use std::collections::BTreeMap;

/// Generate a synthetic panel of `symbols` entities over `days` dates.
fn generate_panel(symbols: usize, days: usize) -> Panel {
    let start = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
    let mut observations = Vec::with_capacity(symbols * days);
    for s in 0..symbols {
        let symbol = if s == 0 { "BTC".to_string() } else { format!("SYM{:03}", s) };
        let mut price = 100.0 + s as f64;
        for d in 0..days {
            let noise = ((d as f64 * 0.7 + s as f64).sin() * 2.0 + (d as f64 * 1.3).cos()) * 0.01;
            price *= 1.0 + 0.0005 * (s % 5) as f64 + noise;
            price = price.max(1.0);
            let date = start + chrono::Days::new(d as u64);
            let volume = 1_000_000.0 * (1.0 + ((d + s) % 7) as f64 / 10.0);
            observations.push(
                Observation::new(symbol.clone(), date, price, volume, price * 1e7)
                    .with_aux("funding_rate", noise * 0.1),
            );
        }
    }
    Panel::from_observations(observations).unwrap()
}

/// Benchmark factor computation and cross-sectional ranking.
fn bench_ranking(c: &mut Criterion) {
    let mut group = c.benchmark_group("ranking");

    for symbols in [20, 100, 500].iter() {
        let panel = generate_panel(*symbols, 60);
        let values = compute(&panel, 30, &FactorKind::Momentum);
        group.bench_with_input(BenchmarkId::new("momentum_w30", symbols), &values, |b, values| {
            b.iter(|| rank("momentum", black_box(values), 0.8, 0.2))
        });
    }

    let panel = generate_panel(100, 120);
    for window in [7, 30, 60].iter() {
        group.bench_with_input(BenchmarkId::new("compute_low_vol", window), window, |b, &window| {
            b.iter(|| compute(black_box(&panel), window, &FactorKind::LowVolatility))
        });
    }

    group.finish();
}

/// Benchmark single-strategy simulation across panel sizes.
fn bench_strategy_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("strategy_run");
    let config = BacktestConfig {
        show_progress: false,
        ..Default::default()
    };

    for days in [250, 1000].iter() {
        let panel = generate_panel(50, *days);
        let regimes = RegimeDetector::new(RegimeConfig::default()).detect_series(&panel);
        let ctx = RunContext::new(&panel, &regimes, &config).unwrap();
        let backtester = StrategyBacktester::new(StrategyVariant::Momentum.defaults());

        group.bench_with_input(BenchmarkId::new("momentum", days), &ctx, |b, ctx| {
            b.iter(|| backtester.run(black_box(ctx)))
        });
    }

    group.finish();
}

/// Benchmark the full multi-strategy pipeline.
fn bench_multi_strategy(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_strategy");
    group.sample_size(10);

    let panel = generate_panel(50, 500);
    let config = BacktestConfig {
        show_progress: false,
        ..Default::default()
    };

    for count in [2usize, 4, 6].iter() {
        let weight = 1.0 / *count as f64;
        let strategies: Vec<_> = StrategyVariant::ALL
            .iter()
            .take(*count)
            .map(|v| {
                let mut s = v.defaults();
                s.capital_weight = weight;
                s
            })
            .collect();
        let engine = MultiStrategyEngine::new(config.clone(), RegimeConfig::default(), strategies);

        group.bench_with_input(BenchmarkId::new("strategies", count), &engine, |b, engine| {
            b.iter(|| engine.run(black_box(&panel)))
        });
    }

    group.finish();
}

/// Benchmark the constrained mean-variance solve.
fn bench_optimizer(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimizer");
    let optimizer = MeanVarianceOptimizer::new(OptimizerConfig::default());
    let caps = BTreeMap::new();
    let floors = BTreeMap::new();

    for n in [3usize, 10, 30].iter() {
        let ids: Vec<String> = (0..*n).map(|i| format!("s{}", i)).collect();
        let returns: Vec<Vec<f64>> = (0..*n)
            .map(|i| {
                (0..500)
                    .map(|t| 0.0005 * (i + 1) as f64 + 0.01 * ((t * (i + 3)) as f64 * 0.37).sin())
                    .collect()
            })
            .collect();
        let matrix = StrategyReturnMatrix::new(ids, returns).unwrap();

        group.bench_with_input(BenchmarkId::new("mvo", n), &matrix, |b, matrix| {
            b.iter(|| optimizer.optimize(black_box(matrix), &caps, &floors))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_ranking,
    bench_strategy_run,
    bench_multi_strategy,
    bench_optimizer,
);
criterion_main!(benches);
