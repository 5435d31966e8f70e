//! Property-based tests using proptest for invariant testing.
//!
//! These tests verify that:
//! 1. Long and short buckets never share an entity
//! 2. Bucket weights always sum to the side's allocation
//! 3. Reallocated capital always sums to 1.0
//! 4. Drawdowns stay within [0, 1]

use chrono::NaiveDate;
use proptest::prelude::*;

use crossfactor::allocation::{reallocate_slots, CapitalSlot, WEIGHT_TOLERANCE};
use crossfactor::analytics::{max_drawdown, max_drawdown_duration};
use crossfactor::factors::rank;
use crossfactor::types::{Bucket, FactorValue};
use crossfactor::weighting::{turnover, weight, BucketMember, WeightingMethod};
use std::collections::{BTreeMap, BTreeSet};

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
}

/// Factor values with coarse quantization so ties are common.
fn factor_values() -> impl Strategy<Value = Vec<FactorValue>> {
    prop::collection::vec(prop::option::weighted(0.9, -20i32..20), 0..40).prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(i, v)| FactorValue {
                symbol: format!("S{:02}", i),
                date: date(),
                factor_name: "test".to_string(),
                value: v.map(|x| x as f64 / 4.0),
            })
            .collect()
    })
}

/// Percentile pair with short <= long.
fn percentiles() -> impl Strategy<Value = (f64, f64)> {
    (0.0..=1.0f64, 0.0..=1.0f64).prop_map(|(a, b)| if a <= b { (b, a) } else { (a, b) })
}

// ============================================================================
// Ranking Property Tests
// ============================================================================

proptest! {
    #[test]
    fn bucket_membership_is_disjoint(values in factor_values(), (long, short) in percentiles()) {
        let signals = rank("s", &values, long, short);
        let longs: BTreeSet<&str> = signals.iter().filter(|s| s.bucket == Bucket::Long).map(|s| s.symbol.as_str()).collect();
        let shorts: BTreeSet<&str> = signals.iter().filter(|s| s.bucket == Bucket::Short).map(|s| s.symbol.as_str()).collect();
        prop_assert!(longs.is_disjoint(&shorts));
    }

    #[test]
    fn ranking_is_a_permutation_of_defined_values(values in factor_values(), (long, short) in percentiles()) {
        let signals = rank("s", &values, long, short);
        let defined = values.iter().filter(|v| v.defined().is_some()).count();
        prop_assert_eq!(signals.len(), defined);

        let symbols: BTreeSet<&str> = signals.iter().map(|s| s.symbol.as_str()).collect();
        prop_assert_eq!(symbols.len(), defined);
        for s in &signals {
            prop_assert!(s.percentile_rank > 0.0 && s.percentile_rank <= 1.0);
        }
    }

    #[test]
    fn higher_factor_never_ranks_lower(values in factor_values()) {
        let signals = rank("s", &values, 0.8, 0.2);
        for a in &signals {
            for b in &signals {
                if a.factor_value < b.factor_value {
                    prop_assert!(a.percentile_rank < b.percentile_rank);
                }
            }
        }
    }
}

// ============================================================================
// Weighting Property Tests
// ============================================================================

fn members() -> impl Strategy<Value = Vec<BucketMember>> {
    prop::collection::vec(prop::option::weighted(0.8, 0.001..2.0f64), 1..25).prop_map(|vols| {
        vols.into_iter()
            .enumerate()
            .map(|(i, v)| BucketMember::new(format!("M{:02}", i), v))
            .collect()
    })
}

proptest! {
    #[test]
    fn equal_weights_sum_to_allocation(members in members(), allocation in 0.01..2.0f64) {
        let w = weight(&members, WeightingMethod::EqualWeight, allocation);
        let total: f64 = w.values().sum();
        prop_assert!((total - allocation).abs() < 1e-9);
        prop_assert_eq!(w.len(), members.len());
    }

    #[test]
    fn risk_parity_weights_sum_to_allocation(members in members(), allocation in 0.01..2.0f64) {
        let w = weight(&members, WeightingMethod::RiskParity, allocation);
        let usable = members.iter().filter(|m| m.volatility.is_some()).count();
        prop_assert_eq!(w.len(), usable);
        if usable > 0 {
            let total: f64 = w.values().sum();
            prop_assert!((total - allocation).abs() < 1e-9);
        }
        prop_assert!(w.values().all(|x| *x > 0.0));
    }

    #[test]
    fn turnover_is_bounded_by_gross(members in members(), allocation in 0.01..1.0f64) {
        let a = weight(&members, WeightingMethod::EqualWeight, allocation);
        let b = weight(&members, WeightingMethod::RiskParity, allocation);
        let t = turnover(&a, &b);
        prop_assert!(t >= 0.0);
        prop_assert!(t <= allocation + 1e-9);
        prop_assert!(turnover(&a, &a).abs() < 1e-15);
    }
}

// ============================================================================
// Reallocation Property Tests
// ============================================================================

fn slots() -> impl Strategy<Value = Vec<CapitalSlot>> {
    prop::collection::vec((0.01..1.0f64, any::<bool>(), any::<bool>()), 1..8).prop_map(|raw| {
        let total: f64 = raw.iter().map(|(w, _, _)| w).sum();
        raw.into_iter()
            .enumerate()
            .map(|(i, (w, active, flexible))| CapitalSlot {
                strategy_id: format!("strategy_{}", i),
                base_weight: w / total,
                active,
                flexible,
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn reallocation_conserves_capital(slots in slots()) {
        let plan = reallocate_slots(date(), &slots).unwrap();
        prop_assert!((plan.total() - 1.0).abs() <= WEIGHT_TOLERANCE);
        prop_assert!(plan.weights.values().all(|w| *w >= 0.0));
        prop_assert!(plan.utilization <= 1.0 + WEIGHT_TOLERANCE);
    }

    #[test]
    fn fixed_weights_move_only_without_active_flexible(slots in slots()) {
        let plan = reallocate_slots(date(), &slots).unwrap();
        let any_active_flexible = slots.iter().any(|s| s.flexible && s.active);
        for s in slots.iter().filter(|s| !s.flexible) {
            if any_active_flexible {
                prop_assert_eq!(plan.weight(&s.strategy_id), s.base_weight);
            } else {
                prop_assert!(plan.weight(&s.strategy_id) >= s.base_weight);
            }
        }
        for s in slots.iter().filter(|s| s.flexible && !s.active) {
            if any_active_flexible {
                prop_assert_eq!(plan.weight(&s.strategy_id), 0.0);
            }
        }
    }

    #[test]
    fn reallocation_ignores_input_order(slots in slots()) {
        let mut reversed = slots.clone();
        reversed.reverse();
        let a = reallocate_slots(date(), &slots).unwrap();
        let b = reallocate_slots(date(), &reversed).unwrap();
        let wa: BTreeMap<String, f64> = a.weights;
        prop_assert_eq!(wa, b.weights);
    }
}

// ============================================================================
// Drawdown Property Tests
// ============================================================================

proptest! {
    #[test]
    fn drawdown_is_a_fraction(returns in prop::collection::vec(-0.5..0.5f64, 1..200)) {
        let mut equity = vec![100.0];
        for r in &returns {
            let last = *equity.last().unwrap();
            equity.push(last * (1.0 + r));
        }
        let dd = max_drawdown(&equity);
        prop_assert!((0.0..=1.0).contains(&dd));
        prop_assert!(max_drawdown_duration(&equity) < equity.len());
    }

    #[test]
    fn monotone_equity_has_no_drawdown(steps in prop::collection::vec(0.0..10.0f64, 1..100)) {
        let mut equity = vec![100.0];
        for s in &steps {
            let last = *equity.last().unwrap();
            equity.push(last + s);
        }
        prop_assert_eq!(max_drawdown(&equity), 0.0);
        prop_assert_eq!(max_drawdown_duration(&equity), 0);
    }
}

#[test]
fn test_drawdown_reference_curve() {
    let dd = max_drawdown(&[100.0, 110.0, 90.0, 95.0]);
    assert!((dd - 20.0 / 110.0).abs() < 1e-12);
}
