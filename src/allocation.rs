//! Capital reallocation across strategies.
//!
//! Strategies are either fixed (their weight never moves with activity) or
//! flexible. The nominal weight of an inactive flexible strategy is handed to
//! the active flexible strategies in proportion to their own weights:
//!
//! ```text
//! w_j' = w_j * (1 + sum(inactive flexible) / sum(active flexible))
//! ```
//!
//! When no flexible strategy is active the freed weight is split equally
//! among the fixed strategies, or left in place as idle cash when there are
//! none. Every plan is checked to sum to 1.0 before it is returned, and the
//! share of capital held by active strategies is reported as utilization.

use crate::error::{FactorError, Result, Warning};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

/// Tolerance on the plan total.
pub const WEIGHT_TOLERANCE: f64 = 1e-9;

/// One strategy's input to reallocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalSlot {
    pub strategy_id: String,
    pub base_weight: f64,
    pub active: bool,
    pub flexible: bool,
}

/// Capital weights in effect on a date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub date: NaiveDate,
    /// Weight per strategy id; sums to 1.0.
    pub weights: BTreeMap<String, f64>,
    /// Sum of the weights of active strategies.
    pub utilization: f64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<Warning>,
}

impl AllocationPlan {
    pub fn total(&self) -> f64 {
        self.weights.values().sum()
    }

    pub fn weight(&self, strategy_id: &str) -> f64 {
        self.weights.get(strategy_id).copied().unwrap_or(0.0)
    }

    /// Check the weight-conservation invariant.
    pub fn verify(&self) -> Result<()> {
        let total = self.total();
        let finite = self.weights.values().all(|w| w.is_finite() && *w >= 0.0);
        if finite && (total - 1.0).abs() <= WEIGHT_TOLERANCE {
            return Ok(());
        }
        let dump = serde_json::to_string_pretty(self)?;
        error!(
            "Allocation invariant violated on {}: total {:.12}\n{}",
            self.date, total, dump
        );
        Err(FactorError::AllocationInvariant {
            date: self.date,
            total,
            dump,
        })
    }
}

/// Reallocate capital for one date from per-strategy maps.
///
/// Every strategy in `base_weights` must have an activity and a flexibility
/// flag.
pub fn reallocate(
    date: NaiveDate,
    base_weights: &BTreeMap<String, f64>,
    activity: &BTreeMap<String, bool>,
    flexibility: &BTreeMap<String, bool>,
) -> Result<AllocationPlan> {
    let mut slots = Vec::with_capacity(base_weights.len());
    for (id, weight) in base_weights {
        let active = *activity
            .get(id)
            .ok_or_else(|| FactorError::Data(format!("no activity flag for strategy {}", id)))?;
        let flexible = *flexibility
            .get(id)
            .ok_or_else(|| FactorError::Data(format!("no flexibility flag for strategy {}", id)))?;
        slots.push(CapitalSlot {
            strategy_id: id.clone(),
            base_weight: *weight,
            active,
            flexible,
        });
    }
    reallocate_slots(date, &slots)
}

/// Reallocate capital for one date. Slots are processed in id order.
pub fn reallocate_slots(date: NaiveDate, slots: &[CapitalSlot]) -> Result<AllocationPlan> {
    let mut ordered: Vec<&CapitalSlot> = slots.iter().collect();
    ordered.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));

    let mut weights: BTreeMap<String, f64> = ordered
        .iter()
        .map(|s| (s.strategy_id.clone(), s.base_weight))
        .collect();
    let mut warnings = Vec::new();

    let inactive_flexible: f64 = ordered
        .iter()
        .filter(|s| s.flexible && !s.active)
        .map(|s| s.base_weight)
        .sum();
    let active_flexible: f64 = ordered
        .iter()
        .filter(|s| s.flexible && s.active)
        .map(|s| s.base_weight)
        .sum();

    if inactive_flexible > 0.0 {
        if active_flexible > 0.0 {
            let scale = 1.0 + inactive_flexible / active_flexible;
            for slot in ordered.iter().filter(|s| s.flexible) {
                let w = if slot.active { slot.base_weight * scale } else { 0.0 };
                weights.insert(slot.strategy_id.clone(), w);
            }
            debug!(
                "{}: redistributed {:.4} across active flexible strategies (x{:.4})",
                date, inactive_flexible, scale
            );
        } else {
            let fixed: Vec<&&CapitalSlot> = ordered.iter().filter(|s| !s.flexible).collect();
            let fallback = if fixed.is_empty() {
                "no fixed strategy, held as idle cash".to_string()
            } else {
                let share = inactive_flexible / fixed.len() as f64;
                for slot in ordered.iter().filter(|s| s.flexible) {
                    weights.insert(slot.strategy_id.clone(), 0.0);
                }
                for slot in &fixed {
                    weights.insert(slot.strategy_id.clone(), slot.base_weight + share);
                }
                format!("split equally among {} fixed strategies", fixed.len())
            };
            let w = Warning::RedistributionUndefined {
                date,
                freed: inactive_flexible,
                fallback,
            };
            warn!("{}", w);
            warnings.push(w);
        }
    }

    let utilization: f64 = ordered
        .iter()
        .filter(|s| s.active)
        .map(|s| weights.get(&s.strategy_id).copied().unwrap_or(0.0))
        .sum();
    if utilization < 1.0 - WEIGHT_TOLERANCE {
        let w = Warning::LowUtilization { date, utilization };
        warn!("{}", w);
        warnings.push(w);
    }

    let plan = AllocationPlan {
        date,
        weights,
        utilization,
        warnings,
    };
    plan.verify()?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn slot(id: &str, w: f64, active: bool, flexible: bool) -> CapitalSlot {
        CapitalSlot {
            strategy_id: id.to_string(),
            base_weight: w,
            active,
            flexible,
        }
    }

    #[test]
    fn test_inactive_flexible_weight_moves_to_active_flexible() {
        let plan = reallocate_slots(
            date(),
            &[
                slot("A", 0.30, true, true),
                slot("B", 0.10, false, true),
                slot("F", 0.60, true, false),
            ],
        )
        .unwrap();
        assert!((plan.weight("A") - 0.40).abs() < 1e-12);
        assert_eq!(plan.weight("B"), 0.0);
        assert!((plan.weight("F") - 0.60).abs() < 1e-12);
        assert!((plan.total() - 1.0).abs() < 1e-12);
        assert!((plan.utilization - 1.0).abs() < 1e-12);
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn test_all_active_keeps_base_weights() {
        let plan = reallocate_slots(
            date(),
            &[slot("A", 0.5, true, true), slot("B", 0.5, true, true)],
        )
        .unwrap();
        assert_eq!(plan.weight("A"), 0.5);
        assert_eq!(plan.weight("B"), 0.5);
    }

    #[test]
    fn test_all_flexible_inactive_falls_back_to_fixed() {
        let plan = reallocate_slots(
            date(),
            &[
                slot("A", 0.2, false, true),
                slot("B", 0.2, false, true),
                slot("F1", 0.3, true, false),
                slot("F2", 0.3, false, false),
            ],
        )
        .unwrap();
        assert!((plan.weight("F1") - 0.5).abs() < 1e-12);
        assert!((plan.weight("F2") - 0.5).abs() < 1e-12);
        assert_eq!(plan.weight("A"), 0.0);
        assert!((plan.utilization - 0.5).abs() < 1e-12);
        assert!(plan
            .warnings
            .iter()
            .any(|w| matches!(w, Warning::RedistributionUndefined { .. })));
        assert!(plan
            .warnings
            .iter()
            .any(|w| matches!(w, Warning::LowUtilization { .. })));
    }

    #[test]
    fn test_no_fixed_strategies_hold_idle_cash() {
        let plan = reallocate_slots(
            date(),
            &[slot("A", 0.5, false, true), slot("B", 0.5, false, true)],
        )
        .unwrap();
        assert_eq!(plan.weight("A"), 0.5);
        assert_eq!(plan.utilization, 0.0);
        assert_eq!(plan.warnings.len(), 2);
    }

    #[test]
    fn test_invariant_violation_is_fatal_with_dump() {
        let err = reallocate_slots(
            date(),
            &[slot("A", 0.5, true, true), slot("B", 0.3, true, false)],
        )
        .unwrap_err();
        match err {
            FactorError::AllocationInvariant { total, dump, .. } => {
                assert!((total - 0.8).abs() < 1e-12);
                assert!(dump.contains("\"A\""));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_reallocate_requires_flags() {
        let base: BTreeMap<String, f64> = [("A".to_string(), 1.0)].into();
        let flags: BTreeMap<String, bool> = BTreeMap::new();
        assert!(reallocate(date(), &base, &flags, &flags).is_err());

        let active: BTreeMap<String, bool> = [("A".to_string(), true)].into();
        let plan = reallocate(date(), &base, &active, &active).unwrap();
        assert_eq!(plan.weight("A"), 1.0);
    }
}
