//! Rebalance scheduling on the shared trading-date index.
//!
//! Rebalance dates are integer offsets from a strategy's epoch, its first
//! active date index, counted in trading dates rather than calendar days.

use serde::{Deserialize, Serialize};

/// Whether `date_idx` is a rebalance date for a strategy whose first active
/// index is `epoch` and which rebalances every `period` trading dates.
///
/// A zero period never rebalances.
pub fn is_rebalance_date(period: usize, date_idx: usize, epoch: usize) -> bool {
    period > 0 && date_idx >= epoch && (date_idx - epoch) % period == 0
}

/// Fixed-period schedule anchored at an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceSchedule {
    pub period: usize,
    pub epoch: usize,
}

impl RebalanceSchedule {
    pub fn new(period: usize, epoch: usize) -> Self {
        Self { period, epoch }
    }

    pub fn is_rebalance_date(&self, date_idx: usize) -> bool {
        is_rebalance_date(self.period, date_idx, self.epoch)
    }

    /// All rebalance indices strictly below `len`.
    pub fn dates(&self, len: usize) -> Vec<usize> {
        if self.period == 0 {
            return Vec::new();
        }
        (self.epoch..len).step_by(self.period).collect()
    }

    /// The next rebalance index at or after `date_idx`.
    pub fn next_on_or_after(&self, date_idx: usize) -> Option<usize> {
        if self.period == 0 {
            return None;
        }
        if date_idx <= self.epoch {
            return Some(self.epoch);
        }
        let offset = (date_idx - self.epoch).div_ceil(self.period);
        Some(self.epoch + offset * self.period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebalance_every_seven_from_epoch() {
        let schedule = RebalanceSchedule::new(7, 3);
        assert!(!schedule.is_rebalance_date(0));
        assert!(schedule.is_rebalance_date(3));
        assert!(!schedule.is_rebalance_date(9));
        assert!(schedule.is_rebalance_date(10));
        assert!(schedule.is_rebalance_date(17));
        assert_eq!(schedule.dates(20), vec![3, 10, 17]);
    }

    #[test]
    fn test_daily_period() {
        assert!(is_rebalance_date(1, 5, 0));
        assert!(is_rebalance_date(1, 5, 5));
        assert!(!is_rebalance_date(1, 4, 5));
    }

    #[test]
    fn test_zero_period_never_rebalances() {
        assert!(!is_rebalance_date(0, 5, 0));
        assert!(RebalanceSchedule::new(0, 0).dates(10).is_empty());
    }

    #[test]
    fn test_next_on_or_after() {
        let schedule = RebalanceSchedule::new(5, 2);
        assert_eq!(schedule.next_on_or_after(0), Some(2));
        assert_eq!(schedule.next_on_or_after(2), Some(2));
        assert_eq!(schedule.next_on_or_after(3), Some(7));
        assert_eq!(schedule.next_on_or_after(7), Some(7));
    }
}
