//! Market regime detection from a reference entity's moving averages.
//!
//! The regime on a date is `bull` when the short simple moving average of the
//! reference close is above the long one and `bear` otherwise. Confidence is
//! `high` when the averages are more than `confidence_threshold` apart,
//! relative to the long average.
//!
//! Detection fails safe: with fewer than `long_window` contiguous periods of
//! history, or when none of the reference aliases is present in the
//! universe, the regime is `undetermined` and regime-filtered strategies stay
//! flat.
//!
//! # Example
//!
//! ```ignore
//! use crossfactor::regime::{RegimeConfig, RegimeDetector};
//!
//! let detector = RegimeDetector::new(RegimeConfig::default());
//! let state = detector.detect(&panel.as_of(t));
//! println!("{}: {} ({})", state.date, state.regime, state.confidence);
//! ```

use crate::data::{Panel, PanelView};
use crate::error::Warning;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Canonical reference-entity aliases, tried in order.
pub const DEFAULT_REFERENCE_ALIASES: [&str; 5] = ["bitcoin", "BTC", "BTC-USD", "BTCUSDT", "XBT"];

/// Coarse market state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Bull,
    Bear,
    Undetermined,
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Regime::Bull => write!(f, "bull"),
            Regime::Bear => write!(f, "bear"),
            Regime::Undetermined => write!(f, "undetermined"),
        }
    }
}

/// How far apart the moving averages are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Low,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::High => write!(f, "high"),
            Confidence::Low => write!(f, "low"),
        }
    }
}

/// Regime classification for one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeState {
    pub date: NaiveDate,
    /// Resolved reference symbol, if any alias matched.
    pub reference: Option<String>,
    pub regime: Regime,
    pub confidence: Confidence,
    pub short_ma: Option<f64>,
    pub long_ma: Option<f64>,
}

impl RegimeState {
    fn undetermined(date: NaiveDate, reference: Option<String>) -> Self {
        Self {
            date,
            reference,
            regime: Regime::Undetermined,
            confidence: Confidence::Low,
            short_ma: None,
            long_ma: None,
        }
    }

    /// Relative spread of the averages, `(short - long) / long`.
    pub fn spread(&self) -> Option<f64> {
        match (self.short_ma, self.long_ma) {
            (Some(s), Some(l)) if l != 0.0 => Some((s - l) / l),
            _ => None,
        }
    }
}

/// Strategy activation rule based on the regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegimeFilter {
    #[default]
    None,
    BullOnly,
    BearOnly,
}

impl RegimeFilter {
    /// Parse a configuration value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" => Some(RegimeFilter::None),
            "bull_only" | "bull-only" => Some(RegimeFilter::BullOnly),
            "bear_only" | "bear-only" => Some(RegimeFilter::BearOnly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeFilter::None => "none",
            RegimeFilter::BullOnly => "bull_only",
            RegimeFilter::BearOnly => "bear_only",
        }
    }

    /// Whether a strategy may hold positions under `regime`.
    ///
    /// An undetermined regime never activates a filtered strategy.
    pub fn allows(&self, regime: Regime) -> bool {
        match self {
            RegimeFilter::None => true,
            RegimeFilter::BullOnly => regime == Regime::Bull,
            RegimeFilter::BearOnly => regime == Regime::Bear,
        }
    }
}

/// Configuration for regime detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeConfig {
    pub short_window: usize,
    pub long_window: usize,
    /// Relative MA spread above which confidence is high.
    pub confidence_threshold: f64,
    /// Reference-entity aliases, tried in order.
    pub aliases: Vec<String>,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            short_window: 50,
            long_window: 200,
            confidence_threshold: 0.05,
            aliases: DEFAULT_REFERENCE_ALIASES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Pure classification of a reference close series (oldest first).
///
/// Returns `None` when the series is shorter than `long_window`.
pub fn classify(
    closes: &[f64],
    short_window: usize,
    long_window: usize,
    confidence_threshold: f64,
) -> Option<(Regime, Confidence, f64, f64)> {
    if short_window == 0 || long_window == 0 || closes.len() < long_window.max(short_window) {
        return None;
    }
    let short_ma = mean(&closes[closes.len() - short_window..]);
    let long_ma = mean(&closes[closes.len() - long_window..]);
    if !short_ma.is_finite() || !long_ma.is_finite() || long_ma == 0.0 {
        return None;
    }

    let regime = if short_ma > long_ma {
        Regime::Bull
    } else {
        Regime::Bear
    };
    let confidence = if ((short_ma - long_ma) / long_ma).abs() > confidence_threshold {
        Confidence::High
    } else {
        Confidence::Low
    };
    Some((regime, confidence, short_ma, long_ma))
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Regime detector over a panel.
#[derive(Debug, Clone)]
pub struct RegimeDetector {
    config: RegimeConfig,
}

impl RegimeDetector {
    /// Create a new regime detector.
    pub fn new(config: RegimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RegimeConfig {
        &self.config
    }

    /// First alias, in configured order, with a full long window of valid
    /// closes in the view.
    pub fn resolve_reference(&self, view: &PanelView<'_>) -> Option<(String, Vec<f64>)> {
        self.config.aliases.iter().find_map(|alias| {
            view.closes(alias, self.config.long_window)
                .map(|closes| (alias.clone(), closes))
        })
    }

    /// Classify the view date using only history visible in the view.
    pub fn detect(&self, view: &PanelView<'_>) -> RegimeState {
        let date = view.date();
        let Some((reference, closes)) = self.resolve_reference(view) else {
            // Undetermined carries the first alias visible so far, if any.
            let seen = self.config.aliases.iter().find(|a| view.contains(a)).cloned();
            return RegimeState::undetermined(date, seen);
        };

        match classify(
            &closes,
            self.config.short_window,
            self.config.long_window,
            self.config.confidence_threshold,
        ) {
            Some((regime, confidence, short_ma, long_ma)) => RegimeState {
                date,
                reference: Some(reference),
                regime,
                confidence,
                short_ma: Some(short_ma),
                long_ma: Some(long_ma),
            },
            None => RegimeState::undetermined(date, Some(reference)),
        }
    }

    /// Classify every date of the panel. Each entry only sees its own past.
    pub fn detect_series(&self, panel: &Panel) -> RegimeSeries {
        let states: Vec<RegimeState> = (0..panel.len())
            .map(|t| self.detect(&panel.as_of(t)))
            .collect();
        let determined = states
            .iter()
            .filter(|s| s.regime != Regime::Undetermined)
            .count();
        debug!(
            "Regime series: {} of {} dates determined",
            determined,
            states.len()
        );
        RegimeSeries { states }
    }
}

/// Regime states aligned with a panel's trading-date index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegimeSeries {
    states: Vec<RegimeState>,
}

impl RegimeSeries {
    pub fn from_states(states: Vec<RegimeState>) -> Self {
        Self { states }
    }

    pub fn at(&self, idx: usize) -> Option<&RegimeState> {
        self.states.get(idx)
    }

    /// Regime at a date index; out-of-range indices are undetermined.
    pub fn regime_at(&self, idx: usize) -> Regime {
        self.at(idx).map_or(Regime::Undetermined, |s| s.regime)
    }

    pub fn states(&self) -> &[RegimeState] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Warning for an undetermined date, naming the cause.
    pub fn undetermined_warning(&self, idx: usize) -> Option<Warning> {
        let state = self.at(idx)?;
        if state.regime != Regime::Undetermined {
            return None;
        }
        let reason = match &state.reference {
            None => "reference entity not found under any alias".to_string(),
            Some(r) => format!("insufficient contiguous history for {}", r),
        };
        Some(Warning::RegimeUndetermined {
            date: state.date,
            reason,
        })
    }
}

/// A change of regime between consecutive dates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeChange {
    pub index: usize,
    pub date: NaiveDate,
    pub from: Regime,
    pub to: Regime,
}

/// Detect regime changes in a sequence of states.
pub fn detect_regime_changes(states: &[RegimeState]) -> Vec<RegimeChange> {
    states
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[0].regime != w[1].regime)
        .map(|(i, w)| RegimeChange {
            index: i + 1,
            date: w[1].date,
            from: w[0].regime,
            to: w[1].regime,
        })
        .collect()
}

/// Regime occupancy statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeStats {
    /// Number of dates in each regime.
    pub regime_counts: BTreeMap<Regime, usize>,
    /// Mean run length of each regime.
    pub avg_durations: BTreeMap<Regime, f64>,
    /// Percentage of dates in each regime.
    pub regime_percentages: BTreeMap<Regime, f64>,
    pub num_changes: usize,
}

impl RegimeStats {
    /// Calculate statistics from regime states.
    pub fn from_states(states: &[RegimeState]) -> Self {
        let mut regime_counts: BTreeMap<Regime, usize> = BTreeMap::new();
        let mut runs: BTreeMap<Regime, Vec<usize>> = BTreeMap::new();

        let mut current: Option<(Regime, usize)> = None;
        for state in states {
            *regime_counts.entry(state.regime).or_insert(0) += 1;
            current = match current {
                Some((r, len)) if r == state.regime => Some((r, len + 1)),
                Some((r, len)) => {
                    runs.entry(r).or_default().push(len);
                    Some((state.regime, 1))
                }
                None => Some((state.regime, 1)),
            };
        }
        if let Some((r, len)) = current {
            runs.entry(r).or_default().push(len);
        }

        let total = states.len().max(1) as f64;
        let regime_percentages = regime_counts
            .iter()
            .map(|(r, c)| (*r, *c as f64 / total * 100.0))
            .collect();
        let avg_durations = runs
            .iter()
            .map(|(r, v)| (*r, v.iter().sum::<usize>() as f64 / v.len() as f64))
            .collect();

        Self {
            regime_counts,
            avg_durations,
            regime_percentages,
            num_changes: detect_regime_changes(states).len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Observation;

    fn reference_panel(symbol: &str, closes: &[f64]) -> Panel {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let obs = closes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                Observation::new(symbol, start + chrono::Duration::days(i as i64), *c, 1e6, 1e9)
            })
            .collect();
        Panel::from_observations(obs).unwrap()
    }

    #[test]
    fn test_classify_strong_uptrend_is_high_confidence_bull() {
        // Flat for 150 periods then a jump: short MA well above long MA.
        let mut closes = vec![100.0; 150];
        closes.extend(vec![150.0; 50]);
        let (regime, confidence, short_ma, long_ma) = classify(&closes, 50, 200, 0.05).unwrap();
        assert_eq!(regime, Regime::Bull);
        assert_eq!(confidence, Confidence::High);
        assert!((short_ma - 150.0).abs() < 1e-9);
        assert!((long_ma - 112.5).abs() < 1e-9);
    }

    #[test]
    fn test_classify_small_spread_is_low_confidence() {
        let mut closes = vec![100.0; 150];
        closes.extend(vec![102.0; 50]);
        let (regime, confidence, _, _) = classify(&closes, 50, 200, 0.05).unwrap();
        assert_eq!(regime, Regime::Bull);
        assert_eq!(confidence, Confidence::Low);
    }

    #[test]
    fn test_classify_equal_averages_is_bear() {
        let closes = vec![100.0; 200];
        let (regime, _, _, _) = classify(&closes, 50, 200, 0.05).unwrap();
        assert_eq!(regime, Regime::Bear);
    }

    #[test]
    fn test_classify_insufficient_history() {
        let closes = vec![100.0; 199];
        assert!(classify(&closes, 50, 200, 0.05).is_none());
    }

    #[test]
    fn test_detect_resolves_alias() {
        let mut closes = vec![100.0; 150];
        closes.extend(vec![80.0; 60]);
        let panel = reference_panel("BTC-USD", &closes);
        let detector = RegimeDetector::new(RegimeConfig::default());

        let state = detector.detect(&panel.as_of(panel.len() - 1));
        assert_eq!(state.reference.as_deref(), Some("BTC-USD"));
        assert_eq!(state.regime, Regime::Bear);
        assert_eq!(state.confidence, Confidence::High);
    }

    fn short_config() -> RegimeConfig {
        RegimeConfig {
            short_window: 3,
            long_window: 6,
            ..Default::default()
        }
    }

    #[test]
    fn test_future_row_under_earlier_alias_leaves_past_unchanged() {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let rising: Vec<Observation> = (0..40)
            .map(|i| {
                let close = 100.0 * 1.05f64.powi(i);
                Observation::new("BTC", start + chrono::Duration::days(i as i64), close, 1e6, 1e9)
            })
            .collect();
        let detector = RegimeDetector::new(short_config());

        let clean = Panel::from_observations(rising.clone()).unwrap();
        let mut with_future = rising;
        with_future.push(Observation::new(
            "bitcoin",
            start + chrono::Duration::days(39),
            1.0,
            1e6,
            1e9,
        ));
        let dirty = Panel::from_observations(with_future).unwrap();

        let before = detector.detect(&clean.as_of(30));
        let after = detector.detect(&dirty.as_of(30));
        assert_eq!(before.regime, Regime::Bull);
        assert_eq!(after, before);
        assert_eq!(after.reference.as_deref(), Some("BTC"));
    }

    #[test]
    fn test_alias_with_short_history_falls_through() {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let mut obs: Vec<Observation> = (0..20)
            .map(|i| {
                let close = 100.0 * 1.05f64.powi(i);
                Observation::new("BTC", start + chrono::Duration::days(i as i64), close, 1e6, 1e9)
            })
            .collect();
        for i in 17..20 {
            obs.push(Observation::new("bitcoin", start + chrono::Duration::days(i), 50.0, 1e6, 1e9));
        }
        let panel = Panel::from_observations(obs).unwrap();
        let detector = RegimeDetector::new(short_config());

        let state = detector.detect(&panel.as_of(19));
        assert_eq!(state.reference.as_deref(), Some("BTC"));
        assert_eq!(state.regime, Regime::Bull);

        // Neither alias has a full window yet; the first visible one is named.
        let early = detector.detect(&panel.as_of(3));
        assert_eq!(early.regime, Regime::Undetermined);
        assert_eq!(early.reference.as_deref(), Some("BTC"));
    }

    #[test]
    fn test_view_contains_is_causal() {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let panel = Panel::from_observations(vec![
            Observation::new("A", start, 1.0, 1.0, 1.0),
            Observation::new("A", start + chrono::Duration::days(1), 1.0, 1.0, 1.0),
            Observation::new("B", start + chrono::Duration::days(1), 1.0, 1.0, 1.0),
        ])
        .unwrap();
        assert!(panel.as_of(0).contains("A"));
        assert!(!panel.as_of(0).contains("B"));
        assert!(panel.as_of(1).contains("B"));
    }

    #[test]
    fn test_detect_undetermined_before_long_window() {
        let panel = reference_panel("BTC", &vec![100.0; 250]);
        let detector = RegimeDetector::new(RegimeConfig::default());
        let series = detector.detect_series(&panel);

        assert_eq!(series.regime_at(198), Regime::Undetermined);
        assert_ne!(series.regime_at(199), Regime::Undetermined);
        assert!(series.undetermined_warning(10).is_some());
        assert!(series.undetermined_warning(220).is_none());
    }

    #[test]
    fn test_detect_missing_reference_is_undetermined() {
        let panel = reference_panel("SOL", &vec![100.0; 250]);
        let detector = RegimeDetector::new(RegimeConfig::default());
        let state = detector.detect(&panel.as_of(249));
        assert_eq!(state.regime, Regime::Undetermined);
        assert!(state.reference.is_none());
    }

    #[test]
    fn test_filter_never_activates_on_undetermined() {
        assert!(RegimeFilter::None.allows(Regime::Undetermined));
        assert!(!RegimeFilter::BullOnly.allows(Regime::Undetermined));
        assert!(!RegimeFilter::BearOnly.allows(Regime::Undetermined));
        assert!(RegimeFilter::BullOnly.allows(Regime::Bull));
        assert!(!RegimeFilter::BullOnly.allows(Regime::Bear));
        assert!(RegimeFilter::BearOnly.allows(Regime::Bear));
    }

    #[test]
    fn test_filter_parse() {
        assert_eq!(RegimeFilter::parse("bull_only"), Some(RegimeFilter::BullOnly));
        assert_eq!(RegimeFilter::parse("Bear-Only"), Some(RegimeFilter::BearOnly));
        assert_eq!(RegimeFilter::parse("sideways"), None);
    }

    fn state(day: i64, regime: Regime) -> RegimeState {
        RegimeState {
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(day),
            reference: Some("BTC".to_string()),
            regime,
            confidence: Confidence::Low,
            short_ma: None,
            long_ma: None,
        }
    }

    #[test]
    fn test_detect_regime_changes() {
        let states = vec![
            state(0, Regime::Undetermined),
            state(1, Regime::Bull),
            state(2, Regime::Bull),
            state(3, Regime::Bear),
        ];
        let changes = detect_regime_changes(&states);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].index, 3);
        assert_eq!(changes[1].from, Regime::Bull);
        assert_eq!(changes[1].to, Regime::Bear);
    }

    #[test]
    fn test_regime_stats() {
        let states = vec![
            state(0, Regime::Bull),
            state(1, Regime::Bull),
            state(2, Regime::Bear),
            state(3, Regime::Bull),
        ];
        let stats = RegimeStats::from_states(&states);
        assert_eq!(stats.regime_counts[&Regime::Bull], 3);
        assert!((stats.regime_percentages[&Regime::Bear] - 25.0).abs() < 1e-9);
        assert!((stats.avg_durations[&Regime::Bull] - 1.5).abs() < 1e-9);
        assert_eq!(stats.num_changes, 2);
    }
}
