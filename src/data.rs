//! Tabular time-series store and data loading.
//!
//! A [`Panel`] holds every observation of a run, aligned on one shared
//! trading-date index. Decision code never reads the panel directly: it
//! receives a [`PanelView`] pinned to a date index, which cannot expose
//! observations dated after that index.
//!
//! Input files follow the schema `date,symbol,close,volume,market_cap`; any
//! further numeric columns are kept as auxiliary values on each observation.

use crate::error::{FactorError, Result};
use crate::types::Observation;
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info};

const REQUIRED_COLUMNS: [&str; 5] = ["date", "symbol", "close", "volume", "market_cap"];

/// Configuration for loading observation files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Date format string (e.g. "%Y-%m-%d"). Common formats are tried when absent.
    pub date_format: Option<String>,
    /// CSV delimiter. Auto-detected when absent.
    pub delimiter: Option<u8>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            date_format: None,
            delimiter: None,
        }
    }
}

/// Failure modes of an external observation provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("rate limited")]
    RateLimited,
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("fatal failure: {0}")]
    Fatal(String),
}

/// Contract with the data-acquisition collaborator.
///
/// Retry and backoff belong to the implementor; the backtester only consumes
/// data that was fetched successfully and never retries.
pub trait ObservationSource {
    /// Fetch the trailing `window` observations of an entity.
    fn fetch(&self, symbol: &str, window: usize) -> std::result::Result<Vec<Observation>, FetchError>;
}

/// Materialize a universe from a source, failing on the first fetch error.
pub fn materialize(
    source: &dyn ObservationSource,
    symbols: &[String],
    window: usize,
) -> Result<Panel> {
    let mut observations = Vec::new();
    for symbol in symbols {
        let fetched = source
            .fetch(symbol, window)
            .map_err(|e| FactorError::Data(format!("fetch of {} failed: {}", symbol, e)))?;
        observations.extend(fetched);
    }
    Panel::from_observations(observations)
}

/// In-memory store of observations aligned on a trading-date index.
#[derive(Debug, Clone, Default)]
pub struct Panel {
    dates: Vec<NaiveDate>,
    symbols: Vec<String>,
    /// One slot per trading date for every symbol.
    series: BTreeMap<String, Vec<Option<Observation>>>,
}

impl Panel {
    /// Build a panel from unordered observations.
    ///
    /// The trading-date index is the sorted union of all observation dates.
    /// Duplicate (symbol, date) rows are rejected.
    pub fn from_observations(observations: Vec<Observation>) -> Result<Self> {
        if observations.is_empty() {
            return Err(FactorError::NoData);
        }

        let dates: Vec<NaiveDate> = observations
            .iter()
            .map(|o| o.date)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let index: BTreeMap<NaiveDate, usize> =
            dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();

        let mut series: BTreeMap<String, Vec<Option<Observation>>> = BTreeMap::new();
        for obs in observations {
            let slots = series
                .entry(obs.symbol.clone())
                .or_insert_with(|| vec![None; dates.len()]);
            let idx = index[&obs.date];
            if slots[idx].is_some() {
                return Err(FactorError::Data(format!(
                    "duplicate observation for {} on {}",
                    obs.symbol, obs.date
                )));
            }
            slots[idx] = Some(obs);
        }

        let symbols: Vec<String> = series.keys().cloned().collect();
        debug!(
            "Built panel: {} symbols x {} dates",
            symbols.len(),
            dates.len()
        );

        Ok(Self {
            dates,
            symbols,
            series,
        })
    }

    /// Shared trading-date index.
    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    /// Symbols in lexical order.
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.series.contains_key(symbol)
    }

    /// Index of a trading date.
    pub fn index_of(&self, date: NaiveDate) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    /// First index on or after `date`.
    pub fn first_index_on_or_after(&self, date: NaiveDate) -> Option<usize> {
        let idx = self.dates.partition_point(|d| *d < date);
        (idx < self.dates.len()).then_some(idx)
    }

    /// Last index on or before `date`.
    pub fn last_index_on_or_before(&self, date: NaiveDate) -> Option<usize> {
        let idx = self.dates.partition_point(|d| *d <= date);
        idx.checked_sub(1)
    }

    /// Observation of a symbol at a date index.
    pub fn observation(&self, symbol: &str, idx: usize) -> Option<&Observation> {
        self.series.get(symbol)?.get(idx)?.as_ref()
    }

    /// Mutable access to an observation, for building scenarios.
    pub fn observation_mut(&mut self, symbol: &str, idx: usize) -> Option<&mut Observation> {
        self.series.get_mut(symbol)?.get_mut(idx)?.as_mut()
    }

    /// Causal view of the panel as of a date index.
    pub fn as_of(&self, idx: usize) -> PanelView<'_> {
        PanelView {
            panel: self,
            upto: idx.min(self.dates.len().saturating_sub(1)),
        }
    }

    /// Total number of stored observations.
    pub fn observation_count(&self) -> usize {
        self.series
            .values()
            .map(|s| s.iter().filter(|o| o.is_some()).count())
            .sum()
    }
}

/// Read-only view of a [`Panel`] that ends at a date index (inclusive).
#[derive(Debug, Clone, Copy)]
pub struct PanelView<'a> {
    panel: &'a Panel,
    upto: usize,
}

impl<'a> PanelView<'a> {
    /// Date index the view ends at.
    pub fn index(&self) -> usize {
        self.upto
    }

    /// Date the view ends at.
    pub fn date(&self) -> NaiveDate {
        self.panel.dates[self.upto]
    }

    /// Number of trading dates visible (`index + 1`).
    pub fn periods(&self) -> usize {
        self.upto + 1
    }

    pub fn symbols(&self) -> &'a [String] {
        &self.panel.symbols
    }

    /// Symbol has at least one observation on or before the view date.
    pub fn contains(&self, symbol: &str) -> bool {
        self.panel
            .series
            .get(symbol)
            .is_some_and(|slots| slots[..=self.upto].iter().any(Option::is_some))
    }

    /// Observation on the view date.
    pub fn current(&self, symbol: &str) -> Option<&'a Observation> {
        self.panel.observation(symbol, self.upto)
    }

    /// The trailing `window` observations ending at the view date.
    ///
    /// Returns `None` unless every one of the `window` periods is present.
    pub fn window(&self, symbol: &str, window: usize) -> Option<Vec<&'a Observation>> {
        if window == 0 || window > self.periods() {
            return None;
        }
        let slots = self.panel.series.get(symbol)?;
        let start = self.upto + 1 - window;
        slots[start..=self.upto].iter().map(|o| o.as_ref()).collect()
    }

    /// Trailing closes ending at the view date.
    pub fn closes(&self, symbol: &str, window: usize) -> Option<Vec<f64>> {
        let obs = self.window(symbol, window)?;
        if obs.iter().any(|o| !o.has_valid_price()) {
            return None;
        }
        Some(obs.iter().map(|o| o.close).collect())
    }
}

/// Simple return from date index `t` to `t + 1`.
///
/// Uses only the close at `t + 1` relative to the close at `t`. Returns
/// `None` when either price is missing or unusable.
pub fn forward_return(panel: &Panel, symbol: &str, t: usize) -> Option<f64> {
    let now = panel.observation(symbol, t)?;
    let next = panel.observation(symbol, t.checked_add(1)?)?;
    if !now.has_valid_price() || !next.has_valid_price() {
        return None;
    }
    Some(next.close / now.close - 1.0)
}

/// Detect the CSV delimiter from the first lines of the file.
///
/// Picks the candidate that yields the same column count (at least the five
/// required columns) on every sampled line.
fn detect_delimiter(path: &Path) -> Result<u8> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let lines: Vec<String> = reader.lines().take(5).filter_map(|l| l.ok()).collect();

    if lines.is_empty() {
        return Ok(b',');
    }

    let candidates = [b',', b'\t', b';', b'|'];
    let mut best = (b',', 0usize);
    for &delim in &candidates {
        let counts: Vec<usize> = lines
            .iter()
            .map(|line| line.as_bytes().iter().filter(|&&b| b == delim).count() + 1)
            .collect();
        let first = counts[0];
        if first >= REQUIRED_COLUMNS.len() && counts.iter().all(|&c| c == first) && first > best.1 {
            best = (delim, first);
        }
    }

    debug!("Detected delimiter {:?}", best.0 as char);
    Ok(best.0)
}

/// Parse a date with an explicit format or a list of common formats.
pub fn parse_date(s: &str, format: Option<&str>) -> Result<NaiveDate> {
    let s = s.trim();
    if let Some(fmt) = format {
        return Ok(NaiveDate::parse_from_str(s, fmt)?);
    }

    let formats = ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d", "%d-%m-%Y", "%d/%m/%Y", "%m/%d/%Y"];
    for fmt in &formats {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d);
        }
    }

    // Timestamps such as "2024-01-05 00:00:00" or "2024-01-05T00:00:00Z".
    if let Some(prefix) = s.get(..10) {
        if let Ok(d) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            return Ok(d);
        }
    }

    Err(FactorError::Data(format!("could not parse date: '{}'", s)))
}

fn column_index(headers: &StringRecord, name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(name))
}

fn parse_number(raw: &str) -> f64 {
    let raw = raw.trim();
    if raw.is_empty() {
        f64::NAN
    } else {
        raw.parse::<f64>().unwrap_or(f64::NAN)
    }
}

/// Load observations from a CSV file.
pub fn load_csv(path: impl AsRef<Path>, config: &DataConfig) -> Result<Vec<Observation>> {
    let path = path.as_ref();
    info!("Loading observations from: {}", path.display());

    let delimiter = match config.delimiter {
        Some(d) => d,
        None => detect_delimiter(path)?,
    };

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let mut required = [0usize; 5];
    for (slot, name) in required.iter_mut().zip(REQUIRED_COLUMNS.iter()) {
        *slot = column_index(&headers, name).ok_or_else(|| {
            FactorError::Data(format!("{}: missing required column '{}'", path.display(), name))
        })?;
    }
    let [date_col, symbol_col, close_col, volume_col, cap_col] = required;

    let aux_columns: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| !required.contains(i))
        .map(|(i, h)| (i, h.trim().to_string()))
        .collect();

    let mut observations = Vec::new();
    for (row_num, record) in reader.records().enumerate() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or("");

        let date = parse_date(field(date_col), config.date_format.as_deref()).map_err(|e| {
            FactorError::Data(format!("{} row {}: {}", path.display(), row_num + 2, e))
        })?;
        let symbol = field(symbol_col).trim().to_string();
        if symbol.is_empty() {
            return Err(FactorError::Data(format!(
                "{} row {}: empty symbol",
                path.display(),
                row_num + 2
            )));
        }

        let mut obs = Observation::new(
            symbol,
            date,
            parse_number(field(close_col)),
            parse_number(field(volume_col)),
            parse_number(field(cap_col)),
        );
        for (i, name) in &aux_columns {
            let value = parse_number(field(*i));
            if value.is_finite() {
                obs.aux.insert(name.clone(), value);
            }
        }
        observations.push(obs);
    }

    info!(
        "Loaded {} observations with {} auxiliary columns",
        observations.len(),
        aux_columns.len()
    );
    Ok(observations)
}

/// Load a CSV file straight into a [`Panel`].
pub fn load_panel(path: impl AsRef<Path>, config: &DataConfig) -> Result<Panel> {
    Panel::from_observations(load_csv(path, config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn sample_panel() -> Panel {
        let mut obs = Vec::new();
        for d in 1..=5 {
            obs.push(Observation::new("AAA", date(d), 100.0 + d as f64, 1e6, 1e9));
            if d != 3 {
                obs.push(Observation::new("BBB", date(d), 50.0, 2e6, 5e8));
            }
        }
        Panel::from_observations(obs).unwrap()
    }

    #[test]
    fn test_panel_alignment() {
        let panel = sample_panel();
        assert_eq!(panel.len(), 5);
        assert_eq!(panel.symbols(), &["AAA".to_string(), "BBB".to_string()]);
        assert!(panel.observation("BBB", 2).is_none());
        assert_eq!(panel.observation_count(), 9);
    }

    #[test]
    fn test_duplicate_rows_rejected() {
        let obs = vec![
            Observation::new("AAA", date(1), 1.0, 1.0, 1.0),
            Observation::new("AAA", date(1), 2.0, 1.0, 1.0),
        ];
        assert!(matches!(
            Panel::from_observations(obs),
            Err(FactorError::Data(_))
        ));
    }

    #[test]
    fn test_view_window_requires_contiguous_history() {
        let panel = sample_panel();
        let view = panel.as_of(4);
        assert_eq!(view.closes("AAA", 3), Some(vec![103.0, 104.0, 105.0]));
        assert!(view.window("BBB", 3).is_none());
        assert!(view.window("BBB", 2).is_some());
        assert!(view.window("AAA", 6).is_none());
    }

    #[test]
    fn test_view_never_exposes_later_dates() {
        let panel = sample_panel();
        let view = panel.as_of(1);
        assert_eq!(view.date(), date(2));
        assert_eq!(view.closes("AAA", 2), Some(vec![101.0, 102.0]));
        assert!(view.window("AAA", 3).is_none());
    }

    #[test]
    fn test_forward_return_uses_next_price() {
        let panel = sample_panel();
        let r = forward_return(&panel, "AAA", 0).unwrap();
        assert!((r - (102.0 / 101.0 - 1.0)).abs() < 1e-12);
        assert!(forward_return(&panel, "BBB", 1).is_none());
        assert!(forward_return(&panel, "AAA", 4).is_none());
    }

    #[test]
    fn test_index_lookups() {
        let panel = sample_panel();
        assert_eq!(panel.index_of(date(3)), Some(2));
        assert_eq!(panel.first_index_on_or_after(date(1)), Some(0));
        assert_eq!(panel.last_index_on_or_before(date(10)), Some(4));
        assert_eq!(panel.first_index_on_or_after(date(10)), None);
    }

    #[test]
    fn test_load_csv_with_aux_columns() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "date,symbol,close,volume,market_cap,funding_rate").unwrap();
        writeln!(file, "2024-01-01,BTC,42000,1000000,800000000000,0.0001").unwrap();
        writeln!(file, "2024-01-01,ETH,2300,500000,280000000000,").unwrap();
        writeln!(file, "2024-01-02,BTC,43000,1100000,820000000000,0.0002").unwrap();

        let obs = load_csv(file.path(), &DataConfig::default()).unwrap();
        assert_eq!(obs.len(), 3);
        assert_eq!(obs[0].aux_value("funding_rate"), Some(0.0001));
        assert_eq!(obs[1].aux_value("funding_rate"), None);

        let panel = Panel::from_observations(obs).unwrap();
        assert_eq!(panel.len(), 2);
    }

    #[test]
    fn test_load_csv_missing_column() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "date,symbol,close,volume").unwrap();
        writeln!(file, "2024-01-01,BTC,42000,1000000").unwrap();
        assert!(load_csv(file.path(), &DataConfig::default()).is_err());
    }

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(parse_date("2024-01-05", None).unwrap(), date(5));
        assert_eq!(parse_date("2024/01/05", None).unwrap(), date(5));
        assert_eq!(parse_date("2024-01-05 00:00:00", None).unwrap(), date(5));
        assert!(parse_date("not a date", None).is_err());
    }

    struct StaticSource;

    impl ObservationSource for StaticSource {
        fn fetch(
            &self,
            symbol: &str,
            _window: usize,
        ) -> std::result::Result<Vec<Observation>, FetchError> {
            match symbol {
                "AAA" => Ok(vec![Observation::new("AAA", date(1), 1.0, 1.0, 1.0)]),
                _ => Err(FetchError::RateLimited),
            }
        }
    }

    #[test]
    fn test_materialize_propagates_fetch_failure() {
        let ok = materialize(&StaticSource, &["AAA".to_string()], 10).unwrap();
        assert_eq!(ok.len(), 1);
        let err = materialize(&StaticSource, &["AAA".to_string(), "ZZZ".to_string()], 10);
        assert!(err.is_err());
    }
}
