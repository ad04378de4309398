//! Lookback windows and the aggregator that averages history over them.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

use crate::error::{FeatureError, Result};
use crate::features::history::{HistoryColumn, HistoryRecord};

/// Number of most-recent prior races a block is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    All,
    Count(NonZeroUsize),
}

impl Window {
    /// Window over the last `n` races. Fails for `n <= 0`.
    pub fn count(n: i64) -> Result<Self> {
        usize::try_from(n)
            .ok()
            .and_then(NonZeroUsize::new)
            .map(Window::Count)
            .ok_or_else(|| FeatureError::invalid_argument(format!("window must be > 0, got {}", n)))
    }

    /// Window over the last `n` races for literal sizes.
    ///
    /// Panics if `n` is zero.
    pub fn count_of(n: usize) -> Self {
        Window::Count(NonZeroUsize::new(n).expect("window size must be non-zero"))
    }

    /// Column suffix: "5R" or "allR"
    pub fn suffix(&self) -> String {
        match self {
            Window::All => "allR".to_string(),
            Window::Count(n) => format!("{}R", n),
        }
    }

    /// The part of a most-recent-first history this window covers.
    pub fn select<'a>(&self, history: &'a [HistoryRecord]) -> &'a [HistoryRecord] {
        match self {
            Window::All => history,
            Window::Count(n) => &history[..n.get().min(history.len())],
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Window::All => f.write_str("all"),
            Window::Count(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for Window {
    type Err = FeatureError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(Window::All);
        }
        match s.parse::<i64>() {
            Ok(n) => Window::count(n),
            Err(_) => Err(FeatureError::invalid_argument(format!(
                "window must be 'all' or a positive integer, got '{}'",
                s
            ))),
        }
    }
}

impl Serialize for Window {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Window {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Int(i64),
            Text(String),
        }

        let window = match Repr::deserialize(deserializer)? {
            Repr::Int(n) => Window::count(n),
            Repr::Text(s) => s.parse(),
        };
        window.map_err(serde::de::Error::custom)
    }
}

/// Named feature values in schema order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureBlock {
    entries: Vec<(String, f64)>,
}

impl FeatureBlock {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.entries.iter().map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_all_nan(&self) -> bool {
        self.entries.iter().all(|(_, v)| v.is_nan())
    }

    fn push(&mut self, name: String, value: f64) {
        self.entries.push((name, value));
    }
}

/// Names produced by `aggregate` for a window and column set.
pub fn aggregate_names(window: Window, columns: &[HistoryColumn]) -> Vec<String> {
    let suffix = window.suffix();
    columns
        .iter()
        .map(|c| format!("{}_{}", c.name(), suffix))
        .collect()
}

/// Names produced by `nth_most_recent` for position `k`.
pub fn positional_names(k: usize, columns: &[HistoryColumn]) -> Vec<String> {
    columns.iter().map(|c| format!("p{}_{}", k, c.name())).collect()
}

/// Mean of each column over the window's most recent records.
///
/// Missing values are skipped; a column without any value is NaN. A history
/// shorter than the window is averaged over what exists.
pub fn aggregate(history: &[HistoryRecord], window: Window, columns: &[HistoryColumn]) -> FeatureBlock {
    let selected = window.select(history);
    let mut block = FeatureBlock::default();

    for (column, name) in columns.iter().zip(aggregate_names(window, columns)) {
        let (sum, n) = selected
            .iter()
            .filter_map(|r| r.value(*column))
            .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
        let mean = if n > 0 { sum / n as f64 } else { f64::NAN };
        block.push(name, mean);
    }

    block
}

/// Literal column values of the k-th most recent record (1-based).
pub fn nth_most_recent(history: &[HistoryRecord], k: usize, columns: &[HistoryColumn]) -> Result<FeatureBlock> {
    if k == 0 {
        return Err(FeatureError::invalid_argument("position must be >= 1"));
    }

    let record = history.get(k - 1);
    let mut block = FeatureBlock::default();
    for (column, name) in columns.iter().zip(positional_names(k, columns)) {
        let value = record.and_then(|r| r.value(*column)).unwrap_or(f64::NAN);
        block.push(name, value);
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::date;

    /// Five races, most recent first, arriving_order 1..=5 and distance 1000..=5000
    fn history() -> Vec<HistoryRecord> {
        (1..=5)
            .map(|i| {
                HistoryRecord::new(&format!("r{}", i), date(2024, 6 - i as u32, 1), "h1")
                    .with(HistoryColumn::ArrivingOrder, i as f64)
                    .with(HistoryColumn::Distance, 1000.0 * i as f64)
            })
            .collect()
    }

    const COLS: [HistoryColumn; 2] = [HistoryColumn::ArrivingOrder, HistoryColumn::Distance];

    #[test]
    fn test_window_of_three() {
        let block = aggregate(&history(), Window::count_of(3), &COLS);
        assert_eq!(block.get("arriving_order_3R"), Some(2.0));
        assert_eq!(block.get("distance_3R"), Some(2000.0));
    }

    #[test]
    fn test_window_all() {
        let block = aggregate(&history(), Window::All, &COLS);
        assert_eq!(block.get("arriving_order_allR"), Some(3.0));
        assert_eq!(block.get("distance_allR"), Some(3000.0));
    }

    #[test]
    fn test_short_history() {
        let h = history();
        let block = aggregate(&h[..2], Window::count_of(5), &COLS);
        assert_eq!(block.get("arriving_order_5R"), Some(1.5));
    }

    #[test]
    fn test_empty_history_is_nan() {
        let block = aggregate(&[], Window::count_of(3), &COLS);
        assert_eq!(block.len(), 2);
        assert!(block.is_all_nan());
    }

    #[test]
    fn test_missing_values_skipped() {
        let mut h = history();
        h[0] = HistoryRecord::new("r1", date(2024, 5, 1), "h1").with(HistoryColumn::Distance, 1000.0);
        let block = aggregate(&h, Window::count_of(2), &COLS);
        assert_eq!(block.get("arriving_order_2R"), Some(2.0));
        assert_eq!(block.get("distance_2R"), Some(1500.0));
    }

    #[test]
    fn test_invalid_window() {
        assert!(Window::count(-1).unwrap_err().is_invalid_argument());
        assert!(Window::count(0).unwrap_err().is_invalid_argument());
        assert!("abc".parse::<Window>().unwrap_err().is_invalid_argument());
        assert!("0".parse::<Window>().is_err());
        assert_eq!("all".parse::<Window>().unwrap(), Window::All);
        assert_eq!("9".parse::<Window>().unwrap(), Window::count_of(9));
    }

    #[test]
    fn test_nth_most_recent() {
        let h = history();
        let block = nth_most_recent(&h, 2, &COLS).unwrap();
        assert_eq!(block.get("p2_arriving_order"), Some(2.0));
        assert_eq!(block.get("p2_distance"), Some(2000.0));

        let block = nth_most_recent(&h[..1], 3, &COLS).unwrap();
        assert!(block.is_all_nan());
        assert_eq!(block.names().collect::<Vec<_>>(), vec!["p3_arriving_order", "p3_distance"]);

        assert!(nth_most_recent(&h, 0, &COLS).is_err());
    }

    #[test]
    fn test_window_serde() {
        let windows: Vec<Window> = serde_json::from_str(r#"[5, "9", "all"]"#).unwrap();
        assert_eq!(windows, vec![Window::count_of(5), Window::count_of(9), Window::All]);
        assert_eq!(serde_json::to_string(&windows).unwrap(), r#"["5","9","all"]"#);
        assert!(serde_json::from_str::<Window>("-3").is_err());
    }
}
