//! Point-in-time feature construction.
//!
//! - `history`: per-entity race histories queried as of a date
//! - `window`: lookback windows, averaged and positional blocks
//! - `join`: per-date as-of join onto runner rows
//! - `encoder`: id and fixed-vocabulary categorical encoders

pub mod encoder;
pub mod history;
pub mod join;
pub mod window;

pub use encoder::{CategoricalField, CategoryEncoder, Encoders, IdEncoder, UnknownCategoryPolicy};
pub use history::{HistoryColumn, HistoryRecord, TemporalIndex, TimeDiffPolicy};
pub use join::{AsOfJoin, JoinOutput, JoinedRow, RunnerRow, SkippedDate};
pub use window::{aggregate, nth_most_recent, FeatureBlock, Window};
