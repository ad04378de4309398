//! Leakage-free feature tables for horse racing prediction.
//!
//! Stored race results are joined as of each race date with the history of
//! every horse and jockey involved, encoded, and assembled into `(X, y)`.

pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod features;
pub mod model;
pub mod storage;
pub mod types;

pub use config::AppConfig;
pub use dataset::{Dataset, DatasetAssembler, RaceCardTable, RaceTable, ResultsTable, Target};
pub use error::{FeatureError, Result};
pub use storage::{MemoryStore, RaceRepository, RecordStore, ResultFilter};
pub use types::{Entity, Pedigree, RaceRecord};
