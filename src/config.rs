//! Configuration for the feature pipeline.

use serde::{Deserialize, Serialize};

use crate::dataset::Target;
use crate::features::encoder::UnknownCategoryPolicy;
use crate::features::history::TimeDiffPolicy;
use crate::features::window::Window;

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/keiba.sqlite".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Lookback configuration for the as-of join
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Averaged blocks over each horse's prior races
    #[serde(default = "default_horse_windows")]
    pub horse_windows: Vec<Window>,
    /// Number of "last N races verbatim" blocks
    #[serde(default = "default_positional_depth")]
    pub positional_depth: usize,
    /// Averaged blocks over each jockey's prior rides
    #[serde(default)]
    pub jockey_windows: Vec<Window>,
    /// Trailing days for the jockey place rate (0 disables)
    #[serde(default = "default_jockey_trailing_days")]
    pub jockey_trailing_days: u32,
    /// Days since the horse's previous race
    #[serde(default = "default_true")]
    pub days_since_last: bool,
    /// Process race dates in parallel
    #[serde(default)]
    pub parallel: bool,
}

fn default_horse_windows() -> Vec<Window> {
    vec![Window::count_of(5), Window::count_of(9), Window::All]
}

fn default_positional_depth() -> usize {
    3
}

fn default_jockey_trailing_days() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            horse_windows: default_horse_windows(),
            positional_depth: default_positional_depth(),
            jockey_windows: Vec::new(),
            jockey_trailing_days: default_jockey_trailing_days(),
            days_since_last: true,
            parallel: false,
        }
    }
}

/// Per-record normalization applied before indexing history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeConfig {
    /// Divide finish order, popularity and corner positions by field size
    #[serde(default = "default_true")]
    pub relative_to_field: bool,
    /// Express finish time as seconds per 100m
    #[serde(default = "default_true")]
    pub time_per_100m: bool,
    #[serde(default)]
    pub time_diff: TimeDiffPolicy,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            relative_to_field: true,
            time_per_100m: true,
            time_diff: TimeDiffPolicy::default(),
        }
    }
}

/// Categorical encoding configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncodingConfig {
    /// What to do with a bounded category outside its vocabulary
    #[serde(default)]
    pub unknown_category: UnknownCategoryPolicy,
}

/// Dataset selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(default)]
    pub target: Target,
    #[serde(default)]
    pub drop_nan: bool,
    /// Exclude jump races
    #[serde(default = "default_true")]
    pub flat_only: bool,
    /// Fraction of races (latest first) held out by `split_by_date`
    #[serde(default = "default_test_size")]
    pub test_size: f64,
}

fn default_test_size() -> f64 {
    0.3
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            target: Target::default(),
            drop_nan: false,
            flat_only: true,
            test_size: default_test_size(),
        }
    }
}

/// Model configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    /// ONNX model scoring race-card features
    #[serde(default)]
    pub path: Option<String>,
    /// Saved encoders from the training build
    #[serde(default = "default_encoders_path")]
    pub encoders_path: String,
}

fn default_encoders_path() -> String {
    "data/models/encoders.json".to_string()
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub model: ModelConfig,
}

impl AppConfig {
    /// Load configuration from environment and config file
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // Add config file if exists
            .add_source(config::File::with_name("config").required(false))
            // Override with environment variables (KEIBA__DATABASE__PATH, etc.)
            .add_source(
                config::Environment::with_prefix("KEIBA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.features.horse_windows.len(), 3);
        assert_eq!(config.features.horse_windows[2], Window::All);
        assert_eq!(config.features.positional_depth, 3);
        assert_eq!(config.features.jockey_trailing_days, 30);
        assert!(config.normalize.relative_to_field);
        assert_eq!(config.encoding.unknown_category, UnknownCategoryPolicy::Reject);
        assert_eq!(config.dataset.target, Target::Binary);
    }

    #[test]
    fn test_deserialize_partial() {
        let json = r#"{
            "features": { "horse_windows": [3, "all"], "parallel": true },
            "normalize": { "time_diff": "clamp_all" },
            "encoding": { "unknown_category": "other" },
            "dataset": { "target": "regression", "drop_nan": true }
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.features.horse_windows,
            vec![Window::count_of(3), Window::All]
        );
        assert!(config.features.parallel);
        assert_eq!(config.features.positional_depth, 3);
        assert_eq!(config.normalize.time_diff, TimeDiffPolicy::ClampAll);
        assert_eq!(config.encoding.unknown_category, UnknownCategoryPolicy::Other);
        assert_eq!(config.dataset.target, Target::Regression);
        assert!(config.dataset.drop_nan);
        assert_eq!(config.database.path, "data/keiba.sqlite");
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("KEIBA__DATABASE__PATH", "/tmp/keiba_env_test.sqlite");
        let config = AppConfig::load();
        std::env::remove_var("KEIBA__DATABASE__PATH");
        assert_eq!(config.unwrap().database.path, "/tmp/keiba_env_test.sqlite");
    }

    #[test]
    fn test_invalid_window_rejected() {
        let json = r#"{ "features": { "horse_windows": [0] } }"#;
        assert!(serde_json::from_str::<AppConfig>(json).is_err());
    }
}
