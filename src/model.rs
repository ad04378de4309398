//! Scoring of assembled feature matrices.
//!
//! Training happens outside this crate; a trained model is exported to ONNX
//! and loaded here to score race-card datasets.

use anyhow::{Context, Result};
use ndarray::Array2;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;

use crate::dataset::Dataset;

/// Anything that turns a feature matrix into one score per row.
pub trait Predictor {
    fn predict(&self, x: &Array2<f64>) -> Result<Vec<f64>>;

    /// Number of input columns, when the model declares it
    fn n_features(&self) -> Option<usize> {
        None
    }
}

/// Score every row of a dataset, checking the column count first.
pub fn score(predictor: &dyn Predictor, dataset: &Dataset) -> Result<Vec<f64>> {
    if let Some(expected) = predictor.n_features() {
        if expected != dataset.n_features() {
            anyhow::bail!(
                "Model expects {} features, dataset has {}",
                expected,
                dataset.n_features()
            );
        }
    }
    let scores = predictor.predict(&dataset.x)?;
    if scores.len() != dataset.n_rows() {
        anyhow::bail!("Got {} scores for {} rows", scores.len(), dataset.n_rows());
    }
    Ok(scores)
}

/// ONNX model producing either a score column or class probabilities.
///
/// With two outputs (label, probabilities) the positive-class probability
/// is returned; otherwise the first output's first column.
pub struct OnnxPredictor {
    session: Mutex<Session>,
    n_features: Option<usize>,
}

impl OnnxPredictor {
    /// Load ONNX model from file.
    pub fn load<P: AsRef<Path>>(path: P, n_features: Option<usize>) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path.as_ref())
            .context("Failed to load ONNX model")?;

        Ok(Self {
            session: Mutex::new(session),
            n_features,
        })
    }
}

impl Predictor for OnnxPredictor {
    fn predict(&self, x: &Array2<f64>) -> Result<Vec<f64>> {
        let n_rows = x.nrows();
        let input_tensor = Tensor::from_array(x.mapv(|v| v as f32))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to lock session: {}", e))?;
        let outputs = session.run(ort::inputs![input_tensor])?;

        let output = if outputs.len() >= 2 { 1 } else { 0 };
        let (shape, data) = outputs[output]
            .try_extract_tensor::<f32>()
            .context("Failed to extract output tensor")?;

        let dims: Vec<i64> = shape.iter().copied().collect();
        let n_cols = match dims.as_slice() {
            [rows] if *rows as usize == n_rows => 1,
            [rows, cols] if *rows as usize == n_rows && *cols >= 1 => *cols as usize,
            _ => anyhow::bail!("Unexpected output shape: {:?} for {} rows", dims, n_rows),
        };

        // Positive class for probability outputs, the only column otherwise
        let col = if n_cols >= 2 { 1 } else { 0 };
        Ok((0..n_rows).map(|i| f64::from(data[i * n_cols + col])).collect())
    }

    fn n_features(&self) -> Option<usize> {
        self.n_features
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::RowKey;
    use chrono::NaiveDate;

    /// Sums each row
    struct RowSum;

    impl Predictor for RowSum {
        fn predict(&self, x: &Array2<f64>) -> Result<Vec<f64>> {
            Ok(x.rows().into_iter().map(|r| r.sum()).collect())
        }

        fn n_features(&self) -> Option<usize> {
            Some(2)
        }
    }

    fn dataset(n_features: usize) -> Dataset {
        let key = RowKey {
            race_id: "r1".to_string(),
            race_date: NaiveDate::from_ymd_opt(2024, 1, 7).unwrap(),
            horse_id: "h1".to_string(),
            horse_no: 1,
        };
        Dataset {
            columns: (0..n_features).map(|i| format!("f{}", i)).collect(),
            x: Array2::from_elem((2, n_features), 1.5),
            y: Vec::new(),
            keys: vec![key.clone(), key],
            target: None,
        }
    }

    #[test]
    fn test_score() {
        assert_eq!(score(&RowSum, &dataset(2)).unwrap(), vec![3.0, 3.0]);
    }

    #[test]
    fn test_score_rejects_width_mismatch() {
        assert!(score(&RowSum, &dataset(3)).is_err());
    }

    #[test]
    fn test_missing_model_file() {
        assert!(OnnxPredictor::load("does/not/exist.onnx", None).is_err());
    }
}
