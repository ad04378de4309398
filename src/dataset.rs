//! Dataset assembly: stored results -> as-of join -> encoding -> (X, y).
//!
//! Finalized results and upcoming race cards go through the same three steps
//! (`RaceTable`), but only results carry labels and only the training build
//! fits encoders. Race cards always reuse the encoders saved by training.

use chrono::NaiveDate;
use ndarray::{Array2, ArrayView1, Axis};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{FeatureError, Result};
use crate::features::encoder::Encoders;
use crate::features::history::TemporalIndex;
use crate::features::join::{AsOfJoin, JoinedRow, SkippedDate, BASE_COLUMNS};
use crate::storage::{RecordStore, ResultFilter};
use crate::types::{Entity, Pedigree, RaceRecord, PEDIGREE_COLUMNS};

/// Version of the feature column layout. Bump on any column change.
pub const FEATURE_SCHEMA_VERSION: u32 = 2;

/// Entities encoded as integer code columns
const ID_ENTITIES: [Entity; 3] = [Entity::Horse, Entity::Jockey, Entity::Trainer];

/// Id codes then ancestor codes, ahead of the one-hot blocks in each encoded row
const CODE_WIDTH: usize = ID_ENTITIES.len() + PEDIGREE_COLUMNS.len();

/// Row key columns, written ahead of the features on export
const KEY_COLUMNS: [&str; 4] = ["race_id", "race_date", "horse_id", "horse_no"];

/// Label definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// 0.0 for a finish in the first three, 1.0 otherwise
    #[default]
    Binary,
    /// 0 for 1st-3rd, 1 for 4th-8th, 2 otherwise
    MultiClass,
    /// Finish time in seconds
    Regression,
}

impl Target {
    pub fn name(&self) -> &'static str {
        match self {
            Target::Binary => "binary",
            Target::MultiClass => "multiclass",
            Target::Regression => "regression",
        }
    }

    /// Label for a joined row, None when the outcome is unknown.
    pub fn label(&self, row: &JoinedRow) -> Option<f64> {
        let position = row.runner.record.finish_position;
        match self {
            Target::Binary => position.map(|p| if p <= 3 { 0.0 } else { 1.0 }),
            Target::MultiClass => position.map(|p| match p {
                1..=3 => 0.0,
                4..=8 => 1.0,
                _ => 2.0,
            }),
            Target::Regression => position.and(row.runner.finish_seconds),
        }
    }
}

impl FromStr for Target {
    type Err = FeatureError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "binary" | "place" => Ok(Target::Binary),
            "multiclass" | "rank" => Ok(Target::MultiClass),
            "regression" | "time" => Ok(Target::Regression),
            other => Err(FeatureError::invalid_argument(format!(
                "unknown target '{}' (expected binary, multiclass or regression)",
                other
            ))),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies the runner behind a dataset row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowKey {
    pub race_id: String,
    pub race_date: NaiveDate,
    pub horse_id: String,
    pub horse_no: u8,
}

/// Feature matrix with labels and row keys.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub x: Array2<f64>,
    /// Empty for race cards
    pub y: Vec<f64>,
    pub keys: Vec<RowKey>,
    pub target: Option<Target>,
}

impl Dataset {
    pub fn n_rows(&self) -> usize {
        self.x.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.x.ncols()
    }

    pub fn is_labeled(&self) -> bool {
        self.target.is_some()
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.x.column(idx))
    }

    /// Rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Dataset {
        Dataset {
            columns: self.columns.clone(),
            x: self.x.select(Axis(0), indices),
            y: if self.y.is_empty() {
                Vec::new()
            } else {
                indices.iter().map(|&i| self.y[i]).collect()
            },
            keys: indices.iter().map(|&i| self.keys[i].clone()).collect(),
            target: self.target,
        }
    }

    /// Column schema, written next to exported datasets.
    pub fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "schema_version": FEATURE_SCHEMA_VERSION,
            "target": self.target.map(|t| t.name()),
            "keys": KEY_COLUMNS,
            "features": self.columns,
        })
    }

    /// Keys, features and (when labeled) a `target` column.
    ///
    /// A key that is also a feature column (`horse_no`) is written once, as the feature.
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let mut columns: Vec<Column> = Vec::with_capacity(self.columns.len() + KEY_COLUMNS.len() + 1);
        for name in KEY_COLUMNS {
            if self.columns.iter().any(|c| c == name) {
                continue;
            }
            let column = match name {
                "race_id" => Column::new(
                    name.into(),
                    self.keys.iter().map(|k| k.race_id.as_str()).collect::<Vec<_>>(),
                ),
                "race_date" => Column::new(
                    name.into(),
                    self.keys
                        .iter()
                        .map(|k| k.race_date.format("%Y-%m-%d").to_string())
                        .collect::<Vec<_>>(),
                ),
                "horse_id" => Column::new(
                    name.into(),
                    self.keys.iter().map(|k| k.horse_id.as_str()).collect::<Vec<_>>(),
                ),
                _ => Column::new(
                    name.into(),
                    self.keys.iter().map(|k| i64::from(k.horse_no)).collect::<Vec<_>>(),
                ),
            };
            columns.push(column);
        }
        for (j, name) in self.columns.iter().enumerate() {
            columns.push(Column::new(name.as_str().into(), self.x.column(j).to_vec()));
        }
        if self.is_labeled() {
            columns.push(Column::new("target".into(), self.y.clone()));
        }
        Ok(DataFrame::new(columns)?)
    }

    pub fn write_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut df = self.to_dataframe()?;
        let file = create_file(path.as_ref())?;
        ParquetWriter::new(file).finish(&mut df)?;
        Ok(())
    }

    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut df = self.to_dataframe()?;
        let mut file = create_file(path.as_ref())?;
        CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
        Ok(())
    }
}

fn create_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(File::create(path)?)
}

/// Chronological split by race: the latest `test_size` share of races is the test set.
pub fn split_by_date(dataset: &Dataset, test_size: f64) -> Result<(Dataset, Dataset)> {
    if !(test_size > 0.0 && test_size < 1.0) {
        return Err(FeatureError::invalid_argument(format!(
            "test_size must be in (0, 1), got {}",
            test_size
        )));
    }

    let races: BTreeSet<(NaiveDate, &str)> = dataset
        .keys
        .iter()
        .map(|k| (k.race_date, k.race_id.as_str()))
        .collect();
    let n_train = ((races.len() as f64 * (1.0 - test_size)).round() as usize).min(races.len());
    let test_races: BTreeSet<&str> = races.iter().skip(n_train).map(|(_, id)| *id).collect();

    let (test, train): (Vec<usize>, Vec<usize>) =
        (0..dataset.n_rows()).partition(|&i| test_races.contains(dataset.keys[i].race_id.as_str()));
    Ok((dataset.select(&train), dataset.select(&test)))
}

/// Rows lost or skipped while building a dataset.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub dates_processed: usize,
    pub skipped_dates: Vec<SkippedDate>,
    pub unlabeled_rows: usize,
    pub nan_rows: usize,
    /// Distinct horses without a stored pedigree
    pub missing_pedigrees: usize,
}

/// Join, encode and assemble steps shared by results and race cards.
pub trait RaceTable {
    /// Attach as-of history features to every runner. Returns the dates skipped.
    fn merge_history(&mut self, join: &AsOfJoin<'_>) -> Result<Vec<SkippedDate>>;

    /// Left-join pedigrees by horse id. Returns the horses without one.
    fn merge_pedigrees(&mut self, pedigrees: Vec<Pedigree>) -> Vec<String>;

    /// Encode ids and bounded categoricals. Unseen ids extend the id encoders.
    fn encode_categoricals(&mut self, encoders: &mut Encoders) -> Result<()>;

    /// Build the feature matrix, optionally dropping rows with any NaN.
    fn assemble(&self, drop_nan: bool) -> Result<(Dataset, BuildReport)>;
}

/// Finalized race results with known outcomes.
pub struct ResultsTable {
    records: Vec<RaceRecord>,
    target: Target,
    rows: Vec<JoinedRow>,
    pedigrees: HashMap<String, Pedigree>,
    columns: Vec<String>,
    encoded: Vec<Vec<f64>>,
    report: BuildReport,
}

impl ResultsTable {
    pub fn new(records: Vec<RaceRecord>, target: Target) -> Self {
        Self {
            records,
            target,
            rows: Vec::new(),
            pedigrees: HashMap::new(),
            columns: Vec::new(),
            encoded: Vec::new(),
            report: BuildReport::default(),
        }
    }

    /// Encoders fitted on this table's ids and merged pedigrees.
    pub fn fit_encoders(&self, config: &AppConfig) -> Encoders {
        let pedigrees: Vec<Pedigree> = self.pedigrees.values().cloned().collect();
        Encoders::fit(&self.records, &pedigrees, config.encoding.unknown_category)
    }
}

impl RaceTable for ResultsTable {
    fn merge_history(&mut self, join: &AsOfJoin<'_>) -> Result<Vec<SkippedDate>> {
        let output = join.join_all(&self.records)?;
        self.columns = join.feature_names().to_vec();
        self.rows = output.rows;
        self.report.dates_processed = output.dates_processed;
        self.report.skipped_dates = output.skipped.clone();
        Ok(output.skipped)
    }

    fn merge_pedigrees(&mut self, pedigrees: Vec<Pedigree>) -> Vec<String> {
        let (by_horse, missing) = pedigree_map(&self.rows, pedigrees);
        self.pedigrees = by_horse;
        self.report.missing_pedigrees = missing.len();
        missing
    }

    fn encode_categoricals(&mut self, encoders: &mut Encoders) -> Result<()> {
        self.encoded = encode_rows(&self.rows, &self.pedigrees, encoders)?;
        self.columns = feature_columns(&self.columns, encoders);
        Ok(())
    }

    fn assemble(&self, drop_nan: bool) -> Result<(Dataset, BuildReport)> {
        let labels: Vec<Option<f64>> = self.rows.iter().map(|r| self.target.label(r)).collect();
        let mut report = self.report.clone();
        report.unlabeled_rows = labels.iter().filter(|l| l.is_none()).count();
        if report.unlabeled_rows > 0 {
            debug!("Excluding {} rows without a {} label", report.unlabeled_rows, self.target);
        }
        build_dataset(
            &self.columns,
            &self.rows,
            &self.encoded,
            Some((self.target, labels)),
            drop_nan,
            report,
        )
    }
}

/// An upcoming race card: runners without outcomes.
pub struct RaceCardTable {
    records: Vec<RaceRecord>,
    rows: Vec<JoinedRow>,
    pedigrees: HashMap<String, Pedigree>,
    columns: Vec<String>,
    encoded: Vec<Vec<f64>>,
    report: BuildReport,
}

impl RaceCardTable {
    pub fn new(records: Vec<RaceRecord>) -> Self {
        Self {
            records,
            rows: Vec::new(),
            pedigrees: HashMap::new(),
            columns: Vec::new(),
            encoded: Vec::new(),
            report: BuildReport::default(),
        }
    }
}

impl RaceCardTable {
    /// Feature columns this card will have once encoded with `encoders`.
    pub fn feature_columns(&self, encoders: &Encoders) -> Vec<String> {
        feature_columns(&self.columns, encoders)
    }
}

impl RaceTable for RaceCardTable {
    fn merge_history(&mut self, join: &AsOfJoin<'_>) -> Result<Vec<SkippedDate>> {
        let output = join.join_all(&self.records)?;
        self.columns = join.feature_names().to_vec();
        self.rows = output.rows;
        self.report.dates_processed = output.dates_processed;
        self.report.skipped_dates = output.skipped.clone();
        Ok(output.skipped)
    }

    fn merge_pedigrees(&mut self, pedigrees: Vec<Pedigree>) -> Vec<String> {
        let (by_horse, missing) = pedigree_map(&self.rows, pedigrees);
        self.pedigrees = by_horse;
        self.report.missing_pedigrees = missing.len();
        missing
    }

    fn encode_categoricals(&mut self, encoders: &mut Encoders) -> Result<()> {
        let known = ID_ENTITIES.map(|e| encoders.id_encoder(e).len());
        self.encoded = encode_rows(&self.rows, &self.pedigrees, encoders)?;
        for (entity, before) in ID_ENTITIES.iter().zip(known) {
            let added = encoders.id_encoder(*entity).len() - before;
            if added > 0 {
                info!("{} new {} ids appended to the encoder", added, entity);
            }
        }
        self.columns = feature_columns(&self.columns, encoders);
        Ok(())
    }

    fn assemble(&self, drop_nan: bool) -> Result<(Dataset, BuildReport)> {
        build_dataset(
            &self.columns,
            &self.rows,
            &self.encoded,
            None,
            drop_nan,
            self.report.clone(),
        )
    }
}

/// Pedigrees keyed by horse id, plus the sorted horses of `rows` without one.
fn pedigree_map(rows: &[JoinedRow], pedigrees: Vec<Pedigree>) -> (HashMap<String, Pedigree>, Vec<String>) {
    let by_horse: HashMap<String, Pedigree> = pedigrees
        .into_iter()
        .map(|p| (p.horse_id.clone(), p))
        .collect();
    let missing: Vec<String> = rows
        .iter()
        .map(|r| r.runner.record.horse_id.as_str())
        .filter(|id| !by_horse.contains_key(*id))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect();
    if !missing.is_empty() {
        warn!("{} horses have no pedigree; import them to fill the ancestor columns", missing.len());
        debug!("Horses without pedigree: {:?}", missing);
    }
    (by_horse, missing)
}

/// Column order: race attributes, id codes, ancestor codes, history features, one-hot blocks.
fn feature_columns(history_names: &[String], encoders: &Encoders) -> Vec<String> {
    let mut columns: Vec<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
    columns.extend(ID_ENTITIES.iter().map(|e| format!("{}_code", e)));
    columns.extend(encoders.pedigree_names());
    columns.extend(history_names.iter().cloned());
    columns.extend(encoders.categorical_names());
    columns
}

/// Id codes, ancestor codes and one-hot blocks, per row.
fn encode_rows(
    rows: &[JoinedRow],
    pedigrees: &HashMap<String, Pedigree>,
    encoders: &mut Encoders,
) -> Result<Vec<Vec<f64>>> {
    for entity in ID_ENTITIES {
        let ids: Vec<&str> = rows
            .iter()
            .filter_map(|r| entity.id_of(&r.runner.record))
            .collect();
        encoders.id_encoder_mut(entity).extend_and_transform(&ids);
    }

    rows.iter()
        .map(|row| {
            let record = &row.runner.record;
            let mut values: Vec<f64> = ID_ENTITIES
                .iter()
                .map(|e| {
                    e.id_of(record)
                        .and_then(|id| encoders.id_encoder(*e).code(id))
                        .map_or(f64::NAN, f64::from)
                })
                .collect();
            values.extend(encoders.encode_pedigree(pedigrees.get(&record.horse_id)));
            values.extend(encoders.encode_categoricals(record)?);
            Ok(values)
        })
        .collect()
}

fn build_dataset(
    columns: &[String],
    rows: &[JoinedRow],
    encoded: &[Vec<f64>],
    labels: Option<(Target, Vec<Option<f64>>)>,
    drop_nan: bool,
    mut report: BuildReport,
) -> Result<(Dataset, BuildReport)> {
    if encoded.len() != rows.len() {
        return Err(FeatureError::invalid_argument(
            "categoricals must be encoded before assembling",
        ));
    }

    let mut matrix: Vec<Vec<f64>> = Vec::with_capacity(rows.len());
    let mut y = Vec::new();
    let mut keys = Vec::new();
    for (i, (row, codes)) in rows.iter().zip(encoded).enumerate() {
        let label = match &labels {
            Some((_, labels)) => match labels[i] {
                Some(label) => Some(label),
                None => continue,
            },
            None => None,
        };

        let mut values = Vec::with_capacity(columns.len());
        values.extend_from_slice(&row.runner.base);
        values.extend_from_slice(&codes[..CODE_WIDTH]);
        values.extend_from_slice(&row.features);
        values.extend_from_slice(&codes[CODE_WIDTH..]);

        if drop_nan && values.iter().any(|v| v.is_nan()) {
            report.nan_rows += 1;
            continue;
        }

        let record = &row.runner.record;
        keys.push(RowKey {
            race_id: record.race_id.clone(),
            race_date: record.race_date,
            horse_id: record.horse_id.clone(),
            horse_no: record.horse_no,
        });
        y.extend(label);
        matrix.push(values);
    }

    let mut x = Array2::<f64>::zeros((matrix.len(), columns.len()));
    for (i, values) in matrix.iter().enumerate() {
        if values.len() != columns.len() {
            return Err(FeatureError::invalid_argument(format!(
                "row has {} values for {} columns",
                values.len(),
                columns.len()
            )));
        }
        x.row_mut(i).assign(&ArrayView1::from(values.as_slice()));
    }

    let dataset = Dataset {
        columns: columns.to_vec(),
        x,
        y,
        keys,
        target: labels.map(|(target, _)| target),
    };
    Ok((dataset, report))
}

/// Loads records and histories from a store and runs a `RaceTable` end to end.
pub struct DatasetAssembler<'a, S: RecordStore> {
    store: &'a S,
    config: &'a AppConfig,
}

/// Training dataset with the encoders fitted for it.
pub struct TrainingSet {
    pub dataset: Dataset,
    pub encoders: Encoders,
    pub report: BuildReport,
}

impl<'a, S: RecordStore> DatasetAssembler<'a, S> {
    pub fn new(store: &'a S, config: &'a AppConfig) -> Self {
        Self { store, config }
    }

    /// Build the labeled dataset for the races matching `filter` and fit encoders.
    pub fn build_training(&self, filter: &ResultFilter) -> Result<TrainingSet> {
        let records = self.store.select_results(filter)?;
        info!("Loaded {} result rows", records.len());

        let (horses, jockeys) = self.load_indexes(&records)?;
        let join = AsOfJoin::new(&horses, jockeys.as_ref(), &self.config.features)?;

        let pedigrees = self.load_pedigrees(&records)?;

        let mut table = ResultsTable::new(records, self.config.dataset.target);
        table.merge_history(&join)?;
        table.merge_pedigrees(pedigrees);
        let mut encoders = table.fit_encoders(self.config);
        table.encode_categoricals(&mut encoders)?;
        let (dataset, report) = table.assemble(self.config.dataset.drop_nan)?;
        encoders.columns = dataset.columns.clone();

        info!(
            "Assembled {} rows x {} features ({} target)",
            dataset.n_rows(),
            dataset.n_features(),
            self.config.dataset.target
        );
        Ok(TrainingSet {
            dataset,
            encoders,
            report,
        })
    }

    /// Build unlabeled features for race-card runners, reusing `encoders`.
    ///
    /// The card's columns must match the training columns saved in `encoders`;
    /// the encoders are left untouched when they do not.
    pub fn build_race_card(
        &self,
        card: Vec<RaceRecord>,
        encoders: &mut Encoders,
    ) -> Result<(Dataset, BuildReport)> {
        let (horses, jockeys) = self.load_indexes(&card)?;
        let join = AsOfJoin::new(&horses, jockeys.as_ref(), &self.config.features)?;
        let pedigrees = self.load_pedigrees(&card)?;

        let mut table = RaceCardTable::new(card);
        table.merge_history(&join)?;
        encoders.check_columns(&table.feature_columns(encoders))?;
        table.merge_pedigrees(pedigrees);
        table.encode_categoricals(encoders)?;
        table.assemble(self.config.dataset.drop_nan)
    }

    fn load_pedigrees(&self, targets: &[RaceRecord]) -> Result<Vec<Pedigree>> {
        let horse_ids = distinct_ids(targets, Entity::Horse);
        let pedigrees = self.store.select_pedigrees(&horse_ids)?;
        debug!("Pedigrees: {} of {} horses", pedigrees.len(), horse_ids.len());
        Ok(pedigrees)
    }

    fn load_indexes(&self, targets: &[RaceRecord]) -> Result<(TemporalIndex, Option<TemporalIndex>)> {
        let normalize = &self.config.normalize;

        let horse_ids = distinct_ids(targets, Entity::Horse);
        let history = self.store.select_entity_history(Entity::Horse, &horse_ids)?;
        let horses = TemporalIndex::from_records(Entity::Horse, &history, normalize);
        debug!("Horse index: {} horses, {} records", horses.len(), history.len());

        let features = &self.config.features;
        let jockeys = if !features.jockey_windows.is_empty() || features.jockey_trailing_days > 0 {
            let jockey_ids = distinct_ids(targets, Entity::Jockey);
            let history = self.store.select_entity_history(Entity::Jockey, &jockey_ids)?;
            let index = TemporalIndex::from_records(Entity::Jockey, &history, normalize);
            debug!("Jockey index: {} jockeys, {} records", index.len(), history.len());
            Some(index)
        } else {
            None
        };

        Ok((horses, jockeys))
    }
}

fn distinct_ids(records: &[RaceRecord], entity: Entity) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| entity.id_of(r))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::window::Window;
    use crate::storage::MemoryStore;
    use crate::types::fixtures::{date, pedigree, record};

    /// Two horses with pedigrees over three meetings, one unfinished run on the last day.
    fn store() -> MemoryStore {
        results_store().with_pedigrees(vec![pedigree("A"), pedigree("B")])
    }

    fn results_store() -> MemoryStore {
        let mut records = vec![
            record("r1", date(2024, 1, 7), "A", 1),
            record("r1", date(2024, 1, 7), "B", 2),
            record("r2", date(2024, 2, 4), "A", 4),
            record("r2", date(2024, 2, 4), "B", 1),
            record("r3", date(2024, 3, 3), "A", 2),
            record("r3", date(2024, 3, 3), "B", 9),
        ];
        records[5].finish_position = None;
        records[5].finish_time = None;
        MemoryStore::new(records)
    }

    /// An upcoming runner without a result.
    fn card_runner(horse_id: &str, horse_no: u8) -> RaceRecord {
        let mut r = record("r4", date(2024, 4, 7), horse_id, horse_no);
        r.finish_position = None;
        r.finish_time = None;
        r
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.features.horse_windows = vec![Window::count_of(2), Window::All];
        config.features.positional_depth = 1;
        config
    }

    fn nan_eq(a: &Array2<f64>, b: &Array2<f64>) -> bool {
        a.shape() == b.shape()
            && a.iter()
                .zip(b.iter())
                .all(|(x, y)| (x.is_nan() && y.is_nan()) || x == y)
    }

    #[test]
    fn test_build_training_end_to_end() {
        let store = store();
        let config = config();
        let set = DatasetAssembler::new(&store, &config)
            .build_training(&ResultFilter::default())
            .unwrap();
        let ds = &set.dataset;

        // Unfinished runner has no label
        assert_eq!(ds.n_rows(), 5);
        assert_eq!(set.report.unlabeled_rows, 1);
        // Rows by date, then race and horse number: r1 A, r1 B, r2 B, r2 A, r3 A
        assert_eq!(ds.y, vec![0.0, 0.0, 0.0, 1.0, 0.0]);
        assert_eq!(ds.columns.len(), ds.n_features());

        // A on D3 with window 2: 1st (D1) and 4th (D2) in fields of 10
        let idx = ds
            .keys
            .iter()
            .position(|k| k.race_id == "r3" && k.horse_id == "A")
            .unwrap();
        let mean = ds.column("arriving_order_2R").unwrap()[idx];
        assert!((mean - 0.25).abs() < 1e-9);

        // First meeting has no history
        assert!(ds.column("arriving_order_allR").unwrap()[0].is_nan());
        assert_eq!(set.encoders.horse.len(), 2);
        assert_eq!(set.encoders.columns, ds.columns);

        // Meeting attributes
        assert_eq!(ds.column("hold_no").unwrap()[0], 1.0);
        assert_eq!(ds.column("hold_day").unwrap()[0], 4.0);
    }

    #[test]
    fn test_pedigree_block() {
        let store = store();
        let config = config();
        let set = DatasetAssembler::new(&store, &config)
            .build_training(&ResultFilter::default())
            .unwrap();
        let ds = &set.dataset;
        assert_eq!(set.report.missing_pedigrees, 0);

        let father = ds.column("father").unwrap();
        let code_a = set.encoders.pedigree.code("father_A").unwrap();
        assert_eq!(father[0], f64::from(code_a));
        assert_eq!(set.encoders.pedigree.len(), 12);

        // Without a stored pedigree the ancestor columns are NaN and the row is kept
        let store = results_store().with_pedigrees(vec![pedigree("A")]);
        let set = DatasetAssembler::new(&store, &config)
            .build_training(&ResultFilter::default())
            .unwrap();
        assert_eq!(set.report.missing_pedigrees, 1);
        assert_eq!(set.dataset.n_rows(), 5);
        let b = set.dataset.keys.iter().position(|k| k.horse_id == "B").unwrap();
        assert!(set.dataset.column("mothers_mother").unwrap()[b].is_nan());
    }

    #[test]
    fn test_determinism() {
        let store = store();
        let config = config();
        let assembler = DatasetAssembler::new(&store, &config);
        let a = assembler.build_training(&ResultFilter::default()).unwrap();
        let b = assembler.build_training(&ResultFilter::default()).unwrap();

        assert_eq!(a.dataset.columns, b.dataset.columns);
        assert_eq!(a.dataset.keys, b.dataset.keys);
        assert_eq!(a.dataset.y, b.dataset.y);
        assert!(nan_eq(&a.dataset.x, &b.dataset.x));
        assert_eq!(a.encoders, b.encoders);
    }

    #[test]
    fn test_drop_nan() {
        let store = store();
        let mut config = config();
        config.dataset.drop_nan = true;
        let set = DatasetAssembler::new(&store, &config)
            .build_training(&ResultFilter::default())
            .unwrap();
        // Only rows with a full window-2, all and p1 history survive: D2 and D3 for A, D2 for B
        assert_eq!(set.dataset.n_rows(), 3);
        assert!(set.dataset.x.iter().all(|v| !v.is_nan()));
        assert_eq!(set.report.nan_rows, 2);
    }

    #[test]
    fn test_targets() {
        let store = store();
        let mut config = config();

        config.dataset.target = Target::MultiClass;
        let set = DatasetAssembler::new(&store, &config)
            .build_training(&ResultFilter::default())
            .unwrap();
        assert_eq!(set.dataset.y, vec![0.0, 0.0, 0.0, 1.0, 0.0]);

        config.dataset.target = Target::Regression;
        let set = DatasetAssembler::new(&store, &config)
            .build_training(&ResultFilter::default())
            .unwrap();
        assert!(set.dataset.y.iter().all(|&t| (t - 94.5).abs() < 1e-9));
    }

    #[test]
    fn test_target_from_str() {
        assert_eq!("Binary".parse::<Target>().unwrap(), Target::Binary);
        assert_eq!("rank".parse::<Target>().unwrap(), Target::MultiClass);
        assert!("ranking".parse::<Target>().unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_race_card_reuses_encoders() {
        let store = store();
        let config = config();
        let assembler = DatasetAssembler::new(&store, &config);
        let mut encoders = assembler
            .build_training(&ResultFilter::default())
            .unwrap()
            .encoders;
        let known_b = encoders.horse.code("B");

        let a = card_runner("A", 1);
        let c = card_runner("C", 2);
        let (ds, report) = assembler.build_race_card(vec![c, a], &mut encoders).unwrap();
        assert_eq!(report.missing_pedigrees, 1);

        assert!(!ds.is_labeled());
        assert!(ds.y.is_empty());
        assert_eq!(ds.n_rows(), 2);
        assert_eq!(encoders.horse.code("B"), known_b);
        assert_eq!(encoders.horse.code("C"), Some(2));

        // New horse has no history; A's last run on D3 is 35 days back
        let l_days = ds.column("l_days").unwrap();
        assert_eq!(l_days[0], 35.0);
        assert!(l_days[1].is_nan());
        assert_eq!(ds.column("horse_code").unwrap()[1], 2.0);
        assert_eq!(ds.columns, encoders.columns);
    }

    #[test]
    fn test_race_card_columns_must_match_training() {
        let store = store();
        let config = config();
        let mut encoders = DatasetAssembler::new(&store, &config)
            .build_training(&ResultFilter::default())
            .unwrap()
            .encoders;
        let before = encoders.clone();

        let mut card_config = config.clone();
        card_config.features.horse_windows = vec![Window::count_of(5), Window::All];
        let err = DatasetAssembler::new(&store, &card_config)
            .build_race_card(vec![card_runner("C", 1)], &mut encoders)
            .err()
            .unwrap();
        assert!(err.is_invalid_argument());
        // Nothing appended on a rejected card
        assert_eq!(encoders, before);

        // Encoders that never saw a training build carry no layout
        let mut fresh = Encoders::fit(&[], &[], Default::default());
        let err = DatasetAssembler::new(&store, &config)
            .build_race_card(vec![card_runner("C", 1)], &mut fresh)
            .err()
            .unwrap();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_unknown_category_rejected() {
        let mut records = vec![record("r1", date(2024, 1, 7), "A", 1)];
        records[0].weather = Some("霧".to_string());
        let store = MemoryStore::new(records);
        let config = config();
        let err = DatasetAssembler::new(&store, &config)
            .build_training(&ResultFilter::default())
            .err()
            .unwrap();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_split_by_date() {
        let store = store();
        let config = config();
        let ds = DatasetAssembler::new(&store, &config)
            .build_training(&ResultFilter::default())
            .unwrap()
            .dataset;

        let (train, test) = split_by_date(&ds, 0.3).unwrap();
        assert_eq!(train.n_rows() + test.n_rows(), ds.n_rows());
        assert!(test.keys.iter().all(|k| k.race_id == "r3"));
        let last_train = train.keys.iter().map(|k| k.race_date).max().unwrap();
        let first_test = test.keys.iter().map(|k| k.race_date).min().unwrap();
        assert!(last_train < first_test);

        assert!(split_by_date(&ds, 1.0).is_err());
    }

    #[test]
    fn test_split_rounds_train_share() {
        let keys: Vec<RowKey> = (1..=5)
            .map(|d| RowKey {
                race_id: format!("r{}", d),
                race_date: date(2024, 1, d),
                horse_id: "A".to_string(),
                horse_no: 1,
            })
            .collect();
        let ds = Dataset {
            columns: vec!["f".to_string()],
            x: Array2::zeros((5, 1)),
            y: vec![0.0; 5],
            keys,
            target: Some(Target::Binary),
        };

        // 5 races at 0.3: 3.5 training races round up to 4
        let (train, test) = split_by_date(&ds, 0.3).unwrap();
        assert_eq!(train.n_rows(), 4);
        assert_eq!(test.n_rows(), 1);
        assert_eq!(test.keys[0].race_id, "r5");
    }

    #[test]
    fn test_dataframe_export() {
        let store = store();
        let config = config();
        let ds = DatasetAssembler::new(&store, &config)
            .build_training(&ResultFilter::default())
            .unwrap()
            .dataset;

        let df = ds.to_dataframe().unwrap();
        assert_eq!(df.height(), ds.n_rows());
        // race_id, race_date, horse_id, features (horse_no among them), target
        assert_eq!(df.width(), ds.n_features() + 4);
        assert!(df.column("target").is_ok());
        assert!(df.column("race_id").is_ok());
        assert_eq!(df.column("horse_no").unwrap().f64().unwrap().get(0), Some(1.0));

        let csv_path = std::env::temp_dir().join("keiba_dataset_export_test.csv");
        ds.write_csv(&csv_path).unwrap();
        let header = std::fs::read_to_string(&csv_path).unwrap();
        std::fs::remove_file(&csv_path).ok();
        assert!(header.starts_with("race_id,race_date,horse_id,horse_no,"));

        let path = std::env::temp_dir().join("keiba_dataset_export_test.parquet");
        ds.write_parquet(&path).unwrap();
        let back = LazyFrame::scan_parquet(&path, Default::default())
            .unwrap()
            .collect()
            .unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(back.height(), ds.n_rows());

        let schema = ds.schema();
        assert_eq!(schema["schema_version"], FEATURE_SCHEMA_VERSION);
        assert_eq!(schema["target"], "binary");
    }
}
