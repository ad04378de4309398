//! Categorical encoders.
//!
//! `IdEncoder` assigns append-only integer codes to unbounded identifier
//! columns; `CategoryEncoder` one-hot encodes a fixed vocabulary. Both are
//! plain values threaded through the pipeline and saved next to the model so
//! inference reuses the training feature space.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use crate::error::{FeatureError, Result};
use crate::types::{Entity, Pedigree, RaceRecord, PEDIGREE_COLUMNS};

/// Append-only id -> code table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct IdEncoder {
    classes: Vec<String>,
    codes: HashMap<String, u32>,
}

impl From<Vec<String>> for IdEncoder {
    fn from(classes: Vec<String>) -> Self {
        let mut encoder = IdEncoder::default();
        for id in classes {
            encoder.insert(&id);
        }
        encoder
    }
}

impl From<IdEncoder> for Vec<String> {
    fn from(encoder: IdEncoder) -> Self {
        encoder.classes
    }
}

impl IdEncoder {
    /// Build a vocabulary from sorted unique ids.
    pub fn fit<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let unique: BTreeSet<String> = ids.into_iter().map(|s| s.as_ref().to_string()).collect();
        Self::from(unique.into_iter().collect::<Vec<_>>())
    }

    fn insert(&mut self, id: &str) -> u32 {
        if let Some(&code) = self.codes.get(id) {
            return code;
        }
        let code = self.classes.len() as u32;
        self.classes.push(id.to_string());
        self.codes.insert(id.to_string(), code);
        code
    }

    /// Append unseen ids (first-appearance order), then encode the whole batch.
    pub fn extend_and_transform<S: AsRef<str>>(&mut self, ids: &[S]) -> Vec<u32> {
        ids.iter().map(|id| self.insert(id.as_ref())).collect()
    }

    /// Encode without extending; unseen ids are None.
    pub fn transform<S: AsRef<str>>(&self, ids: &[S]) -> Vec<Option<u32>> {
        ids.iter().map(|id| self.code(id.as_ref())).collect()
    }

    pub fn code(&self, id: &str) -> Option<u32> {
        self.codes.get(id).copied()
    }

    pub fn decode(&self, code: u32) -> Option<&str> {
        self.classes.get(code as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Handling of bounded categories outside the fixed vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownCategoryPolicy {
    /// Fail with InvalidArgument
    #[default]
    Reject,
    /// Encode as all-zero dummy columns
    AllZero,
    /// Set an explicit `{column}_other` column
    Other,
}

/// Bounded categorical attributes of a race record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoricalField {
    Weather,
    Ground,
    RaceType,
    Turn,
    Sex,
}

impl CategoricalField {
    pub const ALL: [CategoricalField; 5] = [
        CategoricalField::Weather,
        CategoricalField::Ground,
        CategoricalField::RaceType,
        CategoricalField::Turn,
        CategoricalField::Sex,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CategoricalField::Weather => "weather",
            CategoricalField::Ground => "ground",
            CategoricalField::RaceType => "race_type",
            CategoricalField::Turn => "turn",
            CategoricalField::Sex => "sex",
        }
    }

    /// The fixed vocabulary for this attribute.
    pub fn vocabulary(&self) -> &'static [&'static str] {
        match self {
            CategoricalField::Weather => &["晴", "曇", "小雨", "雨", "小雪", "雪"],
            CategoricalField::Ground => &["良", "稍", "重", "不"],
            CategoricalField::RaceType => &["芝", "ダート", "障害"],
            CategoricalField::Turn => &["左", "右", "他"],
            CategoricalField::Sex => &["牡", "牝", "セ"],
        }
    }

    pub fn value_of<'a>(&self, record: &'a RaceRecord) -> Option<&'a str> {
        match self {
            CategoricalField::Weather => record.weather.as_deref(),
            CategoricalField::Ground => record.ground.as_deref(),
            CategoricalField::RaceType => Some(record.race_type.as_str()),
            CategoricalField::Turn => record.turn.as_deref(),
            CategoricalField::Sex => record.sex.as_deref(),
        }
    }
}

/// One-hot encoder over a fixed vocabulary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryEncoder {
    pub field: CategoricalField,
    categories: Vec<String>,
    policy: UnknownCategoryPolicy,
}

impl CategoryEncoder {
    pub fn new(field: CategoricalField, categories: Vec<String>, policy: UnknownCategoryPolicy) -> Self {
        Self {
            field,
            categories,
            policy,
        }
    }

    /// Encoder over the field's built-in vocabulary.
    pub fn for_field(field: CategoricalField, policy: UnknownCategoryPolicy) -> Self {
        let categories = field.vocabulary().iter().map(|s| s.to_string()).collect();
        Self::new(field, categories, policy)
    }

    pub fn column_names(&self) -> Vec<String> {
        let column = self.field.name();
        let mut names: Vec<String> = self
            .categories
            .iter()
            .map(|c| format!("{}_{}", column, c))
            .collect();
        if self.policy == UnknownCategoryPolicy::Other {
            names.push(format!("{}_other", column));
        }
        names
    }

    /// One-hot block for a value; missing values are all zero.
    pub fn encode(&self, value: Option<&str>) -> Result<Vec<f64>> {
        let mut block = vec![0.0; self.column_names().len()];
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(block);
        };

        match self.categories.iter().position(|c| c == value) {
            Some(i) => block[i] = 1.0,
            None => match self.policy {
                UnknownCategoryPolicy::Reject => {
                    return Err(FeatureError::invalid_argument(format!(
                        "unknown {} category '{}'",
                        self.field.name(),
                        value
                    )))
                }
                UnknownCategoryPolicy::AllZero => {}
                UnknownCategoryPolicy::Other => block[self.categories.len()] = 1.0,
            },
        }
        Ok(block)
    }
}

/// Fitted encoders saved with a trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encoders {
    pub schema_version: u32,
    pub horse: IdEncoder,
    pub jockey: IdEncoder,
    pub trainer: IdEncoder,
    /// One vocabulary shared by every ancestor column
    pub pedigree: IdEncoder,
    pub categories: Vec<CategoryEncoder>,
    /// Feature columns of the training dataset, empty until a training build sets them
    pub columns: Vec<String>,
}

impl Encoders {
    /// Fit id and pedigree encoders; category encoders use the fixed vocabularies.
    pub fn fit(records: &[RaceRecord], pedigrees: &[Pedigree], policy: UnknownCategoryPolicy) -> Self {
        let ids = |entity: Entity| records.iter().filter_map(move |r| entity.id_of(r));
        Self {
            schema_version: crate::dataset::FEATURE_SCHEMA_VERSION,
            horse: IdEncoder::fit(ids(Entity::Horse)),
            jockey: IdEncoder::fit(ids(Entity::Jockey)),
            trainer: IdEncoder::fit(ids(Entity::Trainer)),
            pedigree: IdEncoder::fit(pedigrees.iter().flat_map(Pedigree::names)),
            categories: CategoricalField::ALL
                .iter()
                .map(|&f| CategoryEncoder::for_field(f, policy))
                .collect(),
            columns: Vec::new(),
        }
    }

    pub fn pedigree_names(&self) -> Vec<String> {
        PEDIGREE_COLUMNS.iter().map(|c| c.to_string()).collect()
    }

    /// Ancestor codes, extending the shared vocabulary with unseen names.
    /// A horse without a pedigree, or a missing ancestor, is NaN.
    pub fn encode_pedigree(&mut self, pedigree: Option<&Pedigree>) -> Vec<f64> {
        match pedigree {
            Some(p) => p
                .ancestors
                .iter()
                .map(|a| match a {
                    Some(name) => f64::from(self.pedigree.extend_and_transform(&[name])[0]),
                    None => f64::NAN,
                })
                .collect(),
            None => vec![f64::NAN; PEDIGREE_COLUMNS.len()],
        }
    }

    /// Reject a feature layout that differs from the training one.
    pub fn check_columns(&self, columns: &[String]) -> Result<()> {
        if self.columns.is_empty() {
            return Err(FeatureError::invalid_argument(
                "encoders carry no training columns; rebuild them with a training run",
            ));
        }
        if self.columns.as_slice() == columns {
            return Ok(());
        }
        let first_diff = self
            .columns
            .iter()
            .zip(columns)
            .position(|(a, b)| a != b)
            .unwrap_or_else(|| self.columns.len().min(columns.len()));
        Err(FeatureError::invalid_argument(format!(
            "feature columns differ from training ({} vs {} columns, first difference at {}: {:?} vs {:?})",
            columns.len(),
            self.columns.len(),
            first_diff,
            columns.get(first_diff),
            self.columns.get(first_diff)
        )))
    }

    pub fn id_encoder(&self, entity: Entity) -> &IdEncoder {
        match entity {
            Entity::Horse => &self.horse,
            Entity::Jockey => &self.jockey,
            Entity::Trainer => &self.trainer,
        }
    }

    pub fn id_encoder_mut(&mut self, entity: Entity) -> &mut IdEncoder {
        match entity {
            Entity::Horse => &mut self.horse,
            Entity::Jockey => &mut self.jockey,
            Entity::Trainer => &mut self.trainer,
        }
    }

    pub fn categorical_names(&self) -> Vec<String> {
        self.categories.iter().flat_map(|c| c.column_names()).collect()
    }

    /// Concatenated one-hot blocks for a record.
    pub fn encode_categoricals(&self, record: &RaceRecord) -> Result<Vec<f64>> {
        let mut values = Vec::new();
        for encoder in &self.categories {
            values.extend(encoder.encode(encoder.field.value_of(record))?);
        }
        Ok(values)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let encoders: Encoders = serde_json::from_str(&content)?;
        if encoders.schema_version != crate::dataset::FEATURE_SCHEMA_VERSION {
            return Err(FeatureError::invalid_argument(format!(
                "encoders built for schema v{}, expected v{}",
                encoders.schema_version,
                crate::dataset::FEATURE_SCHEMA_VERSION
            )));
        }
        Ok(encoders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::{date, pedigree, record};

    #[test]
    fn test_fit_sorted() {
        let enc = IdEncoder::fit(["h3", "h1", "h2", "h1"]);
        assert_eq!(enc.len(), 3);
        assert_eq!(enc.code("h1"), Some(0));
        assert_eq!(enc.code("h3"), Some(2));
        assert_eq!(enc.decode(1), Some("h2"));
    }

    #[test]
    fn test_extend_never_reassigns() {
        let mut enc = IdEncoder::fit(["a", "b"]);
        let first = enc.extend_and_transform(&["b", "z", "a", "z"]);
        assert_eq!(first, vec![1, 2, 0, 2]);

        let second = enc.extend_and_transform(&["y", "z", "a"]);
        assert_eq!(second, vec![3, 2, 0]);
        assert_eq!(enc.len(), 4);
        assert_eq!(enc.code("b"), Some(1));
    }

    #[test]
    fn test_transform_without_extend() {
        let enc = IdEncoder::fit(["a"]);
        assert_eq!(enc.transform(&["a", "new"]), vec![Some(0), None]);
        assert_eq!(enc.len(), 1);
    }

    #[test]
    fn test_id_encoder_serde() {
        let mut enc = IdEncoder::fit(["b", "a"]);
        enc.extend_and_transform(&["c"]);
        let json = serde_json::to_string(&enc).unwrap();
        assert_eq!(json, r#"["a","b","c"]"#);
        let back: IdEncoder = serde_json::from_str(&json).unwrap();
        assert_eq!(back, enc);
        assert_eq!(back.code("c"), Some(2));
    }

    #[test]
    fn test_category_one_hot() {
        let enc = CategoryEncoder::for_field(CategoricalField::Ground, UnknownCategoryPolicy::Reject);
        assert_eq!(enc.column_names(), vec!["ground_良", "ground_稍", "ground_重", "ground_不"]);
        assert_eq!(enc.encode(Some("重")).unwrap(), vec![0.0, 0.0, 1.0, 0.0]);
        assert_eq!(enc.encode(None).unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_unknown_category_policies() {
        let reject = CategoryEncoder::for_field(CategoricalField::Weather, UnknownCategoryPolicy::Reject);
        assert!(reject.encode(Some("霧")).unwrap_err().is_invalid_argument());

        let zero = CategoryEncoder::for_field(CategoricalField::Weather, UnknownCategoryPolicy::AllZero);
        assert_eq!(zero.encode(Some("霧")).unwrap(), vec![0.0; 6]);

        let other = CategoryEncoder::for_field(CategoricalField::Weather, UnknownCategoryPolicy::Other);
        assert_eq!(other.column_names().last().unwrap(), "weather_other");
        let block = other.encode(Some("霧")).unwrap();
        assert_eq!(block.len(), 7);
        assert_eq!(block[6], 1.0);
        assert_eq!(other.encode(Some("晴")).unwrap()[0], 1.0);
    }

    #[test]
    fn test_encoders_roundtrip_file() {
        let records = vec![
            record("r1", date(2024, 1, 1), "h2", 1),
            record("r1", date(2024, 1, 1), "h1", 2),
        ];
        let encoders = Encoders::fit(&records, &[pedigree("h1")], UnknownCategoryPolicy::Other);
        assert_eq!(encoders.horse.code("h1"), Some(0));
        assert_eq!(encoders.jockey.code("j_h2"), Some(1));
        assert_eq!(encoders.pedigree.len(), 6);
        assert_eq!(encoders.encode_categoricals(&records[0]).unwrap().len(), encoders.categorical_names().len());

        let path = std::env::temp_dir().join("keiba_dataset_encoders_test.json");
        encoders.save(&path).unwrap();
        let loaded = Encoders::load(&path).unwrap();
        assert_eq!(loaded, encoders);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_pedigree_shared_vocabulary() {
        // The same stallion as father of one horse and grandsire of another gets one code
        let mut a = pedigree("a");
        a.ancestors[0] = Some("キングカメハメハ".to_string());
        let mut b = pedigree("b");
        b.ancestors[4] = Some("キングカメハメハ".to_string());
        b.ancestors[5] = None;
        let mut encoders = Encoders::fit(&[], &[a.clone(), b.clone()], UnknownCategoryPolicy::Reject);
        assert_eq!(encoders.pedigree.len(), 10);

        let codes_a = encoders.encode_pedigree(Some(&a));
        let codes_b = encoders.encode_pedigree(Some(&b));
        assert_eq!(codes_a[0], codes_b[4]);
        assert!(codes_b[5].is_nan());
        assert!(encoders.encode_pedigree(None).iter().all(|v| v.is_nan()));
        assert_eq!(encoders.pedigree.len(), 10);

        // Unseen ancestors are appended, never refit
        let c = pedigree("c");
        let codes_c = encoders.encode_pedigree(Some(&c));
        assert_eq!(codes_c[0], 10.0);
        assert_eq!(encoders.pedigree.len(), 16);
    }

    #[test]
    fn test_check_columns() {
        let mut encoders = Encoders::fit(&[], &[], UnknownCategoryPolicy::Reject);
        let columns = vec!["horse_no".to_string(), "l_days".to_string()];
        assert!(encoders.check_columns(&columns).unwrap_err().is_invalid_argument());

        encoders.columns = columns.clone();
        assert!(encoders.check_columns(&columns).is_ok());
        assert!(encoders.check_columns(&columns[..1]).unwrap_err().is_invalid_argument());
        let renamed = vec!["horse_no".to_string(), "arriving_order_5R".to_string()];
        assert!(encoders.check_columns(&renamed).is_err());
    }
}
