//! Results, race-card and pedigree CSV files.
//!
//! One row per runner. Result columns (finish_position, finish_time, ...) are
//! optional so the same reader serves race cards. Pedigree files hold one row
//! per horse.

use polars::prelude::*;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::{FeatureError, Result};
use crate::types::{
    fill_field_sizes, parse_date, race_id_part, Pedigree, RaceRecord, PEDIGREE_COLUMNS,
};

const REQUIRED: [&str; 6] = ["race_id", "race_date", "horse_id", "distance", "race_type", "horse_no"];

const OPTIONAL: [&str; 24] = [
    "place_id",
    "race_no",
    "hold_no",
    "hold_day",
    "jockey_id",
    "trainer_id",
    "turn",
    "ground",
    "weather",
    "field_size",
    "frame_no",
    "sex",
    "age",
    "impost",
    "horse_weight",
    "weight_change",
    "finish_position",
    "finish_time",
    "time_diff",
    "last_3f",
    "corner_pass",
    "win_odds",
    "popularity",
    "prize",
];

/// Read a CSV file with every column as text.
fn read_text_csv(path: &Path) -> Result<DataFrame> {
    Ok(CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?)
}

fn text_columns(
    df: &DataFrame,
    required: &[&'static str],
    optional: &[&'static str],
) -> Result<HashMap<&'static str, StringChunked>> {
    let mut columns = HashMap::new();
    for &name in required {
        let column = df
            .column(name)
            .map_err(|_| FeatureError::invalid_argument(format!("missing required column '{}'", name)))?;
        columns.insert(name, column.cast(&DataType::String)?.str()?.clone());
    }
    for &name in optional {
        if let Ok(column) = df.column(name) {
            columns.insert(name, column.cast(&DataType::String)?.str()?.clone());
        }
    }
    Ok(columns)
}

/// Read runner records from a CSV file.
pub fn records_from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<RaceRecord>> {
    records_from_frame(&read_text_csv(path.as_ref())?)
}

/// Read pedigrees (`horse_id` plus the ancestor columns) from a CSV file.
pub fn pedigrees_from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Pedigree>> {
    pedigrees_from_frame(&read_text_csv(path.as_ref())?)
}

/// Convert a frame with `horse_id` and any of the ancestor columns into pedigrees.
pub fn pedigrees_from_frame(df: &DataFrame) -> Result<Vec<Pedigree>> {
    let columns = text_columns(df, &["horse_id"], &PEDIGREE_COLUMNS)?;
    (0..df.height())
        .map(|row| {
            let cells = Cells {
                columns: &columns,
                row,
            };
            let horse_id = cells
                .get("horse_id")
                .ok_or_else(|| FeatureError::malformed(format!("row {}", row + 1), "empty horse_id"))?
                .to_string();
            Ok(Pedigree {
                horse_id,
                ancestors: PEDIGREE_COLUMNS.map(|c| cells.text(c)),
            })
        })
        .collect()
}

/// Convert a frame with the CSV columns into records.
///
/// Malformed required values fail with `MalformedRecord`; malformed optional
/// values (e.g. "計不" in a weight column) are treated as missing. Missing
/// field sizes are filled from the runner count of each race.
pub fn records_from_frame(df: &DataFrame) -> Result<Vec<RaceRecord>> {
    let columns = text_columns(df, &REQUIRED, &OPTIONAL)?;

    let mut records = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let cells = Cells {
            columns: &columns,
            row,
        };
        let race_id = cells
            .get("race_id")
            .ok_or_else(|| FeatureError::malformed(format!("row {}", row + 1), "empty race_id"))?
            .to_string();

        let race_date = parse_date(cells.required(&race_id, "race_date")?)
            .map_err(|e| FeatureError::malformed(&race_id, e.to_string()))?;
        let (weight, change) = split_horse_weight(cells.get("horse_weight"));

        records.push(RaceRecord {
            race_date,
            horse_id: cells.required(&race_id, "horse_id")?.to_string(),
            jockey_id: cells.text("jockey_id"),
            trainer_id: cells.text("trainer_id"),
            place_id: cells.opt("place_id").or_else(|| race_id_part(&race_id, 4)).unwrap_or(0),
            race_no: cells.opt("race_no").or_else(|| race_id_part(&race_id, 10)).unwrap_or(0),
            hold_no: cells.opt("hold_no").or_else(|| race_id_part(&race_id, 6)),
            hold_day: cells.opt("hold_day").or_else(|| race_id_part(&race_id, 8)),
            distance: cells.parsed(&race_id, "distance")?,
            race_type: cells.required(&race_id, "race_type")?.to_string(),
            turn: cells.text("turn"),
            ground: cells.text("ground"),
            weather: cells.text("weather"),
            field_size: cells.opt("field_size"),
            horse_no: cells.parsed(&race_id, "horse_no")?,
            frame_no: cells.opt("frame_no"),
            sex: cells.text("sex"),
            age: cells.opt("age"),
            impost: cells.opt("impost"),
            horse_weight: weight,
            weight_change: cells.opt("weight_change").or(change),
            finish_position: cells.opt("finish_position"),
            finish_time: cells.text("finish_time"),
            time_diff: cells.opt("time_diff"),
            last_3f: cells.opt("last_3f"),
            corner_pass: cells.text("corner_pass"),
            win_odds: cells.opt("win_odds"),
            popularity: cells.opt("popularity"),
            prize: cells.opt("prize"),
            race_id,
        });
    }

    fill_field_sizes(&mut records);
    Ok(records)
}

/// Trimmed, non-empty text cells of one row.
struct Cells<'a> {
    columns: &'a HashMap<&'static str, StringChunked>,
    row: usize,
}

impl<'a> Cells<'a> {
    fn get(&self, name: &str) -> Option<&'a str> {
        self.columns
            .get(name)
            .and_then(|c| c.get(self.row))
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn text(&self, name: &str) -> Option<String> {
        self.get(name).map(str::to_string)
    }

    fn opt<T: FromStr>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|s| s.parse().ok())
    }

    fn required(&self, race_id: &str, name: &str) -> Result<&'a str> {
        self.get(name)
            .ok_or_else(|| FeatureError::malformed(race_id, format!("empty {}", name)))
    }

    fn parsed<T: FromStr>(&self, race_id: &str, name: &str) -> Result<T> {
        let text = self.required(race_id, name)?;
        text.parse()
            .map_err(|_| FeatureError::malformed(race_id, format!("bad {} '{}'", name, text)))
    }
}

fn weight_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)\(([+-]?\d+)\)$").expect("valid weight regex"))
}

/// "480(+2)" -> (480, +2); a plain "480" has no change.
fn split_horse_weight(text: Option<&str>) -> (Option<u32>, Option<i32>) {
    let Some(text) = text else {
        return (None, None);
    };
    match weight_re().captures(text) {
        Some(caps) => (caps[1].parse().ok(), caps[2].parse().ok()),
        None => (text.parse().ok(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn frame() -> DataFrame {
        DataFrame::new(vec![
            Column::new("race_id".into(), ["202405010101", "202405010101", "202405010101"]),
            Column::new("race_date".into(), ["2024/01/06", "2024/01/06", "2024/01/06"]),
            Column::new("horse_id".into(), ["h1", "h2", "h3"]),
            Column::new("distance".into(), ["1600", "1600", "1600"]),
            Column::new("race_type".into(), ["芝", "芝", "芝"]),
            Column::new("horse_no".into(), ["1", "2", "3"]),
            Column::new("horse_weight".into(), ["480(+2)", "計不", "462"]),
            Column::new("finish_position".into(), ["2", "", "1"]),
            Column::new("finish_time".into(), ["1:34.8", "", "1:34.5"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_records_from_frame() {
        let records = records_from_frame(&frame()).unwrap();
        assert_eq!(records.len(), 3);

        let r = &records[0];
        assert_eq!(r.race_date, NaiveDate::from_ymd_opt(2024, 1, 6).unwrap());
        assert_eq!(r.place_id, 5);
        assert_eq!(r.race_no, 1);
        assert_eq!(r.hold_no, Some(1));
        assert_eq!(r.hold_day, Some(1));
        assert_eq!(r.field_size, Some(3));
        assert_eq!(r.horse_weight, Some(480));
        assert_eq!(r.weight_change, Some(2));
        assert_eq!(r.finish_position, Some(2));

        assert_eq!(records[1].horse_weight, None);
        assert_eq!(records[1].finish_position, None);
        assert_eq!(records[2].horse_weight, Some(462));
        assert_eq!(records[2].weight_change, None);
    }

    #[test]
    fn test_missing_required_column() {
        let df = frame().drop("distance").unwrap();
        assert!(records_from_frame(&df).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_malformed_required_value() {
        let mut df = frame();
        df.with_column(Column::new("horse_no".into(), ["1", "x", "3"]))
            .unwrap();
        let err = records_from_frame(&df).unwrap_err();
        assert!(matches!(err, FeatureError::MalformedRecord { .. }));
    }

    #[test]
    fn test_read_csv_file() {
        let path = std::env::temp_dir().join("keiba_dataset_csv_test.csv");
        std::fs::write(
            &path,
            "race_id,race_date,horse_id,distance,race_type,horse_no,jockey_id\n\
             202405010101,2024-01-06,h1,1600,芝,1,01167\n",
        )
        .unwrap();
        let records = records_from_csv(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(records.len(), 1);
        // Leading zeros survive: every column is read as text
        assert_eq!(records[0].jockey_id.as_deref(), Some("01167"));
        assert_eq!(records[0].field_size, Some(1));
    }

    #[test]
    fn test_pedigrees_from_frame() {
        let df = DataFrame::new(vec![
            Column::new("horse_id".into(), ["h1", "h2"]),
            Column::new("father".into(), ["ディープインパクト", ""]),
            Column::new("mothers_father".into(), ["Storm Cat", "キングカメハメハ"]),
        ])
        .unwrap();
        let peds = pedigrees_from_frame(&df).unwrap();

        assert_eq!(peds.len(), 2);
        assert_eq!(peds[0].ancestors[0].as_deref(), Some("ディープインパクト"));
        assert_eq!(peds[0].ancestors[1], None);
        assert_eq!(peds[0].ancestors[4].as_deref(), Some("Storm Cat"));
        assert_eq!(peds[1].ancestors[0], None);
        assert_eq!(peds[1].names().count(), 1);

        let missing = df.drop("horse_id").unwrap();
        assert!(pedigrees_from_frame(&missing).unwrap_err().is_invalid_argument());
    }
}
