//! Core record types shared by storage, feature building and dataset assembly.

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::{FeatureError, Result};

/// One runner in one race, as stored after scraping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RaceRecord {
    pub race_id: String,
    pub race_date: NaiveDate,
    pub horse_id: String,
    pub jockey_id: Option<String>,
    pub trainer_id: Option<String>,
    // Race conditions
    pub place_id: u8,
    pub race_no: u8,
    /// Meeting number of the year at the course (kai)
    pub hold_no: Option<u8>,
    /// Day within the meeting (nichime)
    pub hold_day: Option<u8>,
    pub distance: u32,
    pub race_type: String, // 芝, ダート, 障害
    pub turn: Option<String>,
    pub ground: Option<String>,
    pub weather: Option<String>,
    pub field_size: Option<u8>,
    // Entry
    pub horse_no: u8,
    pub frame_no: Option<u8>,
    pub sex: Option<String>,
    pub age: Option<u8>,
    pub impost: Option<f64>,
    pub horse_weight: Option<u32>,
    pub weight_change: Option<i32>,
    // Result
    pub finish_position: Option<u8>,
    pub finish_time: Option<String>, // "1:34.5"
    pub time_diff: Option<f64>,
    pub last_3f: Option<f64>,
    pub corner_pass: Option<String>, // "3-3-2-1"
    pub win_odds: Option<f64>,
    pub popularity: Option<u8>,
    pub prize: Option<f64>,
}

impl RaceRecord {
    /// Reject non-positive finish orders and distances.
    pub fn validate(&self) -> Result<()> {
        if self.finish_position == Some(0) {
            return Err(FeatureError::invalid_argument(format!(
                "finish position must be positive (race {}, horse {})",
                self.race_id, self.horse_id
            )));
        }
        if self.distance == 0 {
            return Err(FeatureError::invalid_argument(format!(
                "distance must be > 0 (race {})",
                self.race_id
            )));
        }
        Ok(())
    }

    /// Whether the runner finished in the first three.
    pub fn is_placed(&self) -> Option<bool> {
        self.finish_position.map(|p| p <= 3)
    }

    /// Finish time in seconds, None when absent or unparsable.
    pub fn finish_seconds(&self) -> Option<f64> {
        self.finish_time.as_deref().and_then(parse_finish_time)
    }

    /// Position at the first recorded corner.
    pub fn first_corner(&self) -> Option<u8> {
        self.corner_pass.as_deref().and_then(|s| corner_positions(s).first().copied())
    }

    /// Position at the last recorded corner.
    pub fn last_corner(&self) -> Option<u8> {
        self.corner_pass.as_deref().and_then(|s| corner_positions(s).last().copied())
    }

    /// Flat races exclude jump races (障害).
    pub fn is_flat(&self) -> bool {
        self.race_type != "障害"
    }
}

/// Ancestor columns of a pedigree, two generations back.
pub const PEDIGREE_COLUMNS: [&str; 6] = [
    "father",
    "mother",
    "fathers_father",
    "fathers_mother",
    "mothers_father",
    "mothers_mother",
];

/// Two generations of a horse's ancestors, in `PEDIGREE_COLUMNS` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Pedigree {
    pub horse_id: String,
    pub ancestors: [Option<String>; 6],
}

impl Pedigree {
    /// Ancestor names that are present.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ancestors.iter().filter_map(|a| a.as_deref())
    }
}

/// Kind of entity a history is kept for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Horse,
    Jockey,
    Trainer,
}

impl Entity {
    /// The id of this entity on a record.
    pub fn id_of<'a>(&self, record: &'a RaceRecord) -> Option<&'a str> {
        match self {
            Entity::Horse => Some(record.horse_id.as_str()),
            Entity::Jockey => record.jockey_id.as_deref(),
            Entity::Trainer => record.trainer_id.as_deref(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Entity::Horse => "horse",
            Entity::Jockey => "jockey",
            Entity::Trainer => "trainer",
        }
    }

    /// Column holding this entity's id in the race_entries table.
    pub fn id_column(&self) -> &'static str {
        match self {
            Entity::Horse => "horse_id",
            Entity::Jockey => "jockey_id",
            Entity::Trainer => "trainer_id",
        }
    }
}

impl FromStr for Entity {
    type Err = FeatureError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "horse" => Ok(Entity::Horse),
            "jockey" => Ok(Entity::Jockey),
            "trainer" => Ok(Entity::Trainer),
            other => Err(FeatureError::invalid_argument(format!(
                "unknown entity '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+):(\d{1,2}(?:\.\d+)?)$").expect("valid time regex"))
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("valid number regex"))
}

/// Parse a finish time such as "1:34.5" or "94.5" into seconds.
pub fn parse_finish_time(text: &str) -> Option<f64> {
    let text = text.trim();
    if let Some(caps) = time_re().captures(text) {
        let minutes: f64 = caps[1].parse().ok()?;
        let seconds: f64 = caps[2].parse().ok()?;
        return Some(minutes * 60.0 + seconds);
    }
    text.parse::<f64>().ok().filter(|s| s.is_finite() && *s > 0.0)
}

/// All corner positions in a corner-pass string ("3-3-2-1").
pub fn corner_positions(text: &str) -> Vec<u8> {
    number_re()
        .find_iter(text)
        .filter_map(|m| m.as_str().parse().ok())
        .collect()
}

/// Parse a date in either `%Y-%m-%d` or `%Y%m%d` form.
pub fn parse_date(text: &str) -> Result<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(text, "%Y%m%d"))
        .or_else(|_| NaiveDate::parse_from_str(text, "%Y/%m/%d"))
        .map_err(|_| FeatureError::invalid_argument(format!("unparsable date '{}'", text)))
}

/// Two digits of a 12-digit race id (YYYY PP KK DD RR).
pub fn race_id_part(race_id: &str, offset: usize) -> Option<u8> {
    if race_id.len() != 12 || !race_id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    race_id.get(offset..offset + 2)?.parse().ok()
}

/// Fill missing field sizes from the number of runners recorded per race.
pub fn fill_field_sizes(records: &mut [RaceRecord]) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for r in records.iter() {
        *counts.entry(r.race_id.clone()).or_default() += 1;
    }
    for r in records.iter_mut() {
        if r.field_size.is_none() {
            r.field_size = counts.get(&r.race_id).and_then(|&n| u8::try_from(n).ok());
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A finished flat-race record with sensible defaults.
    pub fn record(race_id: &str, date: NaiveDate, horse_id: &str, position: u8) -> RaceRecord {
        RaceRecord {
            race_id: race_id.to_string(),
            race_date: date,
            horse_id: horse_id.to_string(),
            jockey_id: Some(format!("j_{}", horse_id)),
            trainer_id: Some(format!("t_{}", horse_id)),
            place_id: 5,
            race_no: 11,
            hold_no: Some(1),
            hold_day: Some(4),
            distance: 1600,
            race_type: "芝".to_string(),
            turn: Some("左".to_string()),
            ground: Some("良".to_string()),
            weather: Some("晴".to_string()),
            field_size: Some(10),
            horse_no: position,
            frame_no: Some(1),
            sex: Some("牡".to_string()),
            age: Some(4),
            impost: Some(57.0),
            horse_weight: Some(480),
            weight_change: Some(0),
            finish_position: Some(position),
            finish_time: Some("1:34.5".to_string()),
            time_diff: Some(0.1 * position as f64),
            last_3f: Some(34.0),
            corner_pass: Some(format!("{}-{}", position + 1, position)),
            win_odds: Some(5.0),
            popularity: Some(position),
            prize: Some(1000.0),
        }
    }

    /// A complete pedigree with ancestors named after the horse.
    pub fn pedigree(horse_id: &str) -> Pedigree {
        Pedigree {
            horse_id: horse_id.to_string(),
            ancestors: PEDIGREE_COLUMNS.map(|c| Some(format!("{}_{}", c, horse_id))),
        }
    }

    pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }
}
