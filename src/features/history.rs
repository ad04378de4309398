//! Entity History Index
//!
//! Per-entity race histories sorted by date descending, queried as of a
//! race date. Only records strictly before the query date are ever returned.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::config::NormalizeConfig;
use crate::types::{Entity, RaceRecord};

/// How the time difference to the leader is normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeDiffPolicy {
    /// Keep the stored value, including the winner's negative lead.
    Raw,
    /// Winner's value is 0 (also when missing); other rows unchanged.
    #[default]
    ClampWinner,
    /// Every row clamped to >= 0, winner 0.
    ClampAll,
}

impl TimeDiffPolicy {
    fn apply(&self, time_diff: Option<f64>, finish_position: Option<u8>) -> Option<f64> {
        let is_winner = finish_position == Some(1);
        match self {
            TimeDiffPolicy::Raw => time_diff,
            TimeDiffPolicy::ClampWinner if is_winner => Some(0.0),
            TimeDiffPolicy::ClampWinner => time_diff,
            TimeDiffPolicy::ClampAll if is_winner => Some(0.0),
            TimeDiffPolicy::ClampAll => time_diff.map(|d| d.max(0.0)),
        }
    }
}

/// Numeric columns available to the window aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryColumn {
    ArrivingOrder,
    Popularity,
    Distance,
    GoalTime,
    TimeDiff,
    LastThreeFurlong,
    FirstCorner,
    LastCorner,
    Prize,
    HorseNo,
    FieldSize,
}

impl HistoryColumn {
    pub const COUNT: usize = 11;

    pub const ALL: [HistoryColumn; HistoryColumn::COUNT] = [
        HistoryColumn::ArrivingOrder,
        HistoryColumn::Popularity,
        HistoryColumn::Distance,
        HistoryColumn::GoalTime,
        HistoryColumn::TimeDiff,
        HistoryColumn::LastThreeFurlong,
        HistoryColumn::FirstCorner,
        HistoryColumn::LastCorner,
        HistoryColumn::Prize,
        HistoryColumn::HorseNo,
        HistoryColumn::FieldSize,
    ];

    /// Columns averaged over lookback windows
    pub const AVERAGED: [HistoryColumn; 9] = [
        HistoryColumn::ArrivingOrder,
        HistoryColumn::Popularity,
        HistoryColumn::Distance,
        HistoryColumn::GoalTime,
        HistoryColumn::TimeDiff,
        HistoryColumn::LastThreeFurlong,
        HistoryColumn::FirstCorner,
        HistoryColumn::LastCorner,
        HistoryColumn::Prize,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HistoryColumn::ArrivingOrder => "arriving_order",
            HistoryColumn::Popularity => "popularity",
            HistoryColumn::Distance => "distance",
            HistoryColumn::GoalTime => "goal_time",
            HistoryColumn::TimeDiff => "time_diff",
            HistoryColumn::LastThreeFurlong => "last_three_furlong",
            HistoryColumn::FirstCorner => "first_corner",
            HistoryColumn::LastCorner => "last_corner",
            HistoryColumn::Prize => "prize",
            HistoryColumn::HorseNo => "horse_no",
            HistoryColumn::FieldSize => "field_size",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// A race record reduced to normalized numeric columns.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub race_id: String,
    pub date: NaiveDate,
    pub horse_id: String,
    pub jockey_id: Option<String>,
    pub trainer_id: Option<String>,
    pub finish_position: Option<u8>,
    values: [Option<f64>; HistoryColumn::COUNT],
}

impl HistoryRecord {
    /// Empty record, mostly for building fixtures.
    pub fn new(race_id: &str, date: NaiveDate, horse_id: &str) -> Self {
        Self {
            race_id: race_id.to_string(),
            date,
            horse_id: horse_id.to_string(),
            jockey_id: None,
            trainer_id: None,
            finish_position: None,
            values: [None; HistoryColumn::COUNT],
        }
    }

    pub fn with(mut self, column: HistoryColumn, value: f64) -> Self {
        self.values[column.index()] = Some(value);
        self
    }

    /// Normalize a stored race record.
    pub fn from_record(record: &RaceRecord, config: &NormalizeConfig) -> Self {
        let field = record.field_size.filter(|&n| n > 0).map(f64::from);
        let relative = |v: Option<u8>| -> Option<f64> {
            let v = f64::from(v?);
            if config.relative_to_field {
                field.map(|n| v / n)
            } else {
                Some(v)
            }
        };

        let goal_time = record.finish_seconds().map(|secs| {
            if config.time_per_100m {
                secs / f64::from(record.distance) * 100.0
            } else {
                secs
            }
        });

        let mut values = [None; HistoryColumn::COUNT];
        values[HistoryColumn::ArrivingOrder.index()] = relative(record.finish_position);
        values[HistoryColumn::Popularity.index()] = relative(record.popularity);
        values[HistoryColumn::Distance.index()] = Some(f64::from(record.distance));
        values[HistoryColumn::GoalTime.index()] = goal_time;
        values[HistoryColumn::TimeDiff.index()] = config
            .time_diff
            .apply(record.time_diff, record.finish_position);
        values[HistoryColumn::LastThreeFurlong.index()] = record.last_3f;
        values[HistoryColumn::FirstCorner.index()] = relative(record.first_corner());
        values[HistoryColumn::LastCorner.index()] = relative(record.last_corner());
        values[HistoryColumn::Prize.index()] = Some(record.prize.unwrap_or(0.0));
        values[HistoryColumn::HorseNo.index()] = Some(f64::from(record.horse_no));
        values[HistoryColumn::FieldSize.index()] = field;

        Self {
            race_id: record.race_id.clone(),
            date: record.race_date,
            horse_id: record.horse_id.clone(),
            jockey_id: record.jockey_id.clone(),
            trainer_id: record.trainer_id.clone(),
            finish_position: record.finish_position,
            values,
        }
    }

    pub fn value(&self, column: HistoryColumn) -> Option<f64> {
        self.values[column.index()]
    }

    pub fn entity_id(&self, entity: Entity) -> Option<&str> {
        match entity {
            Entity::Horse => Some(self.horse_id.as_str()),
            Entity::Jockey => self.jockey_id.as_deref(),
            Entity::Trainer => self.trainer_id.as_deref(),
        }
    }
}

/// Histories indexed by entity id for as-of lookups
pub struct TemporalIndex {
    entity: Entity,
    /// entity id -> past records, sorted by date descending
    histories: HashMap<String, Vec<HistoryRecord>>,
}

impl TemporalIndex {
    /// Index already-normalized records under the given entity.
    pub fn build(entity: Entity, records: impl IntoIterator<Item = HistoryRecord>) -> Self {
        let mut histories: HashMap<String, Vec<HistoryRecord>> = HashMap::new();
        for record in records {
            if let Some(id) = record.entity_id(entity) {
                histories.entry(id.to_string()).or_default().push(record);
            }
        }

        // Most recent first; race id breaks same-day ties deterministically
        for records in histories.values_mut() {
            records.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| b.race_id.cmp(&a.race_id)));
            records.dedup_by(|a, b| a.race_id == b.race_id);
        }

        Self { entity, histories }
    }

    /// Normalize and index raw race records, skipping invalid ones.
    pub fn from_records(entity: Entity, records: &[RaceRecord], config: &NormalizeConfig) -> Self {
        let normalized = records.iter().filter_map(|r| match r.validate() {
            Ok(()) => Some(HistoryRecord::from_record(r, config)),
            Err(e) => {
                debug!("Skipping history record: {}", e);
                None
            }
        });
        Self::build(entity, normalized)
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    /// Records strictly before `as_of` for each requested entity, most recent first.
    ///
    /// Entities without prior records are absent from the result.
    pub fn history_before<'a, I, S>(
        &'a self,
        entity_ids: I,
        as_of: NaiveDate,
    ) -> BTreeMap<&'a str, &'a [HistoryRecord]>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut result = BTreeMap::new();
        for id in entity_ids {
            if let Some((key, records)) = self.histories.get_key_value(id.as_ref()) {
                let start = records.partition_point(|r| r.date >= as_of);
                if start < records.len() {
                    result.insert(key.as_str(), &records[start..]);
                }
            }
        }
        result
    }

    /// Records with `from <= date < until` for each requested entity, most recent first.
    pub fn history_between<'a, I, S>(
        &'a self,
        entity_ids: I,
        from: NaiveDate,
        until: NaiveDate,
    ) -> BTreeMap<&'a str, &'a [HistoryRecord]>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut result = BTreeMap::new();
        for id in entity_ids {
            if let Some((key, records)) = self.histories.get_key_value(id.as_ref()) {
                let start = records.partition_point(|r| r.date >= until);
                let end = records.partition_point(|r| r.date >= from);
                if start < end {
                    result.insert(key.as_str(), &records[start..end]);
                }
            }
        }
        result
    }

    /// Number of indexed entities
    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }
}
