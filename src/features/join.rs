//! As-of join of entity histories onto race-day runner rows.
//!
//! Each distinct race date is processed on its own: the horses (and jockeys)
//! running that day are looked up in the history indexes as of that date,
//! window and positional blocks are computed, and the blocks are left-joined
//! onto the day's runners. Dates never share state, so they can run in
//! parallel; results are merged in ascending date order.

use chrono::{Datelike, Duration, NaiveDate};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

use crate::config::FeatureConfig;
use crate::error::{FeatureError, Result};
use crate::features::history::{HistoryColumn, HistoryRecord, TemporalIndex};
use crate::features::window::{aggregate, aggregate_names, nth_most_recent, positional_names};
use crate::types::{Entity, RaceRecord};

/// Race attributes of a runner row, in model input order.
pub const BASE_COLUMNS: [&str; 14] = [
    "horse_no",
    "frame_no",
    "impost",
    "place_id",
    "race_no",
    "hold_no",
    "hold_day",
    "distance",
    "field_size",
    "month",
    "age",
    "weight",
    "weight_change",
    "win_prize",
];

/// Columns averaged over each jockey's prior rides
pub const JOCKEY_COLUMNS: [HistoryColumn; 3] = [
    HistoryColumn::ArrivingOrder,
    HistoryColumn::Popularity,
    HistoryColumn::TimeDiff,
];

/// A runner's own race attributes, before any history is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerRow {
    pub record: RaceRecord,
    /// Parsed finish time (regression label)
    pub finish_seconds: Option<f64>,
    /// Values for `BASE_COLUMNS`
    pub base: Vec<f64>,
}

impl RunnerRow {
    /// Build the row. A record failing validation, or with a finish time that is
    /// present but unparsable, is malformed.
    pub fn build(record: &RaceRecord, win_prize: Option<f64>) -> Result<Self> {
        record
            .validate()
            .map_err(|e| FeatureError::malformed(&record.race_id, e.to_string()))?;

        let finish_seconds = match record.finish_time.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(text) => Some(crate::types::parse_finish_time(text).ok_or_else(|| {
                FeatureError::malformed(
                    &record.race_id,
                    format!("unparsable finish time '{}' for horse {}", text, record.horse_id),
                )
            })?),
        };

        let opt = |v: Option<f64>| v.unwrap_or(f64::NAN);
        let base = vec![
            f64::from(record.horse_no),
            opt(record.frame_no.map(f64::from)),
            opt(record.impost),
            f64::from(record.place_id),
            f64::from(record.race_no),
            opt(record.hold_no.map(f64::from)),
            opt(record.hold_day.map(f64::from)),
            f64::from(record.distance),
            opt(record.field_size.map(f64::from)),
            f64::from(record.race_date.month()),
            opt(record.age.map(f64::from)),
            opt(record.horse_weight.map(f64::from)),
            opt(record.weight_change.map(f64::from)),
            opt(win_prize),
        ];

        Ok(Self {
            record: record.clone(),
            finish_seconds,
            base,
        })
    }
}

/// A runner row with its history features attached.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRow {
    pub runner: RunnerRow,
    /// Values for `AsOfJoin::feature_names`
    pub features: Vec<f64>,
}

/// A race date excluded from the output.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedDate {
    pub date: NaiveDate,
    pub reason: String,
}

/// Result of a full join run.
#[derive(Debug, Clone, Default)]
pub struct JoinOutput {
    pub rows: Vec<JoinedRow>,
    pub skipped: Vec<SkippedDate>,
    pub dates_processed: usize,
}

/// As-of join engine over immutable history indexes
pub struct AsOfJoin<'a> {
    horses: &'a TemporalIndex,
    jockeys: Option<&'a TemporalIndex>,
    config: &'a FeatureConfig,
    feature_names: Vec<String>,
}

impl<'a> AsOfJoin<'a> {
    pub fn new(
        horses: &'a TemporalIndex,
        jockeys: Option<&'a TemporalIndex>,
        config: &'a FeatureConfig,
    ) -> Result<Self> {
        if horses.entity() != Entity::Horse {
            return Err(FeatureError::invalid_argument(format!(
                "horse features need a horse index, got {}",
                horses.entity()
            )));
        }
        if let Some(j) = jockeys {
            if j.entity() != Entity::Jockey {
                return Err(FeatureError::invalid_argument(format!(
                    "jockey features need a jockey index, got {}",
                    j.entity()
                )));
            }
        }

        let feature_names = Self::names_for(config, jockeys.is_some());
        Ok(Self {
            horses,
            jockeys,
            config,
            feature_names,
        })
    }

    fn names_for(config: &FeatureConfig, with_jockeys: bool) -> Vec<String> {
        let mut names = Vec::new();
        if config.days_since_last {
            names.push("l_days".to_string());
        }
        for window in &config.horse_windows {
            names.extend(aggregate_names(*window, &HistoryColumn::AVERAGED));
        }
        for k in 1..=config.positional_depth {
            names.extend(positional_names(k, &HistoryColumn::ALL));
        }
        if with_jockeys {
            for window in &config.jockey_windows {
                names.extend(
                    aggregate_names(*window, &JOCKEY_COLUMNS)
                        .into_iter()
                        .map(|n| format!("jockey_{}", n)),
                );
            }
            if config.jockey_trailing_days > 0 {
                let days = config.jockey_trailing_days;
                names.push(format!("jockey_place_rate_{}d", days));
                names.push(format!("jockey_rides_{}d", days));
            }
        }
        names
    }

    /// Names of the history feature columns, in `JoinedRow::features` order.
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Join every race date in `records`.
    ///
    /// A date whose rows cannot be built is skipped with a warning; all other
    /// dates are unaffected. Invalid arguments abort the run.
    pub fn join_all(&self, records: &[RaceRecord]) -> Result<JoinOutput> {
        let mut by_date: BTreeMap<NaiveDate, Vec<&RaceRecord>> = BTreeMap::new();
        for record in records {
            by_date.entry(record.race_date).or_default().push(record);
        }
        let dates: Vec<(NaiveDate, Vec<&RaceRecord>)> = by_date.into_iter().collect();
        info!("Joining history for {} race dates", dates.len());

        let results: Vec<(NaiveDate, Result<Vec<JoinedRow>>)> = if self.config.parallel {
            dates
                .par_iter()
                .map(|(date, runners)| (*date, self.join_date(*date, runners)))
                .collect()
        } else {
            dates
                .iter()
                .map(|(date, runners)| (*date, self.join_date(*date, runners)))
                .collect()
        };

        let mut output = JoinOutput {
            dates_processed: results.len(),
            ..Default::default()
        };
        for (date, result) in results {
            match result {
                Ok(rows) => output.rows.extend(rows),
                Err(e) if e.is_invalid_argument() => return Err(e),
                Err(e) => {
                    warn!("Skipping race date {}: {}", date, e);
                    output.skipped.push(SkippedDate {
                        date,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Joined {} rows over {} dates ({} skipped)",
            output.rows.len(),
            output.dates_processed,
            output.skipped.len()
        );
        Ok(output)
    }

    /// Join the runners of one race date. Every runner is kept.
    pub fn join_date(&self, date: NaiveDate, runners: &[&RaceRecord]) -> Result<Vec<JoinedRow>> {
        if let Some(r) = runners.iter().find(|r| r.race_date != date) {
            return Err(FeatureError::invalid_argument(format!(
                "runner of race {} dated {} passed for {}",
                r.race_id, r.race_date, date
            )));
        }

        let mut win_prizes: HashMap<&str, f64> = HashMap::new();
        for r in runners {
            if let Some(prize) = r.prize {
                let best = win_prizes.entry(r.race_id.as_str()).or_insert(prize);
                *best = best.max(prize);
            }
        }

        let mut rows = runners
            .iter()
            .map(|r| RunnerRow::build(r, win_prizes.get(r.race_id.as_str()).copied()))
            .collect::<Result<Vec<_>>>()?;
        rows.sort_by(|a, b| {
            a.record
                .race_id
                .cmp(&b.record.race_id)
                .then_with(|| a.record.horse_no.cmp(&b.record.horse_no))
        });

        let horse_ids: BTreeSet<&str> = rows.iter().map(|r| r.record.horse_id.as_str()).collect();
        let horse_history = self.horses.history_before(&horse_ids, date);
        debug!(
            "{}: {} runners, {} horses with history",
            date,
            rows.len(),
            horse_history.len()
        );

        let jockey_ids: BTreeSet<&str> = rows
            .iter()
            .filter_map(|r| r.record.jockey_id.as_deref())
            .collect();
        let (jockey_history, jockey_recent) = match self.jockeys {
            Some(index) => {
                let recent = if self.config.jockey_trailing_days > 0 {
                    let from = date - Duration::days(i64::from(self.config.jockey_trailing_days));
                    index.history_between(&jockey_ids, from, date)
                } else {
                    BTreeMap::new()
                };
                (index.history_before(&jockey_ids, date), recent)
            }
            None => (BTreeMap::new(), BTreeMap::new()),
        };

        let mut joined = Vec::with_capacity(rows.len());
        for runner in rows {
            let horse: &[HistoryRecord] = horse_history
                .get(runner.record.horse_id.as_str())
                .copied()
                .unwrap_or(&[]);
            let jockey_id = runner.record.jockey_id.as_deref().unwrap_or_default();
            let jockey: &[HistoryRecord] = jockey_history.get(jockey_id).copied().unwrap_or(&[]);
            let recent: &[HistoryRecord] = jockey_recent.get(jockey_id).copied().unwrap_or(&[]);

            let features = self.features_for(date, horse, jockey, recent)?;
            debug_assert_eq!(features.len(), self.feature_names.len());
            joined.push(JoinedRow { runner, features });
        }
        Ok(joined)
    }

    fn features_for(
        &self,
        date: NaiveDate,
        horse: &[HistoryRecord],
        jockey: &[HistoryRecord],
        jockey_recent: &[HistoryRecord],
    ) -> Result<Vec<f64>> {
        let mut features = Vec::with_capacity(self.feature_names.len());

        if self.config.days_since_last {
            let l_days = horse
                .first()
                .map(|last| (date - last.date).num_days() as f64)
                .unwrap_or(f64::NAN);
            features.push(l_days);
        }
        for window in &self.config.horse_windows {
            features.extend(aggregate(horse, *window, &HistoryColumn::AVERAGED).values());
        }
        for k in 1..=self.config.positional_depth {
            features.extend(nth_most_recent(horse, k, &HistoryColumn::ALL)?.values());
        }

        if self.jockeys.is_some() {
            for window in &self.config.jockey_windows {
                features.extend(aggregate(jockey, *window, &JOCKEY_COLUMNS).values());
            }
            if self.config.jockey_trailing_days > 0 {
                let (rate, rides) = place_rate(jockey_recent);
                features.push(rate);
                features.push(rides);
            }
        }

        Ok(features)
    }
}

/// Place rate and ride count over finished rides; NaN for both without rides.
fn place_rate(rides: &[HistoryRecord]) -> (f64, f64) {
    let finished: Vec<u8> = rides.iter().filter_map(|r| r.finish_position).collect();
    if finished.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let placed = finished.iter().filter(|&&p| p <= 3).count() as f64;
    let n = finished.len() as f64;
    (placed / n, n)
}
