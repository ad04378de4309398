//! Record storage for race results.
//!
//! Feature building only reads through `RecordStore`; the SQLite repository
//! and the in-memory store are the two implementations.

pub mod csv;
pub mod repository;
pub mod schema;

use chrono::NaiveDate;

use crate::error::Result;
use crate::types::{Entity, Pedigree, RaceRecord};

pub use csv::{pedigrees_from_csv, records_from_csv};
pub use repository::RaceRepository;
pub use schema::create_tables;

/// Selection of target races.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultFilter {
    /// First race date, inclusive
    pub begin: Option<NaiveDate>,
    /// Last race date, inclusive
    pub end: Option<NaiveDate>,
    /// Exclude jump races
    pub flat_only: bool,
    pub place_id: Option<u8>,
    pub race_type: Option<String>,
    pub distance: Option<u32>,
}

impl ResultFilter {
    pub fn between(begin: NaiveDate, end: NaiveDate) -> Self {
        Self {
            begin: Some(begin),
            end: Some(end),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &RaceRecord) -> bool {
        self.begin.map_or(true, |d| record.race_date >= d)
            && self.end.map_or(true, |d| record.race_date <= d)
            && (!self.flat_only || record.is_flat())
            && self.place_id.map_or(true, |p| record.place_id == p)
            && self.race_type.as_deref().map_or(true, |t| record.race_type == t)
            && self.distance.map_or(true, |d| record.distance == d)
    }
}

/// Read access to stored race records.
pub trait RecordStore {
    /// Runner rows of the races matching `filter`, ordered by date, race and horse number.
    fn select_results(&self, filter: &ResultFilter) -> Result<Vec<RaceRecord>>;

    /// Every stored record of the given entities, in any order.
    fn select_entity_history(&self, entity: Entity, ids: &[String]) -> Result<Vec<RaceRecord>>;

    /// Stored pedigrees of the given horses; horses without one are absent.
    fn select_pedigrees(&self, horse_ids: &[String]) -> Result<Vec<Pedigree>>;
}

/// Records held in memory; used for CSV input and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Vec<RaceRecord>,
    pedigrees: Vec<Pedigree>,
}

impl MemoryStore {
    pub fn new(records: Vec<RaceRecord>) -> Self {
        Self {
            records,
            pedigrees: Vec::new(),
        }
    }

    pub fn with_pedigrees(mut self, pedigrees: Vec<Pedigree>) -> Self {
        self.pedigrees = pedigrees;
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordStore for MemoryStore {
    fn select_results(&self, filter: &ResultFilter) -> Result<Vec<RaceRecord>> {
        let mut selected: Vec<RaceRecord> = self
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        selected.sort_by(|a, b| {
            (a.race_date, &a.race_id, a.horse_no).cmp(&(b.race_date, &b.race_id, b.horse_no))
        });
        Ok(selected)
    }

    fn select_entity_history(&self, entity: Entity, ids: &[String]) -> Result<Vec<RaceRecord>> {
        let wanted: std::collections::HashSet<&str> = ids.iter().map(String::as_str).collect();
        Ok(self
            .records
            .iter()
            .filter(|r| entity.id_of(r).is_some_and(|id| wanted.contains(id)))
            .cloned()
            .collect())
    }

    fn select_pedigrees(&self, horse_ids: &[String]) -> Result<Vec<Pedigree>> {
        let wanted: std::collections::HashSet<&str> = horse_ids.iter().map(String::as_str).collect();
        Ok(self
            .pedigrees
            .iter()
            .filter(|p| wanted.contains(p.horse_id.as_str()))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::{date, pedigree, record};

    fn store() -> MemoryStore {
        let mut jump = record("r3", date(2024, 3, 3), "h1", 2);
        jump.race_type = "障害".to_string();
        MemoryStore::new(vec![
            record("r2", date(2024, 2, 4), "h2", 1),
            record("r1", date(2024, 1, 7), "h1", 1),
            jump,
        ])
    }

    #[test]
    fn test_select_results_filter() {
        let store = store();
        let all = store.select_results(&ResultFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].race_id, "r1");

        let flat = ResultFilter {
            flat_only: true,
            ..Default::default()
        };
        assert_eq!(store.select_results(&flat).unwrap().len(), 2);

        let feb = ResultFilter::between(date(2024, 2, 1), date(2024, 2, 29));
        let rows = store.select_results(&feb).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].horse_id, "h2");
    }

    #[test]
    fn test_select_entity_history() {
        let store = store();
        let rows = store
            .select_entity_history(Entity::Horse, &["h1".to_string()])
            .unwrap();
        assert_eq!(rows.len(), 2);

        let rows = store
            .select_entity_history(Entity::Jockey, &["j_h2".to_string()])
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_select_pedigrees() {
        let store = store().with_pedigrees(vec![pedigree("h1"), pedigree("h2")]);
        let peds = store.select_pedigrees(&["h2".to_string(), "h7".to_string()]).unwrap();
        assert_eq!(peds, vec![pedigree("h2")]);
    }
}
