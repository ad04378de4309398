//! SQLite repository for stored race results

use chrono::NaiveDate;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, Row};
use std::path::Path;
use tracing::debug;

use super::schema::create_tables;
use super::{RecordStore, ResultFilter};
use crate::error::Result;
use crate::types::{Entity, Pedigree, RaceRecord};

/// Ids bound per `IN (...)` query
const ID_CHUNK: usize = 500;

const SELECT_RECORDS: &str = r#"
    SELECT r.race_id, r.race_date, r.place_id, r.race_no, r.distance, r.race_type,
           r.turn, r.ground, r.weather, r.field_size, r.hold_no, r.hold_day,
           e.horse_no, e.horse_id, e.jockey_id, e.trainer_id, e.frame_no, e.sex, e.age,
           e.impost, e.horse_weight, e.weight_change, e.finish_position, e.finish_time,
           e.time_diff, e.last_3f, e.corner_pass, e.win_odds, e.popularity, e.prize
    FROM race_entries e
    JOIN races r ON r.race_id = e.race_id
"#;

/// Repository for stored race results
pub struct RaceRepository {
    conn: Connection,
}

impl RaceRepository {
    /// Create a new repository, initializing the database if needed
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        create_tables(&conn)?;

        Ok(Self { conn })
    }

    /// Create an in-memory repository (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        create_tables(&conn)?;
        Ok(Self { conn })
    }

    // ==================== Insert Operations ====================

    /// Upsert records in one transaction. Returns the number of entries written.
    pub fn insert_records(&mut self, records: &[RaceRecord]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        {
            let mut race_stmt = tx.prepare(
                r#"
                INSERT INTO races
                (race_id, race_date, place_id, race_no, distance, race_type,
                 turn, ground, weather, field_size, hold_no, hold_day)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT(race_id) DO UPDATE SET
                    race_date = excluded.race_date,
                    place_id = excluded.place_id,
                    race_no = excluded.race_no,
                    distance = excluded.distance,
                    race_type = excluded.race_type,
                    turn = excluded.turn,
                    ground = excluded.ground,
                    weather = excluded.weather,
                    field_size = excluded.field_size,
                    hold_no = excluded.hold_no,
                    hold_day = excluded.hold_day
                "#,
            )?;
            let mut entry_stmt = tx.prepare(
                r#"
                INSERT OR REPLACE INTO race_entries
                (race_id, horse_no, horse_id, jockey_id, trainer_id, frame_no, sex, age,
                 impost, horse_weight, weight_change, finish_position, finish_time,
                 time_diff, last_3f, corner_pass, win_odds, popularity, prize)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
                "#,
            )?;

            for r in records {
                r.validate()?;
                race_stmt.execute(params![
                    r.race_id,
                    r.race_date.format("%Y-%m-%d").to_string(),
                    r.place_id,
                    r.race_no,
                    r.distance,
                    r.race_type,
                    r.turn,
                    r.ground,
                    r.weather,
                    r.field_size,
                    r.hold_no,
                    r.hold_day,
                ])?;
                entry_stmt.execute(params![
                    r.race_id,
                    r.horse_no,
                    r.horse_id,
                    r.jockey_id,
                    r.trainer_id,
                    r.frame_no,
                    r.sex,
                    r.age,
                    r.impost,
                    r.horse_weight,
                    r.weight_change,
                    r.finish_position,
                    r.finish_time,
                    r.time_diff,
                    r.last_3f,
                    r.corner_pass,
                    r.win_odds,
                    r.popularity,
                    r.prize,
                ])?;
            }
        }
        tx.commit()?;

        debug!("Stored {} entries", records.len());
        Ok(records.len())
    }

    /// Upsert pedigrees in one transaction. Returns the number of horses written.
    pub fn insert_pedigrees(&mut self, pedigrees: &[Pedigree]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR REPLACE INTO pedigrees
                (horse_id, father, mother, fathers_father, fathers_mother,
                 mothers_father, mothers_mother)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )?;
            for p in pedigrees {
                let [a0, a1, a2, a3, a4, a5] = &p.ancestors;
                stmt.execute(params![p.horse_id, a0, a1, a2, a3, a4, a5])?;
            }
        }
        tx.commit()?;

        debug!("Stored {} pedigrees", pedigrees.len());
        Ok(pedigrees.len())
    }

    // ==================== Query Operations ====================

    /// Check if a race exists
    pub fn race_exists(&self, race_id: &str) -> Result<bool> {
        let count: i32 = self.conn.query_row(
            "SELECT COUNT(*) FROM races WHERE race_id = ?1",
            [race_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Get the last stored race date
    pub fn get_last_race_date(&self) -> Result<Option<NaiveDate>> {
        let result: Option<String> = self.conn.query_row(
            "SELECT MAX(race_date) FROM races",
            [],
            |row| row.get(0),
        )?;

        Ok(result.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()))
    }

    /// Get race count
    pub fn get_race_count(&self) -> Result<i32> {
        let count: i32 = self
            .conn
            .query_row("SELECT COUNT(*) FROM races", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Get runner count
    pub fn get_entry_count(&self) -> Result<i32> {
        let count: i32 = self
            .conn
            .query_row("SELECT COUNT(*) FROM race_entries", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Get pedigree count
    pub fn get_pedigree_count(&self) -> Result<i32> {
        let count: i32 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pedigrees", [], |row| row.get(0))?;
        Ok(count)
    }

    fn query_records(&self, sql: &str, args: Vec<Value>) -> Result<Vec<RaceRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let records = stmt
            .query_map(params_from_iter(args.iter()), record_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

impl RecordStore for RaceRepository {
    fn select_results(&self, filter: &ResultFilter) -> Result<Vec<RaceRecord>> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut args: Vec<Value> = Vec::new();

        if let Some(begin) = filter.begin {
            conditions.push("r.race_date >= ?");
            args.push(Value::Text(begin.format("%Y-%m-%d").to_string()));
        }
        if let Some(end) = filter.end {
            conditions.push("r.race_date <= ?");
            args.push(Value::Text(end.format("%Y-%m-%d").to_string()));
        }
        if filter.flat_only {
            conditions.push("r.race_type <> '障害'");
        }
        if let Some(place_id) = filter.place_id {
            conditions.push("r.place_id = ?");
            args.push(Value::Integer(i64::from(place_id)));
        }
        if let Some(race_type) = &filter.race_type {
            conditions.push("r.race_type = ?");
            args.push(Value::Text(race_type.clone()));
        }
        if let Some(distance) = filter.distance {
            conditions.push("r.distance = ?");
            args.push(Value::Integer(i64::from(distance)));
        }

        let mut sql = SELECT_RECORDS.to_string();
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY r.race_date, r.race_id, e.horse_no");

        self.query_records(&sql, args)
    }

    fn select_entity_history(&self, entity: Entity, ids: &[String]) -> Result<Vec<RaceRecord>> {
        let mut records = Vec::new();
        for chunk in ids.chunks(ID_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "{} WHERE e.{} IN ({})",
                SELECT_RECORDS,
                entity.id_column(),
                placeholders
            );
            let args = chunk.iter().map(|id| Value::Text(id.clone())).collect();
            records.extend(self.query_records(&sql, args)?);
        }
        debug!("Loaded {} {} history rows for {} ids", records.len(), entity, ids.len());
        Ok(records)
    }

    fn select_pedigrees(&self, horse_ids: &[String]) -> Result<Vec<Pedigree>> {
        let mut pedigrees = Vec::new();
        for chunk in horse_ids.chunks(ID_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT horse_id, father, mother, fathers_father, fathers_mother, \
                 mothers_father, mothers_mother FROM pedigrees WHERE horse_id IN ({})",
                placeholders
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), |row| {
                    Ok(Pedigree {
                        horse_id: row.get(0)?,
                        ancestors: [
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ],
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            pedigrees.extend(rows);
        }
        Ok(pedigrees)
    }
}

fn record_from_row(row: &Row) -> rusqlite::Result<RaceRecord> {
    let date_str: String = row.get(1)?;
    let race_date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;

    Ok(RaceRecord {
        race_id: row.get(0)?,
        race_date,
        place_id: row.get(2)?,
        race_no: row.get(3)?,
        distance: row.get(4)?,
        race_type: row.get(5)?,
        turn: row.get(6)?,
        ground: row.get(7)?,
        weather: row.get(8)?,
        field_size: row.get(9)?,
        hold_no: row.get(10)?,
        hold_day: row.get(11)?,
        horse_no: row.get(12)?,
        horse_id: row.get(13)?,
        jockey_id: row.get(14)?,
        trainer_id: row.get(15)?,
        frame_no: row.get(16)?,
        sex: row.get(17)?,
        age: row.get(18)?,
        impost: row.get(19)?,
        horse_weight: row.get(20)?,
        weight_change: row.get(21)?,
        finish_position: row.get(22)?,
        finish_time: row.get(23)?,
        time_diff: row.get(24)?,
        last_3f: row.get(25)?,
        corner_pass: row.get(26)?,
        win_odds: row.get(27)?,
        popularity: row.get(28)?,
        prize: row.get(29)?,
    })
}
