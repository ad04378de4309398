//! SQLite schema for stored race results
//!
//! Tables:
//! - races: race conditions, one row per race
//! - race_entries: runners with their results
//! - pedigrees: ancestors of each horse, two generations back

use rusqlite::{Connection, Result};

/// Create all tables in the database
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS races (
            race_id TEXT PRIMARY KEY,
            race_date TEXT NOT NULL,
            place_id INTEGER NOT NULL,
            race_no INTEGER NOT NULL,
            hold_no INTEGER,
            hold_day INTEGER,
            distance INTEGER NOT NULL CHECK (distance > 0),
            race_type TEXT NOT NULL,
            turn TEXT,
            ground TEXT,
            weather TEXT,
            field_size INTEGER,
            created_at TEXT DEFAULT (datetime('now'))
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS race_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            race_id TEXT NOT NULL REFERENCES races(race_id),
            horse_no INTEGER NOT NULL,
            horse_id TEXT NOT NULL,
            jockey_id TEXT,
            trainer_id TEXT,
            frame_no INTEGER,
            sex TEXT,
            age INTEGER,
            impost REAL,
            horse_weight INTEGER,
            weight_change INTEGER,
            finish_position INTEGER CHECK (finish_position IS NULL OR finish_position > 0),
            finish_time TEXT,
            time_diff REAL,
            last_3f REAL,
            corner_pass TEXT,
            win_odds REAL,
            popularity INTEGER,
            prize REAL,
            UNIQUE(race_id, horse_no)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS pedigrees (
            horse_id TEXT PRIMARY KEY,
            father TEXT,
            mother TEXT,
            fathers_father TEXT,
            fathers_mother TEXT,
            mothers_father TEXT,
            mothers_mother TEXT
        )
        "#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_races_date ON races(race_date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_race_entries_race ON race_entries(race_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_race_entries_horse ON race_entries(horse_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_race_entries_jockey ON race_entries(jockey_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_race_entries_trainer ON race_entries(trainer_id)",
        [],
    )?;

    Ok(())
}
