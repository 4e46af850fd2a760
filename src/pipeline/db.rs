//! Trend store: append-only log of readings and their predictions
//!
//! Tables (one set per line):
//! - `<line>_trend` - INSERT per ingested reading, row id is the cycle id
//! - `<line>_prediction` - INSERT per resolved prediction, keyed by `reading_id`
//!   and carrying the same `trend_time` as its reading

use super::error::StoreError;
use super::pool::SqlitePool;
use super::types::{
    format_trend_time, CycleId, Line, Measurements, PredictionRecord, RawReading, TrendRecord,
};
use async_trait::async_trait;
use rusqlite::{params_from_iter, types::Value, Connection, Row};
use serde::Serialize;
use std::path::Path;

/// Trait for persisting trend rows
#[async_trait]
pub trait TrendStore: Send + Sync {
    /// Append a reading and return its cycle id
    async fn insert_reading(&self, record: &TrendRecord) -> Result<CycleId, StoreError>;

    /// Append the prediction for a previously inserted reading
    async fn insert_prediction(&self, record: &PredictionRecord) -> Result<(), StoreError>;

    /// Most recent readings with their predictions, newest first
    async fn recent_trend(&self, line: Line, limit: usize) -> Result<Vec<TrendRow>, StoreError>;
}

/// Reading joined with its prediction (if one was recorded)
#[derive(Debug, Clone, Serialize)]
pub struct TrendRow {
    pub cycle_id: CycleId,
    pub trend_time: String,
    pub reading: RawReading,
    pub prediction: Option<i64>,
}

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "01_press_trend",
        "CREATE TABLE IF NOT EXISTS press_trend (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_idx INTEGER NOT NULL,
            machine_name TEXT NOT NULL,
            item_no TEXT NOT NULL,
            working_time TEXT NOT NULL,
            press_time_ms REAL NOT NULL,
            pressure_1 REAL NOT NULL,
            pressure_2 REAL NOT NULL,
            pressure_5 REAL NOT NULL,
            trend_time TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_press_trend_time ON press_trend(trend_time);",
    ),
    (
        "02_welding_trend",
        "CREATE TABLE IF NOT EXISTS welding_trend (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_idx INTEGER NOT NULL,
            machine_name TEXT NOT NULL,
            item_no TEXT NOT NULL,
            working_time TEXT NOT NULL,
            thickness_1_mm REAL NOT NULL,
            thickness_2_mm REAL NOT NULL,
            welding_force_bar REAL NOT NULL,
            welding_current_ka REAL NOT NULL,
            weld_voltage_v REAL NOT NULL,
            weld_time_ms REAL NOT NULL,
            trend_time TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_welding_trend_time ON welding_trend(trend_time);",
    ),
    (
        "03_press_prediction",
        "CREATE TABLE IF NOT EXISTS press_prediction (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            reading_id INTEGER NOT NULL UNIQUE REFERENCES press_trend(id),
            trend_time TEXT NOT NULL,
            prediction INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );",
    ),
    (
        "04_welding_prediction",
        "CREATE TABLE IF NOT EXISTS welding_prediction (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            reading_id INTEGER NOT NULL UNIQUE REFERENCES welding_trend(id),
            trend_time TEXT NOT NULL,
            prediction INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );",
    ),
];

/// Run schema migrations
///
/// Idempotent: every statement uses `IF NOT EXISTS`. Enables WAL mode so
/// the dashboard's trend queries do not block ingestion writes.
pub fn run_schema_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    log::info!("📊 Trend database journal mode: {}", mode);

    let tx = conn.transaction()?;
    for (name, sql) in MIGRATIONS {
        log::debug!("   ├─ Executing migration: {}", name);
        tx.execute_batch(sql)
            .map_err(|e| StoreError::Migration(format!("{}: {}", name, e)))?;
    }
    tx.commit()?;

    log::info!("✅ Trend schema ready ({} migrations)", MIGRATIONS.len());
    Ok(())
}

/// SQLite implementation of TrendStore
pub struct SqliteTrendStore {
    pool: SqlitePool,
}

impl SqliteTrendStore {
    /// Open the trend database, creating parent directories and schema
    pub fn open(db_path: impl AsRef<Path>, pool_size: usize) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Migration(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let pool = SqlitePool::with_setup(db_path, pool_size, |conn| {
            conn.busy_timeout(std::time::Duration::from_secs(5))
        });

        {
            let mut conn = pool.acquire()?;
            run_schema_migrations(&mut conn)?;
        }

        Ok(Self { pool })
    }

    /// Count rows in a trend or prediction table
    pub fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        let conn = self.pool.acquire()?;
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    /// Predictions for a line in insert order: `(reading_id, trend_time, prediction)`
    pub fn predictions(&self, line: Line) -> Result<Vec<(CycleId, String, i64)>, StoreError> {
        let conn = self.pool.acquire()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT reading_id, trend_time, prediction FROM {} ORDER BY id ASC",
            line.prediction_table()
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Readings for a line in insert order: `(cycle_id, trend_time)`
    pub fn readings(&self, line: Line) -> Result<Vec<(CycleId, String)>, StoreError> {
        let conn = self.pool.acquire()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, trend_time FROM {} ORDER BY id ASC",
            line.trend_table()
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[async_trait]
impl TrendStore for SqliteTrendStore {
    async fn insert_reading(&self, record: &TrendRecord) -> Result<CycleId, StoreError> {
        let reading = &record.reading;
        let line = reading.line();
        let conn = self.pool.acquire()?;

        let measurement_columns = line.measurement_columns();
        let placeholders: Vec<String> = (1..=measurement_columns.len() + 5)
            .map(|i| format!("?{}", i))
            .collect();
        let sql = format!(
            "INSERT INTO {} (source_idx, machine_name, item_no, working_time, {}, trend_time)
             VALUES ({})",
            line.trend_table(),
            measurement_columns.join(", "),
            placeholders.join(", ")
        );

        let mut values: Vec<Value> = vec![
            Value::Integer(reading.idx),
            Value::Text(reading.machine_name.clone()),
            Value::Text(reading.item_no.clone()),
            Value::Text(reading.working_time.clone()),
        ];
        values.extend(reading.measurements.values().into_iter().map(Value::Real));
        values.push(Value::Text(format_trend_time(&record.trend_time)));

        conn.execute(&sql, params_from_iter(values))?;
        Ok(conn.last_insert_rowid())
    }

    async fn insert_prediction(&self, record: &PredictionRecord) -> Result<(), StoreError> {
        let conn = self.pool.acquire()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (reading_id, trend_time, prediction, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                record.line.prediction_table()
            ),
            rusqlite::params![
                record.cycle_id,
                format_trend_time(&record.trend_time),
                record.prediction,
                chrono::Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    async fn recent_trend(&self, line: Line, limit: usize) -> Result<Vec<TrendRow>, StoreError> {
        let conn = self.pool.acquire()?;
        let measurement_columns: Vec<String> = line
            .measurement_columns()
            .iter()
            .map(|c| format!("t.{}", c))
            .collect();
        let sql = format!(
            "SELECT t.id, t.trend_time, t.source_idx, t.machine_name, t.item_no, t.working_time,
                    {}, p.prediction
             FROM {} t
             LEFT JOIN {} p ON p.reading_id = t.id
             ORDER BY t.id DESC
             LIMIT ?1",
            measurement_columns.join(", "),
            line.trend_table(),
            line.prediction_table()
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([limit as i64], |row| map_trend_row(line, row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn map_trend_row(line: Line, row: &Row<'_>) -> rusqlite::Result<TrendRow> {
    let m = 6;
    let measurements = match line {
        Line::Press => Measurements::Press {
            press_time_ms: row.get(m)?,
            pressure_1: row.get(m + 1)?,
            pressure_2: row.get(m + 2)?,
            pressure_5: row.get(m + 3)?,
        },
        Line::Welding => Measurements::Welding {
            thickness_1_mm: row.get(m)?,
            thickness_2_mm: row.get(m + 1)?,
            welding_force_bar: row.get(m + 2)?,
            welding_current_ka: row.get(m + 3)?,
            weld_voltage_v: row.get(m + 4)?,
            weld_time_ms: row.get(m + 5)?,
        },
    };
    let prediction_col = m + line.measurement_columns().len();

    Ok(TrendRow {
        cycle_id: row.get(0)?,
        trend_time: row.get(1)?,
        reading: RawReading {
            idx: row.get(2)?,
            machine_name: row.get(3)?,
            item_no: row.get(4)?,
            working_time: row.get(5)?,
            measurements,
        },
        prediction: row.get(prediction_col)?,
    })
}
