//! Read-only access to the upstream `<line>_raw_data` tables
//!
//! One row per call: the poller asks for the row at its cursor position and
//! either gets it back or learns the table is exhausted at that position.

use super::cursor::CursorPosition;
use super::error::SourceError;
use super::pool::SqlitePool;
use super::types::{Line, Measurements, RawReading};
use async_trait::async_trait;
use rusqlite::{OptionalExtension, Row};
use std::path::Path;

#[async_trait]
pub trait RawDataSource: Send + Sync {
    /// Fetch the single row at `position` for `line`, `None` when exhausted
    async fn fetch_next(
        &self,
        line: Line,
        position: CursorPosition,
    ) -> Result<Option<RawReading>, SourceError>;
}

/// SQLite raw source backed by a read-only connection pool
pub struct SqliteRawSource {
    pool: SqlitePool,
}

impl SqliteRawSource {
    pub fn new(db_path: impl AsRef<Path>, pool_size: usize) -> Self {
        let pool = SqlitePool::with_setup(db_path, pool_size, |conn| {
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            // Prevent write locks on the upstream database
            conn.execute_batch("PRAGMA query_only = ON")
        });
        Self { pool }
    }

    /// Verify the raw tables for `lines` exist with every expected column
    ///
    /// A mismatch here is a deployment error and is meant to stop startup.
    pub fn validate_schema(&self, lines: &[Line]) -> Result<(), SourceError> {
        let conn = self.pool.acquire()?;

        for line in lines {
            let table = line.raw_table();
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
            let columns: Vec<String> = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<_, _>>()?;

            if columns.is_empty() {
                return Err(SourceError::SchemaMismatch {
                    table: table.to_string(),
                    detail: "table does not exist".to_string(),
                });
            }

            let missing: Vec<&str> = expected_columns(*line)
                .into_iter()
                .filter(|c| !columns.iter().any(|have| have == c))
                .collect();

            if !missing.is_empty() {
                return Err(SourceError::SchemaMismatch {
                    table: table.to_string(),
                    detail: format!("missing columns: {}", missing.join(", ")),
                });
            }

            log::info!("   ├─ Raw table OK: {} ({} columns)", table, columns.len());
        }

        Ok(())
    }
}

#[async_trait]
impl RawDataSource for SqliteRawSource {
    async fn fetch_next(
        &self,
        line: Line,
        position: CursorPosition,
    ) -> Result<Option<RawReading>, SourceError> {
        let conn = self.pool.acquire()?;
        let columns = expected_columns(line).join(", ");
        let table = line.raw_table();

        let reading = match position {
            CursorPosition::Offset(offset) => {
                let sql = format!(
                    "SELECT {} FROM {} ORDER BY idx ASC LIMIT 1 OFFSET ?1",
                    columns, table
                );
                conn.query_row(&sql, [offset as i64], |row| map_row(line, row))
                    .optional()
            }
            CursorPosition::After(watermark) => {
                let sql = format!(
                    "SELECT {} FROM {} WHERE idx > ?1 ORDER BY idx ASC LIMIT 1",
                    columns, table
                );
                conn.query_row(&sql, [watermark], |row| map_row(line, row))
                    .optional()
            }
        };

        match reading {
            Ok(reading) => Ok(reading),
            Err(e) => {
                // Upstream may have been swapped or locked; reopen next time
                conn.discard();
                Err(e.into())
            }
        }
    }
}

fn expected_columns(line: Line) -> Vec<&'static str> {
    let mut columns = vec!["idx", "machine_name", "item_no", "working_time"];
    columns.extend_from_slice(line.measurement_columns());
    columns
}

fn map_row(line: Line, row: &Row<'_>) -> rusqlite::Result<RawReading> {
    let measurements = match line {
        Line::Press => Measurements::Press {
            press_time_ms: row.get(4)?,
            pressure_1: row.get(5)?,
            pressure_2: row.get(6)?,
            pressure_5: row.get(7)?,
        },
        Line::Welding => Measurements::Welding {
            thickness_1_mm: row.get(4)?,
            thickness_2_mm: row.get(5)?,
            welding_force_bar: row.get(6)?,
            welding_current_ka: row.get(7)?,
            weld_voltage_v: row.get(8)?,
            weld_time_ms: row.get(9)?,
        },
    };

    Ok(RawReading {
        idx: row.get(0)?,
        machine_name: row.get(1)?,
        item_no: row.get(2)?,
        working_time: row.get(3)?,
        measurements,
    })
}

/// Schema and seed helpers shared by unit and integration tests
#[doc(hidden)]
pub mod fixtures {
    use super::Line;
    use rusqlite::{params, Connection};
    use std::path::Path;

    pub fn create_raw_tables(db_path: &Path) -> rusqlite::Result<()> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS press_raw_data (
                idx INTEGER PRIMARY KEY AUTOINCREMENT,
                machine_name TEXT NOT NULL,
                item_no TEXT NOT NULL,
                working_time TEXT NOT NULL,
                press_time_ms REAL NOT NULL,
                pressure_1 REAL NOT NULL,
                pressure_2 REAL NOT NULL,
                pressure_5 REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS welding_raw_data (
                idx INTEGER PRIMARY KEY AUTOINCREMENT,
                machine_name TEXT NOT NULL,
                item_no TEXT NOT NULL,
                working_time TEXT NOT NULL,
                thickness_1_mm REAL NOT NULL,
                thickness_2_mm REAL NOT NULL,
                welding_force_bar REAL NOT NULL,
                welding_current_ka REAL NOT NULL,
                weld_voltage_v REAL NOT NULL,
                weld_time_ms REAL NOT NULL
            );",
        )
    }

    /// Insert `count` synthetic rows; measurement values grow with the row number
    pub fn seed_rows(db_path: &Path, line: Line, count: usize) -> rusqlite::Result<()> {
        let conn = Connection::open(db_path)?;
        for i in 0..count {
            let v = i as f64;
            match line {
                Line::Press => conn.execute(
                    "INSERT INTO press_raw_data
                     (machine_name, item_no, working_time, press_time_ms, pressure_1, pressure_2, pressure_5)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        "PRESS-01",
                        format!("P-{}", i),
                        "2024-05-01 08:00:00",
                        400.0 + v,
                        10.0 + v,
                        20.0 + v,
                        50.0 + v
                    ],
                )?,
                Line::Welding => conn.execute(
                    "INSERT INTO welding_raw_data
                     (machine_name, item_no, working_time, thickness_1_mm, thickness_2_mm,
                      welding_force_bar, welding_current_ka, weld_voltage_v, weld_time_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        "WELD-01",
                        format!("W-{}", i),
                        "2024-05-01 08:00:00",
                        1.2,
                        1.4,
                        3.0 + v,
                        11.0 + v,
                        2.0 + v,
                        180.0 + v
                    ],
                )?,
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{create_raw_tables, seed_rows};
    use super::*;
    use rusqlite::Connection;
    use tempfile::tempdir;

    fn setup(rows: usize) -> (tempfile::TempDir, SqliteRawSource) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.db");
        create_raw_tables(&path).unwrap();
        seed_rows(&path, Line::Welding, rows).unwrap();
        seed_rows(&path, Line::Press, rows).unwrap();
        let source = SqliteRawSource::new(&path, 2);
        (dir, source)
    }

    #[tokio::test]
    async fn test_fetch_by_offset() {
        let (_dir, source) = setup(3);

        let first = source
            .fetch_next(Line::Welding, CursorPosition::Offset(0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.idx, 1);
        assert_eq!(first.item_no, "W-0");
        assert_eq!(first.features(), vec![3.0, 11.0, 2.0, 180.0]);

        let third = source
            .fetch_next(Line::Welding, CursorPosition::Offset(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.idx, 3);

        let none = source
            .fetch_next(Line::Welding, CursorPosition::Offset(3))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_fetch_after_watermark_skips_gaps() {
        let (dir, source) = setup(0);
        let path = dir.path().join("raw.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "INSERT INTO press_raw_data (idx, machine_name, item_no, working_time,
                 press_time_ms, pressure_1, pressure_2, pressure_5)
                 VALUES (5, 'PRESS-01', 'P-5', 't', 1.0, 2.0, 3.0, 4.0),
                        (42, 'PRESS-01', 'P-42', 't', 1.0, 8.0, 9.0, 4.0)",
                [],
            )
            .unwrap();
        }

        let row = source
            .fetch_next(Line::Press, CursorPosition::After(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.idx, 42);
        assert_eq!(row.features(), vec![8.0, 9.0]);

        assert!(source
            .fetch_next(Line::Press, CursorPosition::After(42))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_validate_schema() {
        let (_dir, source) = setup(0);
        assert!(source.validate_schema(&Line::ALL).is_ok());

        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TABLE press_raw_data (idx INTEGER PRIMARY KEY, machine_name TEXT)",
            )
            .unwrap();
        let source = SqliteRawSource::new(&path, 1);

        match source.validate_schema(&[Line::Press]) {
            Err(SourceError::SchemaMismatch { table, detail }) => {
                assert_eq!(table, "press_raw_data");
                assert!(detail.contains("pressure_1"));
            }
            other => panic!("expected schema mismatch, got {:?}", other),
        }

        assert!(matches!(
            source.validate_schema(&[Line::Welding]),
            Err(SourceError::SchemaMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_source_is_read_only() {
        let (_dir, source) = setup(1);
        let conn = source.pool.acquire().unwrap();
        assert!(conn.execute("DELETE FROM press_raw_data", []).is_err());
    }
}
