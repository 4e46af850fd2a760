//! Per-line mutable state shared by that line's poller and predictor
//!
//! Nothing here is process-wide: each line gets its own `LineContext`
//! behind an `Arc`, and its lock guards cursor, latest reading, trend clock
//! and generation together.

use super::config::CursorStrategy;
use super::cursor::LineCursor;
use super::types::{format_trend_time, CycleId, Line, RawReading};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};

/// Most recent successfully ingested reading of a line
#[derive(Debug, Clone, PartialEq)]
pub struct LatestReading {
    pub cycle_id: CycleId,
    pub trend_time: DateTime<Utc>,
    pub reading: RawReading,
}

#[derive(Debug)]
pub struct LineState {
    pub cursor: LineCursor,
    pub latest: Option<LatestReading>,
    /// Bumped on every ingest so predictors can tell new data from old
    pub generation: u64,
    last_trend_time: Option<DateTime<Utc>>,
}

impl LineState {
    fn new(strategy: CursorStrategy) -> Self {
        Self {
            cursor: LineCursor::new(strategy),
            latest: None,
            generation: 0,
            last_trend_time: None,
        }
    }

    /// Trend timestamp for a new cycle, strictly after the previous one
    ///
    /// Does not commit; `record_ingest` does once the reading is stored.
    pub fn next_trend_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        // Storage keeps microseconds, so compare at that precision
        let now = DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);
        match self.last_trend_time {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        }
    }

    /// Commit a stored reading: latest, trend clock, generation, cursor
    pub fn record_ingest(&mut self, latest: LatestReading) {
        self.cursor.advance(latest.reading.idx);
        self.last_trend_time = Some(latest.trend_time);
        self.latest = Some(latest);
        self.generation += 1;
    }
}

pub struct LineContext {
    line: Line,
    state: Mutex<LineState>,
}

impl LineContext {
    pub fn new(line: Line, strategy: CursorStrategy) -> Self {
        Self {
            line,
            state: Mutex::new(LineState::new(strategy)),
        }
    }

    pub fn line(&self) -> Line {
        self.line
    }

    /// Line-scoped exclusive lock
    pub async fn lock(&self) -> MutexGuard<'_, LineState> {
        self.state.lock().await
    }

    pub async fn status(&self) -> LineStatus {
        let state = self.state.lock().await;
        LineStatus {
            line: self.line,
            offset: state.cursor.offset(),
            watermark: state.cursor.watermark(),
            cursor_strategy: state.cursor.strategy(),
            generation: state.generation,
            latest: state.latest.as_ref().map(|l| LatestView {
                cycle_id: l.cycle_id,
                trend_time: format_trend_time(&l.trend_time),
                reading: l.reading.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestView {
    pub cycle_id: CycleId,
    pub trend_time: String,
    pub reading: RawReading,
}

/// Snapshot served by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct LineStatus {
    pub line: Line,
    pub offset: u64,
    pub watermark: i64,
    pub cursor_strategy: CursorStrategy,
    pub generation: u64,
    pub latest: Option<LatestView>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Measurements;

    fn reading(idx: i64) -> RawReading {
        RawReading {
            idx,
            machine_name: "PRESS-01".to_string(),
            item_no: "P-1".to_string(),
            working_time: "t".to_string(),
            measurements: Measurements::Press {
                press_time_ms: 1.0,
                pressure_1: 2.0,
                pressure_2: 3.0,
                pressure_5: 4.0,
            },
        }
    }

    #[tokio::test]
    async fn test_trend_time_strictly_increases() {
        let ctx = LineContext::new(Line::Press, CursorStrategy::Offset);
        let frozen = Utc::now();

        let mut state = ctx.lock().await;
        let first = state.next_trend_time(frozen);
        state.record_ingest(LatestReading {
            cycle_id: 1,
            trend_time: first,
            reading: reading(1),
        });

        let second = state.next_trend_time(frozen);
        assert!(second > first);
        assert_eq!((second - first).num_microseconds(), Some(1));
    }

    #[tokio::test]
    async fn test_record_ingest_updates_everything() {
        let ctx = LineContext::new(Line::Press, CursorStrategy::Watermark);
        {
            let mut state = ctx.lock().await;
            let ts = state.next_trend_time(Utc::now());
            state.record_ingest(LatestReading {
                cycle_id: 9,
                trend_time: ts,
                reading: reading(12),
            });
        }

        let status = ctx.status().await;
        assert_eq!(status.offset, 1);
        assert_eq!(status.watermark, 12);
        assert_eq!(status.generation, 1);
        assert_eq!(status.latest.unwrap().cycle_id, 9);
    }
}
