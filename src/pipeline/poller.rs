//! Line poller: one raw row per tick into the trend store
//!
//! Per tick, under the line lock:
//! 1. Skip entirely if the gate has the line paused (checked again once
//!    the lock is held)
//! 2. Fetch the row at the cursor
//! 3. Exhausted → reset cursor, publish `index_reset`
//! 4. Otherwise stamp, store, remember as latest, publish, advance cursor
//!
//! A source/store failure aborts the tick with cursor and latest untouched;
//! the loop simply tries again on the next tick.

use super::broadcast::{Broadcaster, DashboardEvent, StatusKind};
use super::context::{LatestReading, LineContext};
use super::db::TrendStore;
use super::gate::ControlGate;
use super::source::RawDataSource;
use super::types::{format_trend_time, CycleId, TrendRecord};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Gate closed; nothing fetched
    Paused,
    /// Source exhausted at the cursor; cursor back to 0
    Reset,
    Ingested { cycle_id: CycleId, offset: u64 },
    /// Source or store error; state unchanged
    Failed,
}

pub struct LinePoller {
    ctx: Arc<LineContext>,
    source: Arc<dyn RawDataSource>,
    store: Arc<dyn TrendStore>,
    bus: Broadcaster,
    gate: Arc<ControlGate>,
    interval: Duration,
}

impl LinePoller {
    pub fn new(
        ctx: Arc<LineContext>,
        source: Arc<dyn RawDataSource>,
        store: Arc<dyn TrendStore>,
        bus: Broadcaster,
        gate: Arc<ControlGate>,
        interval: Duration,
    ) -> Self {
        Self {
            ctx,
            source,
            store,
            bus,
            gate,
            interval,
        }
    }

    pub async fn tick(&self) -> TickOutcome {
        let line = self.ctx.line();

        if self.gate.is_paused(line) {
            log::debug!("⏸️  {} poller paused, skipping tick", line);
            return TickOutcome::Paused;
        }

        let mut state = self.ctx.lock().await;

        // A predictor may have paused the gate while we waited for the lock
        if self.gate.is_paused(line) {
            log::debug!("⏸️  {} gate closed while waiting for line lock", line);
            return TickOutcome::Paused;
        }

        let position = state.cursor.position();

        let reading = match self.source.fetch_next(line, position).await {
            Ok(Some(reading)) => reading,
            Ok(None) => {
                state.cursor.reset();
                log::info!("🔁 {} raw data exhausted at {:?}, cursor reset to 0", line, position);
                self.bus.publish(DashboardEvent::IndexReset {
                    line,
                    message: "No more data; index reset".to_string(),
                });
                return TickOutcome::Reset;
            }
            Err(e) => {
                log::error!("❌ {} raw fetch failed: {}", line, e);
                self.publish_storage_error(format!("raw fetch failed: {}", e));
                return TickOutcome::Failed;
            }
        };

        let record = TrendRecord {
            trend_time: state.next_trend_time(Utc::now()),
            reading,
        };

        let cycle_id = match self.store.insert_reading(&record).await {
            Ok(id) => id,
            Err(e) => {
                log::error!("❌ {} trend insert failed (idx={}): {}", line, record.reading.idx, e);
                self.publish_storage_error(format!("trend insert failed: {}", e));
                return TickOutcome::Failed;
            }
        };

        let trend_time = format_trend_time(&record.trend_time);
        let idx = record.reading.idx;
        state.record_ingest(LatestReading {
            cycle_id,
            trend_time: record.trend_time,
            reading: record.reading.clone(),
        });

        self.bus.publish(DashboardEvent::Reading {
            line,
            cycle_id,
            trend_time: trend_time.clone(),
            data: record.reading,
        });

        let offset = state.cursor.offset();
        log::debug!(
            "✅ {} ingested idx={} cycle={} trend_time={} offset={}",
            line,
            idx,
            cycle_id,
            trend_time,
            offset
        );

        TickOutcome::Ingested { cycle_id, offset }
    }

    fn publish_storage_error(&self, message: String) {
        self.bus.publish(DashboardEvent::Status {
            line: self.ctx.line(),
            status: StatusKind::StorageError,
            message,
        });
    }

    /// Tick on a fixed period until cancelled
    ///
    /// The sleep after a tick is `interval - elapsed`, floored at zero, so a
    /// slow tick is followed immediately by the next one instead of drifting.
    pub async fn run(self, cancel: CancellationToken) {
        let line = self.ctx.line();
        log::info!("⏰ Starting {} poller (interval: {}ms)", line, self.interval.as_millis());

        loop {
            let started = Instant::now();
            let outcome = self.tick().await;
            let elapsed = started.elapsed();

            if elapsed > self.interval {
                log::warn!(
                    "⚠️  {} tick took {}ms (> {}ms interval), outcome {:?}",
                    line,
                    elapsed.as_millis(),
                    self.interval.as_millis(),
                    outcome
                );
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval.saturating_sub(elapsed)) => {}
            }
        }

        log::info!("✅ {} poller stopped", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::{CursorStrategy, PauseScope};
    use crate::pipeline::cursor::CursorPosition;
    use crate::pipeline::db::{SqliteTrendStore, TrendRow};
    use crate::pipeline::error::{SourceError, StoreError};
    use crate::pipeline::source::{fixtures, SqliteRawSource};
    use crate::pipeline::types::{Line, PredictionRecord, RawReading};
    use crate::pipeline::broadcast::StreamKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        _dir: TempDir,
        ctx: Arc<LineContext>,
        store: Arc<SqliteTrendStore>,
        bus: Broadcaster,
        gate: Arc<ControlGate>,
        poller: LinePoller,
    }

    fn harness(line: Line, rows: usize, strategy: CursorStrategy) -> Harness {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("raw.db");
        fixtures::create_raw_tables(&raw).unwrap();
        fixtures::seed_rows(&raw, line, rows).unwrap();

        let ctx = Arc::new(LineContext::new(line, strategy));
        let store = Arc::new(SqliteTrendStore::open(dir.path().join("trend.db"), 2).unwrap());
        let bus = Broadcaster::new(16);
        let gate = Arc::new(ControlGate::new(PauseScope::Global));
        let poller = LinePoller::new(
            ctx.clone(),
            Arc::new(SqliteRawSource::new(&raw, 2)),
            store.clone(),
            bus.clone(),
            gate.clone(),
            Duration::from_millis(10),
        );

        Harness {
            _dir: dir,
            ctx,
            store,
            bus,
            gate,
            poller,
        }
    }

    #[tokio::test]
    async fn test_offset_equals_rows_fetched() {
        let h = harness(Line::Press, 4, CursorStrategy::Offset);

        for expected in 1..=4u64 {
            match h.poller.tick().await {
                TickOutcome::Ingested { offset, .. } => assert_eq!(offset, expected),
                other => panic!("expected ingest, got {:?}", other),
            }
        }
        assert_eq!(h.poller.tick().await, TickOutcome::Reset);
        assert_eq!(h.ctx.status().await.offset, 0);

        // Wraps around and re-reads from the start
        assert!(matches!(
            h.poller.tick().await,
            TickOutcome::Ingested { offset: 1, .. }
        ));
        assert_eq!(h.store.count_rows("press_trend").unwrap(), 5);
    }

    #[tokio::test]
    async fn test_empty_source_resets_every_tick() {
        let h = harness(Line::Welding, 0, CursorStrategy::Watermark);
        let mut rx = h.bus.subscribe(Line::Welding, StreamKind::Insert);

        for _ in 0..3 {
            assert_eq!(h.poller.tick().await, TickOutcome::Reset);
            assert_eq!(h.ctx.status().await.offset, 0);
            assert!(matches!(
                rx.try_recv().unwrap(),
                DashboardEvent::IndexReset { line: Line::Welding, .. }
            ));
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(h.store.count_rows("welding_trend").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_paused_tick_freezes_state() {
        let h = harness(Line::Welding, 3, CursorStrategy::Offset);
        h.poller.tick().await;
        let before = h.ctx.status().await;

        h.gate.pause(Line::Welding, "test");
        for _ in 0..5 {
            assert_eq!(h.poller.tick().await, TickOutcome::Paused);
        }

        let after = h.ctx.status().await;
        assert_eq!(after.offset, before.offset);
        assert_eq!(after.generation, before.generation);
        assert_eq!(
            after.latest.map(|l| l.cycle_id),
            before.latest.map(|l| l.cycle_id)
        );
        assert_eq!(h.store.count_rows("welding_trend").unwrap(), 1);

        h.gate.resume(None);
        assert!(matches!(
            h.poller.tick().await,
            TickOutcome::Ingested { offset: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_reading_event_carries_cycle() {
        let h = harness(Line::Welding, 1, CursorStrategy::Watermark);
        let mut rx = h.bus.subscribe(Line::Welding, StreamKind::Insert);

        let cycle = match h.poller.tick().await {
            TickOutcome::Ingested { cycle_id, .. } => cycle_id,
            other => panic!("expected ingest, got {:?}", other),
        };

        match rx.try_recv().unwrap() {
            DashboardEvent::Reading {
                cycle_id,
                trend_time,
                data,
                ..
            } => {
                assert_eq!(cycle_id, cycle);
                assert_eq!(data.idx, 1);
                assert_eq!(h.store.readings(Line::Welding).unwrap()[0].1, trend_time);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    /// Store that fails while `failing` is set
    struct FlakyStore {
        inner: Arc<SqliteTrendStore>,
        failing: AtomicBool,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl TrendStore for FlakyStore {
        async fn insert_reading(&self, record: &TrendRecord) -> Result<CycleId, StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Database(rusqlite::Error::InvalidQuery));
            }
            self.inner.insert_reading(record).await
        }

        async fn insert_prediction(&self, record: &PredictionRecord) -> Result<(), StoreError> {
            self.inner.insert_prediction(record).await
        }

        async fn recent_trend(&self, line: Line, limit: usize) -> Result<Vec<TrendRow>, StoreError> {
            self.inner.recent_trend(line, limit).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_leaves_cursor_unchanged() {
        let h = harness(Line::Press, 2, CursorStrategy::Offset);
        let flaky = Arc::new(FlakyStore {
            inner: h.store.clone(),
            failing: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
        });
        let raw = h._dir.path().join("raw.db");
        let poller = LinePoller::new(
            h.ctx.clone(),
            Arc::new(SqliteRawSource::new(&raw, 1)),
            flaky.clone(),
            h.bus.clone(),
            h.gate.clone(),
            Duration::from_millis(10),
        );
        let mut rx = h.bus.subscribe(Line::Press, StreamKind::Insert);

        assert_eq!(poller.tick().await, TickOutcome::Failed);
        assert_eq!(poller.tick().await, TickOutcome::Failed);
        let status = h.ctx.status().await;
        assert_eq!(status.offset, 0);
        assert!(status.latest.is_none());
        assert!(matches!(
            rx.try_recv().unwrap(),
            DashboardEvent::Status { status: StatusKind::StorageError, .. }
        ));

        flaky.failing.store(false, Ordering::SeqCst);
        assert!(matches!(
            poller.tick().await,
            TickOutcome::Ingested { offset: 1, .. }
        ));
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    }

    struct BrokenSource;

    #[async_trait]
    impl RawDataSource for BrokenSource {
        async fn fetch_next(
            &self,
            _line: Line,
            _position: CursorPosition,
        ) -> Result<Option<RawReading>, SourceError> {
            Err(SourceError::Database(rusqlite::Error::InvalidQuery))
        }
    }

    #[tokio::test]
    async fn test_source_failure_is_not_exhaustion() {
        let h = harness(Line::Welding, 0, CursorStrategy::Offset);
        let poller = LinePoller::new(
            h.ctx.clone(),
            Arc::new(BrokenSource),
            h.store.clone(),
            h.bus.clone(),
            h.gate.clone(),
            Duration::from_millis(10),
        );
        let mut rx = h.bus.subscribe(Line::Welding, StreamKind::Insert);

        assert_eq!(poller.tick().await, TickOutcome::Failed);
        assert!(matches!(
            rx.try_recv().unwrap(),
            DashboardEvent::Status { status: StatusKind::StorageError, .. }
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = harness(Line::Press, 50, CursorStrategy::Watermark);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(h.poller.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller did not stop")
            .unwrap();

        let offset = h.ctx.status().await.offset;
        assert!(offset >= 1, "expected at least one tick, got {}", offset);
        assert!(offset < 50);
    }

    #[tokio::test]
    async fn test_pause_while_waiting_for_lock_skips_tick() {
        let h = harness(Line::Welding, 3, CursorStrategy::Offset);
        let gate = h.gate.clone();
        let guard = h.ctx.lock().await;

        // Tick passes the first gate check, then blocks on the held lock
        let (outcome, _) = tokio::join!(h.poller.tick(), async move {
            tokio::task::yield_now().await;
            gate.pause(Line::Welding, "abnormal");
            drop(guard);
        });

        assert_eq!(outcome, TickOutcome::Paused);
        assert_eq!(h.ctx.status().await.offset, 0);
        assert_eq!(h.store.count_rows("welding_trend").unwrap(), 0);
    }

    /// Source that takes `delay` per fetch and records when each fetch began
    struct TimedSource {
        delay: Duration,
        starts: Mutex<Vec<Instant>>,
        stop_after: usize,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl RawDataSource for TimedSource {
        async fn fetch_next(
            &self,
            _line: Line,
            _position: CursorPosition,
        ) -> Result<Option<RawReading>, SourceError> {
            let count = {
                let mut starts = self.starts.lock().unwrap();
                starts.push(Instant::now());
                starts.len()
            };
            tokio::time::sleep(self.delay).await;
            if count >= self.stop_after {
                self.cancel.cancel();
            }
            Ok(None)
        }
    }

    async fn tick_gaps(fetch: Duration, interval: Duration) -> Vec<Duration> {
        let h = harness(Line::Press, 0, CursorStrategy::Offset);
        let cancel = CancellationToken::new();
        let source = Arc::new(TimedSource {
            delay: fetch,
            starts: Mutex::new(Vec::new()),
            stop_after: 4,
            cancel: cancel.clone(),
        });
        let poller = LinePoller::new(
            h.ctx.clone(),
            source.clone(),
            h.store.clone(),
            h.bus.clone(),
            h.gate.clone(),
            interval,
        );

        poller.run(cancel).await;

        let starts = source.starts.lock().unwrap();
        assert_eq!(starts.len(), 4);
        starts.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tick_followed_immediately() {
        let gaps = tick_gaps(Duration::from_millis(150), Duration::from_millis(100)).await;
        for gap in gaps {
            assert!(gap >= Duration::from_millis(150), "gap {:?}", gap);
            assert!(gap < Duration::from_millis(160), "extra wait after slow tick: {:?}", gap);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_tick_sleeps_rest_of_interval() {
        let gaps = tick_gaps(Duration::from_millis(30), Duration::from_millis(100)).await;
        for gap in gaps {
            assert!(gap >= Duration::from_millis(100), "gap {:?}", gap);
            assert!(gap < Duration::from_millis(110), "gap {:?}", gap);
        }
    }
}
