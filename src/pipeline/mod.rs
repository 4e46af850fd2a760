//! # Line Monitoring Pipeline
//!
//! Tails the raw measurement tables of each production line, copies every
//! new row into the trend store with a cycle timestamp, classifies it with
//! the line's prediction API and fans results out to dashboard subscribers.
//!
//! ## Data flow (per line)
//!
//! ```text
//! raw table ──poller──▶ trend table ──▶ insert stream
//!                │
//!                └─ latest reading ──predictor──▶ prediction table ──▶ select stream
//!                                          │
//!                                          └─ abnormal label ──▶ control gate (pause)
//! ```
//!
//! Lines share nothing but the gate, the broadcaster and the database pools.
//! A line's cursor, latest reading and trend clock live in its
//! `LineContext` and are only touched under that line's lock, so the poller
//! and predictor of one line never interleave mid-cycle.
//!
//! ## Module Organization
//!
//! - `types` - Lines, raw readings, trend and prediction records
//! - `config` - Environment-driven `PipelineConfig`
//! - `error` - Error types per component
//! - `pool` - Small SQLite connection pool
//! - `source` - Read-only raw table access (`RawDataSource`)
//! - `cursor` - Per-line read position
//! - `context` - Per-line shared state and lock
//! - `db` - Trend store (`TrendStore`) and migrations
//! - `poller` - Ingestion loop
//! - `predictor` - Prediction client and loop
//! - `gate` - Pause/resume control
//! - `broadcast` - Dashboard fan-out
//! - `backoff` - Retry delays for failing loops

pub mod backoff;
pub mod broadcast;
pub mod config;
pub mod context;
pub mod cursor;
pub mod db;
pub mod error;
pub mod gate;
pub mod poller;
pub mod pool;
pub mod predictor;
pub mod source;
pub mod types;

// Re-export commonly used types
pub use broadcast::{Broadcaster, DashboardEvent, StatusKind, StreamKind};
pub use config::{CursorStrategy, PauseScope, PipelineConfig};
pub use context::{LineContext, LineStatus};
pub use db::{SqliteTrendStore, TrendStore};
pub use gate::{ControlGate, GateState};
pub use poller::LinePoller;
pub use predictor::{GatePolicy, HttpPredictionClient, LinePredictor, PredictionClient};
pub use source::{RawDataSource, SqliteRawSource};
pub use types::{CycleId, Line, RawReading};
