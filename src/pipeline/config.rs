//! Pipeline configuration from environment variables

use super::error::ConfigError;
use super::types::Line;
use serde::Serialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// How the poller addresses the next unread raw row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorStrategy {
    /// `LIMIT 1 OFFSET <rows fetched>`
    Offset,
    /// `WHERE idx > <last seen idx> ORDER BY idx LIMIT 1`
    Watermark,
}

impl FromStr for CursorStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "offset" => Ok(CursorStrategy::Offset),
            "watermark" => Ok(CursorStrategy::Watermark),
            other => Err(ConfigError::InvalidValue(format!(
                "CURSOR_STRATEGY must be 'offset' or 'watermark', got '{}'",
                other
            ))),
        }
    }
}

/// Whether an abnormal prediction pauses every line or only its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseScope {
    Global,
    PerLine,
}

impl FromStr for PauseScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "global" => Ok(PauseScope::Global),
            "per_line" | "per-line" | "line" => Ok(PauseScope::PerLine),
            other => Err(ConfigError::InvalidValue(format!(
                "PAUSE_SCOPE must be 'global' or 'per_line', got '{}'",
                other
            ))),
        }
    }
}

/// Configuration for the pipeline runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// SQLite file holding `<line>_raw_data` tables (opened read-only)
    pub raw_db_path: String,

    /// SQLite file holding trend and prediction tables
    pub trend_db_path: String,

    /// Dashboard server bind address
    pub bind_addr: String,

    /// Lines with a running poller/predictor pair
    pub lines: Vec<Line>,

    /// Poller tick interval in milliseconds
    pub poll_interval_ms: u64,

    /// Predictor change-check interval in milliseconds
    pub predict_check_interval_ms: u64,

    /// Prediction HTTP timeout in milliseconds
    pub predict_timeout_ms: u64,

    pub press_predict_url: String,
    pub welding_predict_url: String,

    pub cursor_strategy: CursorStrategy,
    pub pause_scope: PauseScope,

    /// When true, predictors also idle while their line is paused
    pub pause_blocks_prediction: bool,

    /// Lines whose abnormal predictions pause the gate
    pub gated_lines: Vec<Line>,

    /// Label that denotes an abnormal condition
    pub abnormal_label: i64,

    /// Per-stream event buffer before slow subscribers start losing events
    pub broadcast_capacity: usize,

    /// Maximum idle connections kept per SQLite pool
    pub db_pool_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_db_path: "data/raw.db".to_string(),
            trend_db_path: "data/trend.db".to_string(),
            bind_addr: "0.0.0.0:8000".to_string(),
            lines: Line::ALL.to_vec(),
            poll_interval_ms: 5_000,
            predict_check_interval_ms: 500,
            predict_timeout_ms: 10_000,
            press_predict_url: "http://127.0.0.1:9000/engineering/realtime-press/predict"
                .to_string(),
            welding_predict_url: "http://127.0.0.1:9000/engineering/realtime-welding/predict"
                .to_string(),
            cursor_strategy: CursorStrategy::Watermark,
            pause_scope: PauseScope::Global,
            pause_blocks_prediction: false,
            gated_lines: vec![Line::Welding],
            abnormal_label: 1,
            broadcast_capacity: 64,
            db_pool_size: 4,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `LINEWATCH_RAW_DB_PATH` (default: data/raw.db)
    /// - `LINEWATCH_TREND_DB_PATH` (default: data/trend.db)
    /// - `LINEWATCH_BIND_ADDR` (default: 0.0.0.0:8000)
    /// - `LINEWATCH_LINES` (default: press,welding)
    /// - `POLL_INTERVAL_MS` (default: 5000)
    /// - `PREDICT_CHECK_INTERVAL_MS` (default: 500)
    /// - `PREDICT_TIMEOUT_MS` (default: 10000)
    /// - `PRESS_PREDICT_URL`, `WELDING_PREDICT_URL`
    /// - `CURSOR_STRATEGY` (default: watermark)
    /// - `PAUSE_SCOPE` (default: global)
    /// - `PAUSE_BLOCKS_PREDICTION` (default: false)
    /// - `GATED_LINES` (default: welding)
    /// - `ABNORMAL_LABEL` (default: 1)
    /// - `BROADCAST_CAPACITY` (default: 64)
    /// - `DB_POOL_SIZE` (default: 4)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            raw_db_path: env::var("LINEWATCH_RAW_DB_PATH").unwrap_or(defaults.raw_db_path),
            trend_db_path: env::var("LINEWATCH_TREND_DB_PATH").unwrap_or(defaults.trend_db_path),
            bind_addr: env::var("LINEWATCH_BIND_ADDR").unwrap_or(defaults.bind_addr),
            lines: match env::var("LINEWATCH_LINES") {
                Ok(s) => parse_lines("LINEWATCH_LINES", &s)?,
                Err(_) => defaults.lines,
            },
            poll_interval_ms: parse_or("POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            predict_check_interval_ms: parse_or(
                "PREDICT_CHECK_INTERVAL_MS",
                defaults.predict_check_interval_ms,
            )?,
            predict_timeout_ms: parse_or("PREDICT_TIMEOUT_MS", defaults.predict_timeout_ms)?,
            press_predict_url: env::var("PRESS_PREDICT_URL").unwrap_or(defaults.press_predict_url),
            welding_predict_url: env::var("WELDING_PREDICT_URL")
                .unwrap_or(defaults.welding_predict_url),
            cursor_strategy: match env::var("CURSOR_STRATEGY") {
                Ok(s) => s.parse()?,
                Err(_) => defaults.cursor_strategy,
            },
            pause_scope: match env::var("PAUSE_SCOPE") {
                Ok(s) => s.parse()?,
                Err(_) => defaults.pause_scope,
            },
            pause_blocks_prediction: parse_or(
                "PAUSE_BLOCKS_PREDICTION",
                defaults.pause_blocks_prediction,
            )?,
            gated_lines: match env::var("GATED_LINES") {
                Ok(s) => parse_lines("GATED_LINES", &s)?,
                Err(_) => defaults.gated_lines,
            },
            abnormal_label: parse_or("ABNORMAL_LABEL", defaults.abnormal_label)?,
            broadcast_capacity: parse_or("BROADCAST_CAPACITY", defaults.broadcast_capacity)?,
            db_pool_size: parse_or("DB_POOL_SIZE", defaults.db_pool_size)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "POLL_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }
        if self.predict_check_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "PREDICT_CHECK_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }
        if self.predict_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "PREDICT_TIMEOUT_MS must be finite and greater than 0".to_string(),
            ));
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "BROADCAST_CAPACITY must be greater than 0".to_string(),
            ));
        }
        for line in &self.lines {
            let url = self.predict_url(*line);
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(format!(
                    "{} prediction URL must start with http:// or https://",
                    line
                )));
            }
        }
        Ok(())
    }

    pub fn predict_url(&self, line: Line) -> &str {
        match line {
            Line::Press => &self.press_predict_url,
            Line::Welding => &self.welding_predict_url,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn predict_check_interval(&self) -> Duration {
        Duration::from_millis(self.predict_check_interval_ms)
    }

    pub fn predict_timeout(&self) -> Duration {
        Duration::from_millis(self.predict_timeout_ms)
    }
}

fn parse_or<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw.trim().to_lowercase().parse().map_err(|_| {
            ConfigError::InvalidValue(format!("{} has an unparseable value '{}'", var, raw))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_lines(var: &str, raw: &str) -> Result<Vec<Line>, ConfigError> {
    let mut lines = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let line = part
            .parse::<Line>()
            .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", var, e)))?;
        if !lines.contains(&line) {
            lines.push(line);
        }
    }
    Ok(lines)
}
