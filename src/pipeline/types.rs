//! Core data structures shared by pollers, predictors and the trend store

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A monitored production line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Line {
    Press,
    Welding,
}

impl Line {
    pub const ALL: [Line; 2] = [Line::Press, Line::Welding];

    pub fn as_str(&self) -> &'static str {
        match self {
            Line::Press => "press",
            Line::Welding => "welding",
        }
    }

    /// Append-only upstream table the poller reads from
    pub fn raw_table(&self) -> &'static str {
        match self {
            Line::Press => "press_raw_data",
            Line::Welding => "welding_raw_data",
        }
    }

    pub fn trend_table(&self) -> &'static str {
        match self {
            Line::Press => "press_trend",
            Line::Welding => "welding_trend",
        }
    }

    pub fn prediction_table(&self) -> &'static str {
        match self {
            Line::Press => "press_prediction",
            Line::Welding => "welding_prediction",
        }
    }

    /// Measurement columns in raw-table order (after idx, machine_name, item_no, working_time)
    pub fn measurement_columns(&self) -> &'static [&'static str] {
        match self {
            Line::Press => &["press_time_ms", "pressure_1", "pressure_2", "pressure_5"],
            Line::Welding => &[
                "thickness_1_mm",
                "thickness_2_mm",
                "welding_force_bar",
                "welding_current_ka",
                "weld_voltage_v",
                "weld_time_ms",
            ],
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Line {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "press" => Ok(Line::Press),
            "welding" => Ok(Line::Welding),
            other => Err(format!("unknown line '{}'", other)),
        }
    }
}

/// Line-specific measurement fields of a raw row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Measurements {
    Press {
        press_time_ms: f64,
        pressure_1: f64,
        pressure_2: f64,
        pressure_5: f64,
    },
    Welding {
        thickness_1_mm: f64,
        thickness_2_mm: f64,
        welding_force_bar: f64,
        welding_current_ka: f64,
        weld_voltage_v: f64,
        weld_time_ms: f64,
    },
}

impl Measurements {
    pub fn line(&self) -> Line {
        match self {
            Measurements::Press { .. } => Line::Press,
            Measurements::Welding { .. } => Line::Welding,
        }
    }

    /// Values in the same order as `Line::measurement_columns`
    pub fn values(&self) -> Vec<f64> {
        match *self {
            Measurements::Press {
                press_time_ms,
                pressure_1,
                pressure_2,
                pressure_5,
            } => vec![press_time_ms, pressure_1, pressure_2, pressure_5],
            Measurements::Welding {
                thickness_1_mm,
                thickness_2_mm,
                welding_force_bar,
                welding_current_ka,
                weld_voltage_v,
                weld_time_ms,
            } => vec![
                thickness_1_mm,
                thickness_2_mm,
                welding_force_bar,
                welding_current_ka,
                weld_voltage_v,
                weld_time_ms,
            ],
        }
    }

    /// Ordered feature vector sent to the prediction API
    ///
    /// Press: `[pressure_1, pressure_2]`
    /// Welding: `[force, current, voltage, time]`
    pub fn features(&self) -> Vec<f64> {
        match *self {
            Measurements::Press {
                pressure_1,
                pressure_2,
                ..
            } => vec![pressure_1, pressure_2],
            Measurements::Welding {
                welding_force_bar,
                welding_current_ka,
                weld_voltage_v,
                weld_time_ms,
                ..
            } => vec![
                welding_force_bar,
                welding_current_ka,
                weld_voltage_v,
                weld_time_ms,
            ],
        }
    }
}

/// Snapshot of one upstream row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    /// Identity column of the raw table
    pub idx: i64,
    pub machine_name: String,
    pub item_no: String,
    pub working_time: String,
    #[serde(flatten)]
    pub measurements: Measurements,
}

impl RawReading {
    pub fn line(&self) -> Line {
        self.measurements.line()
    }

    pub fn features(&self) -> Vec<f64> {
        self.measurements.features()
    }
}

/// Trend-row id returned by the reading insert; correlates the later prediction
pub type CycleId = i64;

/// Reading persisted with the cycle's trend timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct TrendRecord {
    pub reading: RawReading,
    pub trend_time: DateTime<Utc>,
}

/// Prediction persisted against the cycle that produced its input
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    pub line: Line,
    pub cycle_id: CycleId,
    pub trend_time: DateTime<Utc>,
    pub prediction: i64,
}

/// Storage/wire format for trend timestamps (RFC 3339, microseconds, `Z`)
pub fn format_trend_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_trend_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
