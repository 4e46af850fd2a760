//! Pause/resume control over ingestion
//!
//! `Running → Paused` happens when a predictor sees an abnormal label (or an
//! operator pauses by hand). `Paused → Running` only happens on an explicit
//! resume; there is no auto-resume.
//!
//! Pollers read the flag with a relaxed atomic load before each tick. A tick
//! that already passed the check when the pause lands is allowed to finish.

use super::config::PauseScope;
use super::types::Line;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GateState {
    Running,
    Paused {
        reason: String,
        since: DateTime<Utc>,
    },
}

impl GateState {
    pub fn is_paused(&self) -> bool {
        matches!(self, GateState::Paused { .. })
    }
}

/// Gate state per line, as reported to operators
#[derive(Debug, Clone, Serialize)]
pub struct GateSnapshot {
    pub scope: PauseScope,
    pub lines: HashMap<Line, GateState>,
}

pub struct ControlGate {
    scope: PauseScope,
    global: Flag,
    press: Flag,
    welding: Flag,
}

struct Flag {
    paused: AtomicBool,
    detail: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl Flag {
    fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            detail: Mutex::new(None),
        }
    }

    fn set(&self, reason: &str) -> bool {
        let mut detail = self.detail.lock().unwrap_or_else(|p| p.into_inner());
        let was_paused = self.paused.swap(true, Ordering::SeqCst);
        if !was_paused {
            *detail = Some((reason.to_string(), Utc::now()));
        }
        !was_paused
    }

    fn clear(&self) -> bool {
        let mut detail = self.detail.lock().unwrap_or_else(|p| p.into_inner());
        let was_paused = self.paused.swap(false, Ordering::SeqCst);
        *detail = None;
        was_paused
    }

    fn is_set(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn state(&self) -> GateState {
        let detail = self.detail.lock().unwrap_or_else(|p| p.into_inner());
        match (self.paused.load(Ordering::SeqCst), detail.as_ref()) {
            (true, Some((reason, since))) => GateState::Paused {
                reason: reason.clone(),
                since: *since,
            },
            (true, None) => GateState::Paused {
                reason: String::new(),
                since: Utc::now(),
            },
            (false, _) => GateState::Running,
        }
    }
}

impl ControlGate {
    pub fn new(scope: PauseScope) -> Self {
        Self {
            scope,
            global: Flag::new(),
            press: Flag::new(),
            welding: Flag::new(),
        }
    }

    pub fn scope(&self) -> PauseScope {
        self.scope
    }

    fn flag(&self, line: Line) -> &Flag {
        match self.scope {
            PauseScope::Global => &self.global,
            PauseScope::PerLine => match line {
                Line::Press => &self.press,
                Line::Welding => &self.welding,
            },
        }
    }

    pub fn is_paused(&self, line: Line) -> bool {
        self.flag(line).is_set()
    }

    pub fn state(&self, line: Line) -> GateState {
        self.flag(line).state()
    }

    /// Pause on behalf of `line`; returns true on an actual transition
    pub fn pause(&self, line: Line, reason: &str) -> bool {
        let transitioned = self.flag(line).set(reason);
        if transitioned {
            match self.scope {
                PauseScope::Global => log::warn!("⛔ Gate PAUSED (all lines) by {}: {}", line, reason),
                PauseScope::PerLine => log::warn!("⛔ Gate PAUSED for {}: {}", line, reason),
            }
        }
        transitioned
    }

    /// Resume one line, or every line when `line` is `None`
    ///
    /// With global scope the line argument is ignored. Returns the lines that
    /// actually transitioned back to running.
    pub fn resume(&self, line: Option<Line>) -> Vec<Line> {
        let resumed: Vec<Line> = match (self.scope, line) {
            (PauseScope::Global, _) => {
                if self.global.clear() {
                    Line::ALL.to_vec()
                } else {
                    Vec::new()
                }
            }
            (PauseScope::PerLine, Some(line)) => {
                if self.flag(line).clear() {
                    vec![line]
                } else {
                    Vec::new()
                }
            }
            (PauseScope::PerLine, None) => Line::ALL
                .into_iter()
                .filter(|l| self.flag(*l).clear())
                .collect(),
        };

        if !resumed.is_empty() {
            log::info!("▶️  Gate RESUMED: {:?}", resumed);
        }
        resumed
    }

    pub fn snapshot(&self) -> GateSnapshot {
        GateSnapshot {
            scope: self.scope,
            lines: Line::ALL.into_iter().map(|l| (l, self.state(l))).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_pause_affects_every_line() {
        let gate = ControlGate::new(PauseScope::Global);
        assert!(!gate.is_paused(Line::Press));

        assert!(gate.pause(Line::Welding, "abnormal weld"));
        assert!(gate.is_paused(Line::Press));
        assert!(gate.is_paused(Line::Welding));
        assert!(!gate.pause(Line::Welding, "again"));

        match gate.state(Line::Press) {
            GateState::Paused { reason, .. } => assert_eq!(reason, "abnormal weld"),
            other => panic!("expected paused, got {:?}", other),
        }

        assert_eq!(gate.resume(Some(Line::Press)), vec![Line::Press, Line::Welding]);
        assert!(!gate.is_paused(Line::Welding));
        assert!(gate.resume(None).is_empty());
    }

    #[test]
    fn test_per_line_pause_is_isolated() {
        let gate = ControlGate::new(PauseScope::PerLine);
        gate.pause(Line::Welding, "abnormal");

        assert!(gate.is_paused(Line::Welding));
        assert!(!gate.is_paused(Line::Press));
        assert!(gate.resume(Some(Line::Press)).is_empty());
        assert_eq!(gate.resume(None), vec![Line::Welding]);
    }

    #[test]
    fn test_snapshot_serializes() {
        let gate = ControlGate::new(PauseScope::Global);
        gate.pause(Line::Press, "manual");
        let json = serde_json::to_value(gate.snapshot()).unwrap();
        assert_eq!(json["scope"], "global");
        assert_eq!(json["lines"]["welding"]["state"], "paused");
        assert_eq!(json["lines"]["press"]["reason"], "manual");
    }
}
