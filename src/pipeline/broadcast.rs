//! Fan-out of pipeline events to dashboard subscribers
//!
//! Each (line, stream) pair owns a bounded `tokio::sync::broadcast` channel.
//! Publishing never waits on subscribers: a receiver that falls more than
//! `capacity` events behind loses the oldest ones and is told how many.

use super::gate::GateState;
use super::types::{CycleId, Line, RawReading};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;

/// Dashboard stream a client subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Ingested readings, index resets, ingestion status
    Insert,
    /// Predictions, prediction status, gate transitions
    Select,
}

impl FromStr for StreamKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(StreamKind::Insert),
            "select" | "prediction" => Ok(StreamKind::Select),
            other => Err(format!("unknown stream '{}'", other)),
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Insert => f.write_str("insert"),
            StreamKind::Select => f.write_str("select"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Predictor has nothing to classify yet
    NoData,
    /// Prediction call timed out or returned an error status
    PredictionFailed,
    /// Raw source or trend store unavailable this cycle
    StorageError,
}

/// JSON event pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    Reading {
        line: Line,
        cycle_id: CycleId,
        trend_time: String,
        data: RawReading,
    },
    IndexReset {
        line: Line,
        message: String,
    },
    Prediction {
        line: Line,
        cycle_id: CycleId,
        trend_time: String,
        prediction: i64,
        abnormal: bool,
    },
    Status {
        line: Line,
        status: StatusKind,
        message: String,
    },
    Gate {
        line: Line,
        gate: GateState,
    },
    /// Sent to a subscriber that fell behind and lost events
    Lagged {
        skipped: u64,
    },
}

impl DashboardEvent {
    /// Stream the event belongs to; `None` for events delivered on every stream of the line
    pub fn stream(&self) -> Option<StreamKind> {
        match self {
            DashboardEvent::Reading { .. } | DashboardEvent::IndexReset { .. } => {
                Some(StreamKind::Insert)
            }
            DashboardEvent::Prediction { .. } => Some(StreamKind::Select),
            DashboardEvent::Status { status, .. } => match status {
                StatusKind::StorageError => None,
                StatusKind::NoData | StatusKind::PredictionFailed => Some(StreamKind::Select),
            },
            DashboardEvent::Gate { .. } => None,
            DashboardEvent::Lagged { .. } => None,
        }
    }

    pub fn line(&self) -> Option<Line> {
        match self {
            DashboardEvent::Reading { line, .. }
            | DashboardEvent::IndexReset { line, .. }
            | DashboardEvent::Prediction { line, .. }
            | DashboardEvent::Status { line, .. }
            | DashboardEvent::Gate { line, .. } => Some(*line),
            DashboardEvent::Lagged { .. } => None,
        }
    }
}

/// Per-line, per-stream broadcast hub
#[derive(Clone)]
pub struct Broadcaster {
    press_insert: broadcast::Sender<DashboardEvent>,
    press_select: broadcast::Sender<DashboardEvent>,
    welding_insert: broadcast::Sender<DashboardEvent>,
    welding_select: broadcast::Sender<DashboardEvent>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            press_insert: broadcast::channel(capacity).0,
            press_select: broadcast::channel(capacity).0,
            welding_insert: broadcast::channel(capacity).0,
            welding_select: broadcast::channel(capacity).0,
        }
    }

    fn sender(&self, line: Line, kind: StreamKind) -> &broadcast::Sender<DashboardEvent> {
        match (line, kind) {
            (Line::Press, StreamKind::Insert) => &self.press_insert,
            (Line::Press, StreamKind::Select) => &self.press_select,
            (Line::Welding, StreamKind::Insert) => &self.welding_insert,
            (Line::Welding, StreamKind::Select) => &self.welding_select,
        }
    }

    /// Publish to the event's line/stream; returns how many subscribers got it
    ///
    /// Gate events go to the select stream of every line, since a global
    /// pause affects lines other than the one that caused it.
    pub fn publish(&self, event: DashboardEvent) -> usize {
        let Some(line) = event.line() else {
            return 0;
        };

        let targets: Vec<(Line, StreamKind)> = match (&event, event.stream()) {
            (DashboardEvent::Gate { .. }, _) => Line::ALL
                .into_iter()
                .map(|l| (l, StreamKind::Select))
                .collect(),
            (_, Some(kind)) => vec![(line, kind)],
            (_, None) => vec![(line, StreamKind::Insert), (line, StreamKind::Select)],
        };

        targets
            .into_iter()
            // send only fails when nobody is subscribed
            .map(|(l, k)| self.sender(l, k).send(event.clone()).unwrap_or(0))
            .sum()
    }

    pub fn subscribe(&self, line: Line, kind: StreamKind) -> broadcast::Receiver<DashboardEvent> {
        log::debug!("📡 New {} subscriber for {}", kind, line);
        self.sender(line, kind).subscribe()
    }

    pub fn subscriber_count(&self, line: Line, kind: StreamKind) -> usize {
        self.sender(line, kind).receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn reset(line: Line) -> DashboardEvent {
        DashboardEvent::IndexReset {
            line,
            message: "reset".to_string(),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = Broadcaster::new(4);
        assert_eq!(bus.publish(reset(Line::Press)), 0);
    }

    #[test]
    fn test_routes_by_line_and_stream() {
        let bus = Broadcaster::new(4);
        let mut press_insert = bus.subscribe(Line::Press, StreamKind::Insert);
        let mut press_select = bus.subscribe(Line::Press, StreamKind::Select);
        let mut welding_insert = bus.subscribe(Line::Welding, StreamKind::Insert);

        assert_eq!(bus.publish(reset(Line::Press)), 1);
        assert_eq!(press_insert.try_recv().unwrap(), reset(Line::Press));
        assert!(matches!(press_select.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(welding_insert.try_recv(), Err(TryRecvError::Empty)));

        let storage = DashboardEvent::Status {
            line: Line::Press,
            status: StatusKind::StorageError,
            message: "db down".to_string(),
        };
        assert_eq!(bus.publish(storage.clone()), 2);
        assert_eq!(press_insert.try_recv().unwrap(), storage);
        assert_eq!(press_select.try_recv().unwrap(), storage);
    }

    #[test]
    fn test_gate_event_reaches_every_select_stream() {
        let bus = Broadcaster::new(4);
        let mut press = bus.subscribe(Line::Press, StreamKind::Select);
        let mut welding = bus.subscribe(Line::Welding, StreamKind::Select);

        bus.publish(DashboardEvent::Gate {
            line: Line::Welding,
            gate: GateState::Running,
        });

        assert!(press.try_recv().is_ok());
        assert!(welding.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = Broadcaster::new(2);
        let mut rx = bus.subscribe(Line::Welding, StreamKind::Insert);

        for i in 0..5 {
            bus.publish(DashboardEvent::IndexReset {
                line: Line::Welding,
                message: format!("reset {}", i),
            });
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        match rx.recv().await.unwrap() {
            DashboardEvent::IndexReset { message, .. } => assert_eq!(message, "reset 3"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_dropping_receiver_unsubscribes() {
        let bus = Broadcaster::new(2);
        let rx = bus.subscribe(Line::Press, StreamKind::Select);
        assert_eq!(bus.subscriber_count(Line::Press, StreamKind::Select), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(Line::Press, StreamKind::Select), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(DashboardEvent::Prediction {
            line: Line::Welding,
            cycle_id: 4,
            trend_time: "2024-05-01T08:00:00.000000Z".to_string(),
            prediction: 1,
            abnormal: true,
        })
        .unwrap();
        assert_eq!(json["type"], "prediction");
        assert_eq!(json["line"], "welding");
        assert_eq!(json["prediction"], 1);
    }
}
