//! Prediction client and per-line predictor loop
//!
//! ## API contract
//!
//! `POST <line url>` with `{"data": [f64, ...]}` (2 values for press, 4 for
//! welding) and expects `{"prediction": <label>}` back. Any non-200 status,
//! timeout or unreadable body is a failed cycle, never a crash.
//!
//! The predictor runs reactively: it checks its line on a short interval
//! and only calls the API when a new reading has been ingested since the
//! last successful prediction.

use super::backoff::ExponentialBackoff;
use super::broadcast::{Broadcaster, DashboardEvent, StatusKind};
use super::context::LineContext;
use super::db::TrendStore;
use super::error::PredictError;
use super::gate::ControlGate;
use super::types::{format_trend_time, CycleId, Line, PredictionRecord};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DEFAULT_NO_DATA_EVERY: Duration = Duration::from_secs(5);

#[async_trait]
pub trait PredictionClient: Send + Sync {
    /// Classify one feature vector for `line`
    async fn predict(&self, line: Line, features: &[f64]) -> Result<i64, PredictError>;
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    data: &'a [f64],
}

/// reqwest-backed client with one endpoint per line
pub struct HttpPredictionClient {
    client: reqwest::Client,
    endpoints: HashMap<Line, String>,
}

impl HttpPredictionClient {
    pub fn new(endpoints: HashMap<Line, String>, timeout: Duration) -> Result<Self, PredictError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(PredictError::Http)?;

        Ok(Self { client, endpoints })
    }
}

#[async_trait]
impl PredictionClient for HttpPredictionClient {
    async fn predict(&self, line: Line, features: &[f64]) -> Result<i64, PredictError> {
        let url = self.endpoints.get(&line).ok_or_else(|| {
            PredictError::MalformedResponse(format!("no prediction endpoint configured for {}", line))
        })?;

        log::debug!("📤 Sending {} features to {}: {:?}", line, url, features);

        let response = self
            .client
            .post(url)
            .json(&PredictRequest { data: features })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PredictError::Status(response.status().as_u16()));
        }

        let body: Value = response.json().await?;
        let label = body
            .get("prediction")
            .and_then(parse_label)
            .ok_or_else(|| PredictError::MalformedResponse(format!("no usable 'prediction' in {}", body)))?;

        log::debug!("📥 {} prediction received: {}", line, label);
        Ok(label)
    }
}

/// Accepts `1`, `1.0`, `"1"` or `[1]`
fn parse_label(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok().or_else(|| {
            s.trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        Value::Array(items) if items.len() == 1 => parse_label(&items[0]),
        _ => None,
    }
}

/// What counts as abnormal, and whether pause also stops prediction
#[derive(Debug, Clone)]
pub struct GatePolicy {
    pub gated_lines: Vec<Line>,
    pub abnormal_label: i64,
    pub pause_blocks_prediction: bool,
}

impl GatePolicy {
    pub fn is_abnormal(&self, line: Line, label: i64) -> bool {
        label == self.abnormal_label && self.gated_lines.contains(&line)
    }
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            gated_lines: vec![Line::Welding],
            abnormal_label: 1,
            pause_blocks_prediction: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredictOutcome {
    /// Line paused and policy blocks prediction while paused
    Paused,
    /// Nothing ingested yet
    NoData,
    /// Latest reading already predicted
    Unchanged,
    Predicted {
        cycle_id: CycleId,
        label: i64,
        abnormal: bool,
    },
    /// API or store failure; retried on a later check
    Failed,
}

pub struct LinePredictor {
    ctx: Arc<LineContext>,
    client: Arc<dyn PredictionClient>,
    store: Arc<dyn TrendStore>,
    bus: Broadcaster,
    gate: Arc<ControlGate>,
    policy: GatePolicy,
    interval: Duration,
    last_generation: u64,
    /// How often `no_data` is repeated while the line stays empty
    no_data_every: Duration,
    last_no_data: Option<Instant>,
}

impl LinePredictor {
    pub fn new(
        ctx: Arc<LineContext>,
        client: Arc<dyn PredictionClient>,
        store: Arc<dyn TrendStore>,
        bus: Broadcaster,
        gate: Arc<ControlGate>,
        policy: GatePolicy,
        interval: Duration,
    ) -> Self {
        Self {
            ctx,
            client,
            store,
            bus,
            gate,
            policy,
            interval,
            last_generation: 0,
            no_data_every: DEFAULT_NO_DATA_EVERY,
            last_no_data: None,
        }
    }

    /// Repeat the `no_data` status at most once per `every`
    ///
    /// Late subscribers get no replay, so the status keeps coming while the
    /// line has nothing to classify.
    pub fn with_no_data_every(mut self, every: Duration) -> Self {
        self.no_data_every = every;
        self
    }

    /// Predict the line's latest reading if it changed since the last success
    pub async fn check(&mut self) -> PredictOutcome {
        let line = self.ctx.line();

        if self.policy.pause_blocks_prediction && self.gate.is_paused(line) {
            return PredictOutcome::Paused;
        }

        let state = self.ctx.lock().await;

        let Some(latest) = state.latest.clone() else {
            let due = self
                .last_no_data
                .map_or(true, |at| at.elapsed() >= self.no_data_every);
            if due {
                log::debug!("💤 {} predictor waiting for first reading", line);
                self.publish_status(StatusKind::NoData, "No data yet".to_string());
                self.last_no_data = Some(Instant::now());
            }
            return PredictOutcome::NoData;
        };
        self.last_no_data = None;

        if state.generation == self.last_generation {
            return PredictOutcome::Unchanged;
        }
        let generation = state.generation;

        let label = match self.client.predict(line, &latest.reading.features()).await {
            Ok(label) => label,
            Err(e) => {
                log::error!("❌ {} prediction failed (cycle={}): {}", line, latest.cycle_id, e);
                self.publish_status(StatusKind::PredictionFailed, format!("Prediction failed: {}", e));
                return PredictOutcome::Failed;
            }
        };

        let record = PredictionRecord {
            line,
            cycle_id: latest.cycle_id,
            trend_time: latest.trend_time,
            prediction: label,
        };

        if let Err(e) = self.store.insert_prediction(&record).await {
            log::error!("❌ {} prediction insert failed (cycle={}): {}", line, latest.cycle_id, e);
            self.publish_status(
                StatusKind::StorageError,
                format!("prediction insert failed: {}", e),
            );
            return PredictOutcome::Failed;
        }
        self.last_generation = generation;

        let abnormal = self.policy.is_abnormal(line, label);
        self.bus.publish(DashboardEvent::Prediction {
            line,
            cycle_id: latest.cycle_id,
            trend_time: format_trend_time(&latest.trend_time),
            prediction: label,
            abnormal,
        });

        if abnormal {
            let reason = format!(
                "abnormal {} prediction {} for cycle {} (item {})",
                line, label, latest.cycle_id, latest.reading.item_no
            );
            // Close the gate before a waiting poller can take the line
            let transitioned = self.gate.pause(line, &reason);
            drop(state);
            if transitioned {
                self.bus.publish(DashboardEvent::Gate {
                    line,
                    gate: self.gate.state(line),
                });
            }
        } else {
            log::debug!("✅ {} cycle {} predicted normal ({})", line, latest.cycle_id, label);
        }

        PredictOutcome::Predicted {
            cycle_id: latest.cycle_id,
            label,
            abnormal,
        }
    }

    fn publish_status(&self, status: StatusKind, message: String) {
        self.bus.publish(DashboardEvent::Status {
            line: self.ctx.line(),
            status,
            message,
        });
    }

    /// Check on a short interval until cancelled, backing off after failures
    pub async fn run(mut self, cancel: CancellationToken) {
        let line = self.ctx.line();
        log::info!("🔮 Starting {} predictor (check interval: {}ms)", line, self.interval.as_millis());

        let mut backoff = ExponentialBackoff::new(self.interval, Duration::from_secs(30));

        loop {
            let delay = match self.check().await {
                PredictOutcome::Failed => {
                    let delay = backoff.next_delay();
                    log::warn!(
                        "⏳ {} predictor retry {} in {}ms",
                        line,
                        backoff.attempts(),
                        delay.as_millis()
                    );
                    delay
                }
                _ => {
                    backoff.reset();
                    self.interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => break,
            }
        }

        log::info!("✅ {} predictor stopped", line);
    }
}
