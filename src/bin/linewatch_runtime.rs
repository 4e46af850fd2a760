//! Linewatch Runtime
//!
//! Starts one poller and one predictor per enabled line plus the dashboard
//! server, then runs until CTRL+C.
//!
//! Usage:
//!   cargo run --release --bin linewatch_runtime
//!
//! Environment variables (see `PipelineConfig::from_env` for the full list):
//!   LINEWATCH_RAW_DB_PATH - upstream raw database (default: data/raw.db)
//!   LINEWATCH_TREND_DB_PATH - trend database (default: data/trend.db)
//!   LINEWATCH_BIND_ADDR - dashboard address (default: 0.0.0.0:8000)
//!   POLL_INTERVAL_MS - ingestion tick (default: 5000)

use dotenv::dotenv;
use linewatch::pipeline::{
    Broadcaster, ControlGate, GatePolicy, HttpPredictionClient, LineContext, LinePoller,
    LinePredictor, PipelineConfig, PredictionClient, RawDataSource, SqliteRawSource,
    SqliteTrendStore, TrendStore,
};
use linewatch::server::{self, AppState};
use log::{error, info};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Linewatch Runtime");
    info!("   ├─ Version: {}", env!("CARGO_PKG_VERSION"));
    info!("   └─ Mode: raw table tailing + realtime prediction");

    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    let line_names: Vec<&str> = config.lines.iter().map(|l| l.as_str()).collect();
    info!("✅ Configuration loaded");
    info!("   ├─ Raw database: {}", config.raw_db_path);
    info!("   ├─ Trend database: {}", config.trend_db_path);
    info!("   ├─ Lines: {}", line_names.join(", "));
    info!("   ├─ Poll interval: {}ms", config.poll_interval_ms);
    info!("   ├─ Prediction check: {}ms (timeout {}ms)", config.predict_check_interval_ms, config.predict_timeout_ms);
    info!("   ├─ Cursor strategy: {:?}", config.cursor_strategy);
    info!("   ├─ Pause scope: {:?} (blocks prediction: {})", config.pause_scope, config.pause_blocks_prediction);
    info!("   └─ Dashboard: {}", config.bind_addr);

    // Initialize databases
    info!("🔧 Initializing trend database...");
    let store: Arc<dyn TrendStore> =
        Arc::new(SqliteTrendStore::open(&config.trend_db_path, config.db_pool_size)?);
    info!("✅ Trend database ready");

    info!("🔧 Validating raw tables...");
    let raw = SqliteRawSource::new(&config.raw_db_path, config.db_pool_size);
    if let Err(e) = raw.validate_schema(&config.lines) {
        error!("❌ Raw database check failed: {}", e);
        return Err(e.into());
    }
    let source: Arc<dyn RawDataSource> = Arc::new(raw);
    info!("✅ Raw tables validated");

    let endpoints = config
        .lines
        .iter()
        .map(|l| (*l, config.predict_url(*l).to_string()))
        .collect();
    let client: Arc<dyn PredictionClient> =
        Arc::new(HttpPredictionClient::new(endpoints, config.predict_timeout())?);

    let gate = Arc::new(ControlGate::new(config.pause_scope));
    let bus = Broadcaster::new(config.broadcast_capacity);
    let policy = GatePolicy {
        gated_lines: config.gated_lines.clone(),
        abnormal_label: config.abnormal_label,
        pause_blocks_prediction: config.pause_blocks_prediction,
    };
    let cancel = CancellationToken::new();

    // Spawn per-line tasks
    info!("🚀 Spawning line tasks...");
    let mut contexts = Vec::new();
    let mut handles = Vec::new();
    for line in &config.lines {
        let ctx = Arc::new(LineContext::new(*line, config.cursor_strategy));
        contexts.push(ctx.clone());

        let poller = LinePoller::new(
            ctx.clone(),
            source.clone(),
            store.clone(),
            bus.clone(),
            gate.clone(),
            config.poll_interval(),
        );
        handles.push(tokio::spawn(poller.run(cancel.clone())));

        let predictor = LinePredictor::new(
            ctx,
            client.clone(),
            store.clone(),
            bus.clone(),
            gate.clone(),
            policy.clone(),
            config.predict_check_interval(),
        )
        .with_no_data_every(config.poll_interval());
        handles.push(tokio::spawn(predictor.run(cancel.clone())));

        info!("   ├─ ✅ {} poller + predictor spawned", line);
    }

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("   └─ ✅ Dashboard listening on {}", listener.local_addr()?);

    let state = AppState::new(contexts, gate, bus, store, cancel.clone());
    let server = tokio::spawn(server::serve(listener, state));

    info!("");
    info!("🔄 Press CTRL+C to shutdown gracefully");

    // Wait for CTRL+C
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!("❌ Line task panicked: {}", e);
        }
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("❌ Dashboard server error: {}", e),
        Err(e) => error!("❌ Dashboard server task panicked: {}", e),
    }

    info!("✅ Linewatch runtime stopped");
    Ok(())
}
