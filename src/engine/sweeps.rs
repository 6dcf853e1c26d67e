use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use crate::engine::DispatchEngine;

/// Periodically expire overdue offers. Errors are logged and the loop keeps
/// going; a failed pass is retried on the next tick.
pub async fn run_expiry_sweep(engine: Arc<DispatchEngine>, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "expiry sweep started");
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        match engine.run_expiry_sweep_once().await {
            Ok(0) => {}
            Ok(count) => info!(count, "expired overdue assignments"),
            Err(err) => error!(error = %err, "expiry sweep pass failed"),
        }
    }
}

/// Periodically consume due retry tasks.
pub async fn run_retry_sweep(engine: Arc<DispatchEngine>, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "retry sweep started");
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        match engine.run_retry_sweep_once(Utc::now()).await {
            Ok(processed) if processed.is_empty() => {}
            Ok(processed) => info!(count = processed.len(), "processed retry tasks"),
            Err(err) => error!(error = %err, "retry sweep pass failed"),
        }
    }
}
