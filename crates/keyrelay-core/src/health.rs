use std::time::{Duration, Instant};

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tracing::{info, warn};

use keyrelay_provider_core::{HealthStatus, HttpMethod, UpstreamHttpRequest};
use keyrelay_storage::UpstreamKey;

use crate::forwarder::upstream_headers;
use crate::state::AppState;

/// Runs a sweep when the interval has elapsed and nobody else is sweeping.
/// An interval of zero turns periodic sweeps off.
pub async fn sweep_if_due(state: &AppState, keys: &[UpstreamKey]) {
    if state.health.interval().is_zero() || keys.is_empty() {
        return;
    }
    let Some(guard) = state.health.try_begin_sweep(false) else {
        return;
    };
    let results = probe_all(state, keys).await;
    guard.publish(results);
}

/// Sweeps now unless one is already in flight. Returns whether this call swept.
pub async fn force_sweep(state: &AppState, keys: &[UpstreamKey]) -> bool {
    let Some(guard) = state.health.try_begin_sweep(true) else {
        return false;
    };
    let results = probe_all(state, keys).await;
    guard.publish(results);
    true
}

async fn probe_all(state: &AppState, keys: &[UpstreamKey]) -> Vec<(String, HealthStatus)> {
    let started = Instant::now();
    let mut futs = FuturesUnordered::new();
    for key in keys {
        futs.push(async move { (key.name.clone(), probe_key(state, key).await) });
    }

    let mut results = Vec::with_capacity(keys.len());
    while let Some(item) = futs.next().await {
        results.push(item);
    }

    let healthy = results
        .iter()
        .filter(|(_, status)| *status == HealthStatus::Healthy)
        .count();
    info!(
        event = "health_sweep",
        keys = results.len(),
        healthy,
        elapsed_ms = started.elapsed().as_millis() as u64
    );
    results
}

/// `GET {base}/models` with the key; any 2xx is healthy, everything else is not.
pub async fn probe_key(state: &AppState, key: &UpstreamKey) -> HealthStatus {
    let config = state.config();
    let req = UpstreamHttpRequest {
        method: HttpMethod::Get,
        url: format!("{}/models", config.upstream_base_url),
        headers: upstream_headers(&config, &key.value),
        body: None,
    };
    let timeout = Duration::from_secs(config.health_probe_timeout_secs.max(1));

    match tokio::time::timeout(timeout, state.upstream.send(req)).await {
        Ok(Ok(resp)) => {
            if !resp.is_success() {
                warn!(event = "health_probe_failed", key = %key.name, status = resp.status);
            }
            HealthStatus::from_probe(resp.is_success())
        }
        Ok(Err(err)) => {
            warn!(event = "health_probe_failed", key = %key.name, error = %err);
            HealthStatus::Unhealthy
        }
        Err(_) => {
            warn!(event = "health_probe_failed", key = %key.name, error = "timeout");
            HealthStatus::Unhealthy
        }
    }
}
