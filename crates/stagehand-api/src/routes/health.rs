//! Health check.

use axum::Json;
use axum::extract::Query;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Well-known endpoint resolved by the connectivity probe.
const PROBE_HOST: &str = "google.com:443";
const DEFAULT_PROBE_SECS: u64 = 5;

#[derive(Debug, Default, Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    pub perform_dns_lookup: bool,
    #[serde(default)]
    pub connectivity_check_duration: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub version: &'static str,
    pub ok: bool,
}

pub async fn healthz(Query(query): Query<HealthQuery>) -> Json<HealthResponse> {
    let ok = if query.perform_dns_lookup {
        let limit = Duration::from_secs(
            query
                .connectivity_check_duration
                .unwrap_or(DEFAULT_PROBE_SECS),
        );
        dns_probe(limit).await
    } else {
        true
    };

    Json(HealthResponse {
        version: env!("CARGO_PKG_VERSION"),
        ok,
    })
}

/// Keep resolving the probe host until it answers or the window closes.
async fn dns_probe(limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        match tokio::net::lookup_host(PROBE_HOST).await {
            Ok(mut addrs) => {
                if addrs.next().is_some() {
                    return true;
                }
                debug!(ok = true, "dns probe attempt failed");
            }
            outcome => {
                debug!(ok = outcome.is_ok(), "dns probe attempt failed");
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthz_without_probe() {
        let resp = healthz(Query(HealthQuery::default())).await;
        assert!(resp.0.ok);
        assert_eq!(resp.0.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_probe_with_tiny_window_terminates() {
        // Whatever the network says, the probe must respect its window.
        let started = std::time::Instant::now();
        let _ = dns_probe(Duration::from_millis(10)).await;
        assert!(started.elapsed() < Duration::from_secs(30));
    }
}
