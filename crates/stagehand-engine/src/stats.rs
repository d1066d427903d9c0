//! OS stats sampling for the destroy response.
//!
//! The collector starts at setup, samples on an interval, and hands one
//! aggregate back when the stage is destroyed.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Aggregated stats returned by `/destroy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OsStats {
    pub samples: u64,
    pub uptime_secs: u64,
    /// Peak memory-in-use observed across samples, in kilobytes.
    pub peak_mem_used_kb: u64,
    /// Average memory-in-use across samples, in kilobytes.
    pub avg_mem_used_kb: u64,
}

#[derive(Default)]
struct Accumulator {
    samples: u64,
    peak_mem_kb: u64,
    total_mem_kb: u64,
}

pub struct StatsCollector {
    acc: Arc<Mutex<Accumulator>>,
    started_at: Instant,
    stop: CancellationToken,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            acc: Arc::new(Mutex::new(Accumulator::default())),
            started_at: Instant::now(),
            stop: CancellationToken::new(),
        }
    }

    /// Begin background sampling.
    pub fn start(&self) {
        let acc = Arc::clone(&self.acc);
        let stop = self.stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let used = memory_used_kb();
                        let mut acc = acc.lock();
                        acc.samples += 1;
                        acc.total_mem_kb += used;
                        acc.peak_mem_kb = acc.peak_mem_kb.max(used);
                    }
                    _ = stop.cancelled() => {
                        debug!("stats sampler stopped");
                        return;
                    }
                }
            }
        });
    }

    /// Stop sampling. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// The aggregate over everything sampled so far.
    pub fn aggregate(&self) -> OsStats {
        let acc = self.acc.lock();
        OsStats {
            samples: acc.samples,
            uptime_secs: self.started_at.elapsed().as_secs(),
            peak_mem_used_kb: acc.peak_mem_kb,
            avg_mem_used_kb: if acc.samples > 0 {
                acc.total_mem_kb / acc.samples
            } else {
                0
            },
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Memory in use on the host, in kilobytes. Zero when unavailable.
#[cfg(target_os = "linux")]
fn memory_used_kb() -> u64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    let mut total = 0u64;
    let mut available = 0u64;
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0),
            Some("MemAvailable:") => {
                available = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0)
            }
            _ => {}
        }
    }
    total.saturating_sub(available)
}

#[cfg(not(target_os = "linux"))]
fn memory_used_kb() -> u64 {
    0
}
