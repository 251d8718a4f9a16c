// Request counters surfaced by /metrics

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    started_at: Instant,
    total_requests: AtomicU64,
    elevate_requests: AtomicU64,
    auth_requests: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_requests: u64,
    pub elevate_requests: u64,
    pub auth_requests: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_requests: AtomicU64::new(0),
            elevate_requests: AtomicU64::new(0),
            auth_requests: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_elevate(&self) {
        self.elevate_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth(&self) {
        self.auth_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            elevate_requests: self.elevate_requests.load(Ordering::Relaxed),
            auth_requests: self.auth_requests.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
