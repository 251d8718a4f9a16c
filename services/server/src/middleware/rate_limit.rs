use axum::extract::Request;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thand_shared::{Result, ServiceError};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Token bucket per client IP, guarding the public SAML callbacks. Buckets
/// idle past the configured window are swept.
pub struct TokenBucketLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    rate_per_second: f64,
    burst: u32,
    idle: Duration,
}

impl TokenBucketLimiter {
    pub fn new(rate_per_second: f64, burst: u32, idle: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate_per_second,
            burst,
            idle,
        }
    }

    /// Take one token for `key`, rejecting when the bucket is empty.
    pub fn check(&self, key: &str) -> Result<()> {
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.burst as f64,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * self.rate_per_second).min(self.burst as f64);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens < 1.0 {
            tracing::warn!(client = %key, "Rate limit exceeded");
            return Err(ServiceError::RateLimited);
        }
        bucket.tokens -= 1.0;
        Ok(())
    }

    pub fn sweep(&self) {
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_seen) < self.idle);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

/// Best-effort client IP: proxy headers first, then the socket address.
pub fn client_ip(request: &Request) -> String {
    let headers = request.headers();

    if let Some(forwarded) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("X-Real-IP").and_then(|v| v.to_str().ok()) {
        return real_ip.to_string();
    }
    if let Some(info) = request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
    {
        return info.0.ip().to_string();
    }
    "unknown".to_string()
}
