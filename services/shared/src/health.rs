// Per-service health aggregation

use chrono::Utc;
use std::collections::HashMap;
use std::time::Instant;

use crate::error::Result;
use crate::types::{HealthCheck, HealthStatus};

#[async_trait::async_trait]
pub trait HealthCheckProvider: Send + Sync {
    async fn check(&self) -> Result<HealthCheck>;
    fn name(&self) -> &str;
}

pub struct HealthChecker {
    checks: Vec<Box<dyn HealthCheckProvider>>,
    version: String,
}

impl HealthChecker {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            checks: Vec::new(),
            version: version.into(),
        }
    }

    pub fn add_check<T: HealthCheckProvider + 'static>(&mut self, check: T) {
        self.checks.push(Box::new(check));
    }

    pub async fn check_health(&self) -> HealthStatus {
        let mut checks = HashMap::new();
        let mut overall_status = "healthy";

        for checker in &self.checks {
            let start = Instant::now();
            let result = checker.check().await;
            let duration = start.elapsed();

            let health_check = match result {
                Ok(check) => {
                    if check.status != "healthy" {
                        overall_status = "unhealthy";
                    }
                    check
                }
                Err(e) => {
                    overall_status = "unhealthy";
                    HealthCheck {
                        status: "unhealthy".to_string(),
                        message: Some(e.to_string()),
                        duration_ms: duration.as_millis() as u64,
                    }
                }
            };

            checks.insert(checker.name().to_string(), health_check);
        }

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: Utc::now(),
            version: self.version.clone(),
            checks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysHealthy;

    #[async_trait::async_trait]
    impl HealthCheckProvider for AlwaysHealthy {
        async fn check(&self) -> Result<HealthCheck> {
            Ok(HealthCheck {
                status: "healthy".to_string(),
                message: None,
                duration_ms: 0,
            })
        }

        fn name(&self) -> &str {
            "always"
        }
    }

    struct AlwaysBroken;

    #[async_trait::async_trait]
    impl HealthCheckProvider for AlwaysBroken {
        async fn check(&self) -> Result<HealthCheck> {
            Err(crate::ServiceError::Internal("boom".to_string()))
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_aggregated_health() {
        let mut checker = HealthChecker::new("0.1.0");
        checker.add_check(AlwaysHealthy);
        let status = checker.check_health().await;
        assert_eq!(status.status, "healthy");
        assert!(status.checks.contains_key("always"));

        checker.add_check(AlwaysBroken);
        let status = checker.check_health().await;
        assert_eq!(status.status, "unhealthy");
        assert_eq!(status.checks.get("broken").unwrap().status, "unhealthy");
    }
}
