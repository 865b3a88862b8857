use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::HealthCheckError;
use crate::registry::InstanceRegistry;
use crate::types::PoolType;

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Appended to each instance url to build the probe url.
    pub path: String,
    /// Value of the `status` body field that counts as healthy.
    pub healthy_status: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            path: "/health".to_string(),
            healthy_status: "healthy".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
}

/// Probes every registered instance and records the outcome in the registry.
/// The registry's only writer.
pub struct HealthChecker {
    registry: Arc<InstanceRegistry>,
    client: reqwest::Client,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        config: HealthCheckConfig,
    ) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("pool-assigner health checker")
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            registry,
            client,
            config,
        })
    }

    fn probe_url(&self, instance_url: &str) -> String {
        format!(
            "{}/{}",
            instance_url.trim_end_matches('/'),
            self.config.path.trim_start_matches('/')
        )
    }

    /// Probe a single instance. Any outcome other than a 200 carrying the
    /// healthy status is an error.
    pub async fn probe(&self, instance_url: &str) -> Result<(), HealthCheckError> {
        let response = self.client.get(self.probe_url(instance_url)).send().await?;

        if response.status() != StatusCode::OK {
            return Err(HealthCheckError::Status(response.status()));
        }

        let body: HealthResponse = response.json().await?;
        if body.status == self.config.healthy_status {
            Ok(())
        } else {
            Err(HealthCheckError::NotHealthy(body.status))
        }
    }

    /// Probe every instance concurrently and update the registry.
    ///
    /// Probes are independent: a slow or failing instance only marks itself
    /// unhealthy, bounded by the client timeout.
    pub async fn check_all(&self) {
        let urls: BTreeSet<String> = self
            .registry
            .all()
            .into_iter()
            .map(|instance| instance.url)
            .collect();

        let outcomes = join_all(urls.iter().map(|url| async move {
            let result = self.probe(url).await;
            (url, result)
        }))
        .await;

        for (url, result) in outcomes {
            let is_healthy = result.is_ok();
            let previous = self.registry.mark_health(url, is_healthy, Utc::now());

            metrics::counter!(
                "pool_health_checks_total",
                &[("healthy", is_healthy.to_string())]
            )
            .increment(1);

            // Only flips are logged
            match (previous, result) {
                (Some(false), Ok(())) => info!(url = %url, "instance became healthy"),
                (Some(true), Err(error)) => {
                    warn!(url = %url, error = %error, "instance became unhealthy")
                }
                (_, Err(error)) => debug!(url = %url, error = %error, "instance still unhealthy"),
                _ => {}
            }
        }

        for pool_type in PoolType::ALL {
            metrics::gauge!("pool_healthy_instances", &[("pool_type", pool_type.to_string())])
                .set(self.registry.healthy_of(pool_type).len() as f64);
        }
    }

    /// Sweep on every interval until cancelled. The startup sweep is the
    /// caller's, so the first one here happens one interval in.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = interval_at(Instant::now() + self.config.interval, self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => self.check_all().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn checker(urls: Vec<String>, timeout: Duration) -> (Arc<InstanceRegistry>, HealthChecker) {
        let registry = Arc::new(InstanceRegistry::new([(PoolType::Simple, urls)]));
        let config = HealthCheckConfig {
            timeout,
            ..HealthCheckConfig::default()
        };
        let checker = HealthChecker::new(registry.clone(), config).unwrap();
        (registry, checker)
    }

    #[tokio::test]
    async fn test_healthy_sentinel_marks_instance_healthy() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"status": "healthy", "uptime": 12}"#);
        });
        let (registry, checker) = checker(vec![server.base_url()], Duration::from_secs(5));

        checker.check_all().await;

        mock.assert();
        assert!(registry.is_healthy(&server.base_url()));
        let instance = &registry.list(PoolType::Simple)[0];
        assert!(instance.health.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_anything_else_marks_instance_unhealthy() {
        let wrong_status = MockServer::start();
        wrong_status.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(503).body(r#"{"status": "healthy"}"#);
        });
        let wrong_sentinel = MockServer::start();
        wrong_sentinel.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(200).body(r#"{"status": "degraded"}"#);
        });
        let malformed = MockServer::start();
        malformed.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(200).body("ok");
        });

        let urls = vec![
            wrong_status.base_url(),
            wrong_sentinel.base_url(),
            malformed.base_url(),
            // Nothing listens here
            "http://127.0.0.1:1".to_string(),
        ];
        let (registry, checker) = checker(urls.clone(), Duration::from_secs(5));
        for url in &urls {
            registry.mark_health(url, true, Utc::now());
        }

        checker.check_all().await;

        for url in &urls {
            assert!(!registry.is_healthy(url), "{url} should be unhealthy");
        }
    }

    #[tokio::test]
    async fn test_slow_probe_does_not_block_the_others() {
        let slow = MockServer::start();
        slow.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(200)
                .delay(Duration::from_secs(3))
                .body(r#"{"status": "healthy"}"#);
        });
        let fast = MockServer::start();
        fast.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(200).body(r#"{"status": "healthy"}"#);
        });
        let (registry, checker) = checker(
            vec![slow.base_url(), fast.base_url()],
            Duration::from_millis(200),
        );

        let started = std::time::Instant::now();
        checker.check_all().await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!registry.is_healthy(&slow.base_url()));
        assert!(registry.is_healthy(&fast.base_url()));
    }

    #[test]
    fn test_probe_url_joins_without_double_slashes() {
        let (_, checker) = checker(Vec::new(), Duration::from_secs(1));

        assert_eq!(checker.probe_url("http://a:8001/"), "http://a:8001/health");
        assert_eq!(checker.probe_url("http://a:8001"), "http://a:8001/health");
    }
}
