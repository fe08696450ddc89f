//! Counters, gauges, and timings for the task pipelines.
//!
//! The trait is a minimal cadence-compatible surface; pipelines emit task
//! outcomes, cache hit rates, token spend, and call durations through it.
//! The no-op publisher is the default so development and tests never need a
//! statsd listener.

use async_trait::async_trait;
use cadence::{
    BufferedUdpMetricSink, Counted, Gauged, Metric, QueuingMetricSink, StatsdClient, Timed,
};
use std::net::UdpSocket;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

#[async_trait]
pub trait MetricsPublisher: Send + Sync {
    /// Increment a counter by 1.
    async fn incr(&self, key: &str);

    /// Increment a counter by 1 with tags.
    async fn incr_with_tags(&self, key: &str, tags: &[(&str, &str)]);

    /// Add `value` to a counter.
    async fn count(&self, key: &str, value: u64);

    /// Add `value` to a counter with tags.
    async fn count_with_tags(&self, key: &str, value: u64, tags: &[(&str, &str)]);

    /// Record a gauge value.
    async fn gauge(&self, key: &str, value: u64);

    /// Record a timing in milliseconds.
    async fn time(&self, key: &str, millis: u64);

    /// Record a timing in milliseconds with tags.
    async fn time_with_tags(&self, key: &str, millis: u64, tags: &[(&str, &str)]);
}

/// Shared handle the pipelines pass around.
pub type SharedMetricsPublisher = Arc<dyn MetricsPublisher>;

/// Swallows everything. Default for development and tests.
#[derive(Debug, Clone, Default)]
pub struct NoOpMetricsPublisher;

impl NoOpMetricsPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MetricsPublisher for NoOpMetricsPublisher {
    async fn incr(&self, _key: &str) {}
    async fn incr_with_tags(&self, _key: &str, _tags: &[(&str, &str)]) {}
    async fn count(&self, _key: &str, _value: u64) {}
    async fn count_with_tags(&self, _key: &str, _value: u64, _tags: &[(&str, &str)]) {}
    async fn gauge(&self, _key: &str, _value: u64) {}
    async fn time(&self, _key: &str, _millis: u64) {}
    async fn time_with_tags(&self, _key: &str, _millis: u64, _tags: &[(&str, &str)]) {}
}

/// Statsd publisher over buffered UDP, via cadence. Send failures are
/// logged by the queuing sink's error handler and never reach callers.
pub struct StatsdMetricsPublisher {
    client: StatsdClient,
    default_tags: Vec<(String, String)>,
}

impl StatsdMetricsPublisher {
    pub fn new(
        host: &str,
        prefix: &str,
        bind_addr: &str,
        default_tags: Vec<(String, String)>,
    ) -> Result<Self, MetricsError> {
        debug!(host, prefix, bind = bind_addr, "Creating statsd metrics publisher");
        let socket =
            UdpSocket::bind(bind_addr).map_err(|e| MetricsError::CreationFailed(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| MetricsError::CreationFailed(e.to_string()))?;

        let buffered_sink = BufferedUdpMetricSink::from(host, socket)
            .map_err(|e| MetricsError::CreationFailed(e.to_string()))?;
        let queuing_sink = QueuingMetricSink::builder()
            .with_error_handler(|error| {
                error!(error = %error, "Failed to send metric via sink");
            })
            .build(buffered_sink);
        Ok(Self {
            client: StatsdClient::from_sink(prefix, queuing_sink),
            default_tags,
        })
    }

    fn tagged<'a, M>(
        &'a self,
        mut builder: cadence::MetricBuilder<'a, 'a, M>,
        tags: &[(&'a str, &'a str)],
    ) -> cadence::MetricBuilder<'a, 'a, M>
    where
        M: Metric + From<String>,
    {
        for (key, value) in &self.default_tags {
            builder = builder.with_tag(key.as_str(), value.as_str());
        }
        for (key, value) in tags {
            builder = builder.with_tag(key, value);
        }
        builder
    }
}

#[async_trait]
impl MetricsPublisher for StatsdMetricsPublisher {
    async fn incr(&self, key: &str) {
        self.tagged(self.client.count_with_tags(key, 1), &[]).send();
    }

    async fn incr_with_tags(&self, key: &str, tags: &[(&str, &str)]) {
        self.tagged(self.client.count_with_tags(key, 1), tags).send();
    }

    async fn count(&self, key: &str, value: u64) {
        self.tagged(self.client.count_with_tags(key, value), &[]).send();
    }

    async fn count_with_tags(&self, key: &str, value: u64, tags: &[(&str, &str)]) {
        self.tagged(self.client.count_with_tags(key, value), tags).send();
    }

    async fn gauge(&self, key: &str, value: u64) {
        self.tagged(self.client.gauge_with_tags(key, value), &[]).send();
    }

    async fn time(&self, key: &str, millis: u64) {
        self.tagged(self.client.time_with_tags(key, millis), &[]).send();
    }

    async fn time_with_tags(&self, key: &str, millis: u64, tags: &[(&str, &str)]) {
        self.tagged(self.client.time_with_tags(key, millis), tags).send();
    }
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("error-tldw-metrics-1 Failed to create metrics publisher: {0}")]
    CreationFailed(String),

    #[error("error-tldw-metrics-2 Invalid metrics configuration: {0}")]
    InvalidConfig(String),
}

/// Comma-separated `key:value` pairs. Malformed entries are logged and
/// dropped.
pub fn parse_tags(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|tag| {
            let tag = tag.trim();
            if tag.is_empty() {
                return None;
            }
            match tag.split_once(':') {
                Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                    Some((key.to_string(), value.to_string()))
                }
                _ => {
                    error!(tag, "Invalid metrics tag format, expected key:value");
                    None
                }
            }
        })
        .collect()
}

/// Publisher keyed by the `METRICS_ADAPTER` setting: `noop` (or empty) and
/// `statsd` are known; anything else is a configuration error.
pub fn create_metrics_publisher(
    adapter: &str,
    statsd_host: Option<&str>,
    prefix: &str,
    statsd_bind: &str,
    tags: Option<&str>,
) -> Result<SharedMetricsPublisher, MetricsError> {
    match adapter {
        "noop" | "" => Ok(Arc::new(NoOpMetricsPublisher::new())),
        "statsd" => {
            let host = statsd_host.ok_or_else(|| {
                MetricsError::InvalidConfig(
                    "METRICS_STATSD_HOST is required when using statsd adapter".to_string(),
                )
            })?;
            let default_tags = tags.map(parse_tags).unwrap_or_default();
            let publisher = StatsdMetricsPublisher::new(host, prefix, statsd_bind, default_tags)?;
            Ok(Arc::new(publisher))
        }
        other => Err(MetricsError::InvalidConfig(format!(
            "Unknown metrics adapter: {other}"
        ))),
    }
}

/// Times one operation and reports it on `record`.
pub struct MetricTimer {
    start: std::time::Instant,
    metric: String,
    publisher: SharedMetricsPublisher,
    tags: Vec<(String, String)>,
}

impl MetricTimer {
    pub fn new(metric: impl Into<String>, publisher: SharedMetricsPublisher) -> Self {
        Self {
            start: std::time::Instant::now(),
            metric: metric.into(),
            publisher,
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub async fn record(self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        if self.tags.is_empty() {
            self.publisher.time(&self.metric, elapsed).await;
        } else {
            let tags: Vec<(&str, &str)> = self
                .tags
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            self.publisher
                .time_with_tags(&self.metric, elapsed, &tags)
                .await;
        }
    }
}
