//! Prometheus metrics for the gateway
//!
//! Tracks: HTTP traffic, checkout order/capture outcomes, webhook
//! dispositions and external processor call latency.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Encoder, Histogram, HistogramOpts, IntCounter,
    IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Gateway metrics, registered on their own registry
pub struct Metrics {
    pub registry: Registry,

    pub http_requests_total: IntCounter,

    pub orders_created_total: IntCounter,
    pub captures_total: IntCounterVec,

    pub webhooks_total: IntCounterVec,

    pub processor_calls_total: IntCounterVec,
    pub processor_call_duration_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let http_requests_total = register_int_counter_with_registry!(
            Opts::new("gateway_http_requests_total", "Total HTTP requests processed"),
            registry
        )?;

        let orders_created_total = register_int_counter_with_registry!(
            Opts::new("gateway_orders_created_total", "Checkout orders created"),
            registry
        )?;

        let captures_total = register_int_counter_vec_with_registry!(
            Opts::new("gateway_captures_total", "Capture attempts by outcome"),
            &["outcome"],
            registry
        )?;

        let webhooks_total = register_int_counter_vec_with_registry!(
            Opts::new("gateway_webhooks_total", "Webhook deliveries by disposition"),
            &["disposition"],
            registry
        )?;

        let processor_calls_total = register_int_counter_vec_with_registry!(
            Opts::new(
                "gateway_processor_calls_total",
                "External processor calls by operation and outcome"
            ),
            &["operation", "outcome"],
            registry
        )?;

        let processor_call_duration_seconds = register_histogram_with_registry!(
            HistogramOpts::new(
                "gateway_processor_call_duration_seconds",
                "External processor call duration in seconds"
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            registry
        )?;

        Ok(Self {
            registry,
            http_requests_total,
            orders_created_total,
            captures_total,
            webhooks_total,
            processor_calls_total,
            processor_call_duration_seconds,
        })
    }

    /// Export all metrics in Prometheus text format
    pub fn export(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

/// Global metrics instance
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    Arc::new(Metrics::new().expect("Failed to initialize metrics"))
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_registered_metrics() {
        METRICS.http_requests_total.inc();
        METRICS
            .webhooks_total
            .with_label_values(&["ignored"])
            .inc();

        let text = METRICS.export().unwrap();
        assert!(text.contains("gateway_http_requests_total"));
        assert!(text.contains("gateway_webhooks_total"));
    }
}
