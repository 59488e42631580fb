//! Prometheus counters exported on `/metrics`.

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

/// Service counters, registered on a registry owned by the instance so that
/// several services can live in one process.
pub struct Metrics {
    registry: Registry,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub transforms: IntCounter,
    pub transform_errors: IntCounter,
    pub rate_limited: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("imagecdn".to_string()), None)?;
        Ok(Self {
            cache_hits: counter(&registry, "cache_hits_total", "Requests whose first cache lookup hit")?,
            cache_misses: counter(&registry, "cache_misses_total", "Requests whose first cache lookup missed")?,
            transforms: counter(&registry, "transforms_total", "Successful image transformations")?,
            transform_errors: counter(&registry, "transform_errors_total", "Failed image transformations")?,
            rate_limited: counter(&registry, "rate_limited_total", "Requests rejected by the rate limiter")?,
            registry,
        })
    }

    /// Text exposition format, with its content type.
    pub fn render(&self) -> (String, Vec<u8>) {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        (encoder.format_type().to_string(), buffer)
    }
}
