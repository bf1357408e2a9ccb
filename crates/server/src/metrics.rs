use std::time::Duration;

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

/// Metrics collects and exposes HTTP server and checkout metrics.
pub(crate) struct Metrics {
    registry: Registry,
    http_requests_total: CounterVec,
    http_request_duration_seconds: HistogramVec,
    errors_total: CounterVec,
    checkout_outcomes_total: CounterVec,
}

impl Metrics {
    pub(crate) fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "endpoint", "status"],
        )?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "endpoint"],
        )?;

        let errors_total = CounterVec::new(
            Opts::new("errors_total", "Total number of errors"),
            &["source", "endpoint"],
        )?;

        let checkout_outcomes_total = CounterVec::new(
            Opts::new("checkout_outcomes_total", "Checkout attempts by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(checkout_outcomes_total.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            errors_total,
            checkout_outcomes_total,
        })
    }

    pub(crate) fn record_request(&self, method: &str, endpoint: &str, status: u16, duration: Duration) {
        self.http_requests_total
            .with_label_values(&[method, endpoint, &status.to_string()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, endpoint])
            .observe(duration.as_secs_f64());
    }

    pub(crate) fn record_error(&self, source: &str, endpoint: &str) {
        self.errors_total.with_label_values(&[source, endpoint]).inc();
    }

    pub(crate) fn record_checkout(&self, outcome: &str) {
        self.checkout_outcomes_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Prometheus text exposition of every registered metric.
    pub(crate) fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buffer).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("POST", "/api/checkout", 201, Duration::from_millis(12));
        metrics.record_checkout("completed");
        metrics.record_error("http", "/api/checkout");

        let text = metrics.render().unwrap();
        assert!(text.contains("http_requests_total"));
        assert!(text.contains(r#"checkout_outcomes_total{outcome="completed"} 1"#));
        assert!(text.contains("errors_total"));
    }
}
