/// Simple trait for metrics instrumentation
pub trait MetricsCollector: Send + Sync {
    fn inc_counter(&self, name: &str);
    fn observe_gauge(&self, name: &str, value: f64);
}

/// Collector that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn inc_counter(&self, _name: &str) {}
    fn observe_gauge(&self, _name: &str, _value: f64) {}
}
