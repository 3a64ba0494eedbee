use crate::model::DashboardSnapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub circuitd_instances: Gauge,
    pub circuitd_instances_with_errors: Gauge,
    pub circuitd_instances_healthy: Gauge,
    pub circuitd_circuits_total: Gauge,
    pub circuitd_circuits_active: Gauge,
    pub circuitd_backends_total: Gauge,
    pub circuitd_backends_healthy: Gauge,
    pub circuitd_backend_sessions_total: Gauge,
    pub circuitd_backend_bytes_in_total: Gauge,
    pub circuitd_backend_bytes_out_total: Gauge,
    pub circuitd_backend_errors_total: Gauge,
    pub circuitd_backend_average_latency_ms: Gauge,
    pub circuitd_snapshot_builds_total: Counter,
    pub circuitd_snapshot_build_duration_seconds: Gauge,
    pub circuitd_last_snapshot_timestamp_seconds: Gauge,
    pub circuitd_collect_errors_total: CounterVec,
    pub circuitd_scrape_count_total: Counter,
    pub circuitd_subscribers: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let circuitd_instances = Gauge::with_opts(opts!(
            "circuitd_instances",
            "Number of proxy instances in the last snapshot"
        ))?;
        let circuitd_instances_with_errors = Gauge::with_opts(opts!(
            "circuitd_instances_with_errors",
            "Instances whose control port could not be read"
        ))?;
        let circuitd_instances_healthy = Gauge::with_opts(opts!(
            "circuitd_instances_healthy",
            "Instances without errors and with at least one circuit"
        ))?;
        let circuitd_circuits_total =
            Gauge::with_opts(opts!("circuitd_circuits_total", "Built circuits across the fleet"))?;
        let circuitd_circuits_active = Gauge::with_opts(opts!(
            "circuitd_circuits_active",
            "Circuits whose purpose is not CLOSED"
        ))?;
        let circuitd_backends_total = Gauge::with_opts(opts!(
            "circuitd_backends_total",
            "Load balancer members in the backend group"
        ))?;
        let circuitd_backends_healthy = Gauge::with_opts(opts!(
            "circuitd_backends_healthy",
            "Load balancer members with status UP"
        ))?;
        let circuitd_backend_sessions_total = Gauge::with_opts(opts!(
            "circuitd_backend_sessions_total",
            "Cumulative sessions over all members"
        ))?;
        let circuitd_backend_bytes_in_total = Gauge::with_opts(opts!(
            "circuitd_backend_bytes_in_total",
            "Bytes received over all members"
        ))?;
        let circuitd_backend_bytes_out_total = Gauge::with_opts(opts!(
            "circuitd_backend_bytes_out_total",
            "Bytes sent over all members"
        ))?;
        let circuitd_backend_errors_total = Gauge::with_opts(opts!(
            "circuitd_backend_errors_total",
            "Request, connection and response errors plus retries and redispatches"
        ))?;
        let circuitd_backend_average_latency_ms = Gauge::with_opts(opts!(
            "circuitd_backend_average_latency_ms",
            "Mean total session time over UP members"
        ))?;
        let circuitd_snapshot_builds_total = Counter::with_opts(opts!(
            "circuitd_snapshot_builds_total",
            "Number of snapshots built"
        ))?;
        let circuitd_snapshot_build_duration_seconds = Gauge::with_opts(opts!(
            "circuitd_snapshot_build_duration_seconds",
            "Duration of the last snapshot build"
        ))?;
        let circuitd_last_snapshot_timestamp_seconds = Gauge::with_opts(opts!(
            "circuitd_last_snapshot_timestamp_seconds",
            "Unix timestamp of the last snapshot"
        ))?;
        let circuitd_collect_errors_total = CounterVec::new(
            opts!(
                "circuitd_collect_errors_total",
                "Collection errors by source"
            ),
            &["source"],
        )?;
        let circuitd_scrape_count_total = Counter::with_opts(opts!(
            "circuitd_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let circuitd_subscribers = Gauge::with_opts(opts!(
            "circuitd_subscribers",
            "Live push subscribers"
        ))?;

        register(&registry, &circuitd_instances)?;
        register(&registry, &circuitd_instances_with_errors)?;
        register(&registry, &circuitd_instances_healthy)?;
        register(&registry, &circuitd_circuits_total)?;
        register(&registry, &circuitd_circuits_active)?;
        register(&registry, &circuitd_backends_total)?;
        register(&registry, &circuitd_backends_healthy)?;
        register(&registry, &circuitd_backend_sessions_total)?;
        register(&registry, &circuitd_backend_bytes_in_total)?;
        register(&registry, &circuitd_backend_bytes_out_total)?;
        register(&registry, &circuitd_backend_errors_total)?;
        register(&registry, &circuitd_backend_average_latency_ms)?;
        register(&registry, &circuitd_snapshot_builds_total)?;
        register(&registry, &circuitd_snapshot_build_duration_seconds)?;
        register(&registry, &circuitd_last_snapshot_timestamp_seconds)?;
        register(&registry, &circuitd_collect_errors_total)?;
        register(&registry, &circuitd_scrape_count_total)?;
        register(&registry, &circuitd_subscribers)?;

        Ok(Arc::new(Self {
            registry,
            circuitd_instances,
            circuitd_instances_with_errors,
            circuitd_instances_healthy,
            circuitd_circuits_total,
            circuitd_circuits_active,
            circuitd_backends_total,
            circuitd_backends_healthy,
            circuitd_backend_sessions_total,
            circuitd_backend_bytes_in_total,
            circuitd_backend_bytes_out_total,
            circuitd_backend_errors_total,
            circuitd_backend_average_latency_ms,
            circuitd_snapshot_builds_total,
            circuitd_snapshot_build_duration_seconds,
            circuitd_last_snapshot_timestamp_seconds,
            circuitd_collect_errors_total,
            circuitd_scrape_count_total,
            circuitd_subscribers,
        }))
    }

    pub fn update_from_snapshot(&self, snapshot: &DashboardSnapshot) {
        let summary = &snapshot.summary;
        let with_errors = snapshot
            .instances
            .iter()
            .filter(|entry| entry.error.is_some())
            .count();

        self.circuitd_instances.set(summary.total_instances as f64);
        self.circuitd_instances_with_errors.set(with_errors as f64);
        self.circuitd_instances_healthy
            .set(summary.healthy_instances as f64);
        self.circuitd_circuits_total.set(summary.total_circuits as f64);
        self.circuitd_circuits_active
            .set(summary.active_circuits as f64);
        self.circuitd_backends_total.set(summary.total_backends as f64);
        self.circuitd_backends_healthy
            .set(summary.healthy_backends as f64);
        self.circuitd_backend_sessions_total
            .set(summary.total_sessions as f64);
        self.circuitd_backend_bytes_in_total
            .set(summary.total_bytes_in as f64);
        self.circuitd_backend_bytes_out_total
            .set(summary.total_bytes_out as f64);
        self.circuitd_backend_errors_total
            .set(summary.total_errors as f64);
        self.circuitd_backend_average_latency_ms
            .set(summary.average_latency_ms);
        self.circuitd_last_snapshot_timestamp_seconds
            .set(snapshot.taken_at_unix as f64);
    }

    pub fn observe_build(&self, elapsed: Duration) {
        self.circuitd_snapshot_builds_total.inc();
        self.circuitd_snapshot_build_duration_seconds
            .set(elapsed.as_secs_f64());
    }

    pub fn set_subscribers(&self, count: usize) {
        self.circuitd_subscribers.set(count as f64);
    }

    pub fn inc_scrape_count(&self) {
        self.circuitd_scrape_count_total.inc();
    }

    pub fn inc_collect_error(&self, source: &str) {
        self.circuitd_collect_errors_total
            .with_label_values(&[source])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::empty_snapshot;

    #[test]
    fn snapshot_values_are_exported() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let mut snapshot = empty_snapshot(1_700_000_000);
        snapshot.summary.total_circuits = 7;
        snapshot.summary.average_latency_ms = 12.5;
        metrics.update_from_snapshot(&snapshot);
        metrics.observe_build(Duration::from_millis(250));
        metrics.inc_collect_error("routing");

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("circuitd_circuits_total 7"));
        assert!(text.contains("circuitd_backend_average_latency_ms 12.5"));
        assert!(text.contains("circuitd_snapshot_build_duration_seconds 0.25"));
        assert!(text.contains("circuitd_last_snapshot_timestamp_seconds 1700000000"));
        assert!(text.contains("circuitd_collect_errors_total{source=\"routing\"} 1"));
    }
}
