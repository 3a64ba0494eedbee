use crate::cache::SnapshotSource;
use crate::collectors::docker::InventoryError;
use crate::collectors::{InventorySource, StatsSource};
use crate::metrics::Metrics;
use crate::model::{
    BackendStat, DashboardSnapshot, FleetHealth, HealthStatus, Instance, InstanceEntry, Summary,
};
use crate::routing::{CircuitReport, RoutingClient};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, warn};

/// Overrides by instance name or id win over the `{ordinal}` template.
#[derive(Debug, Clone)]
pub struct BackendMatcher {
    template: String,
    overrides: BTreeMap<String, String>,
}

impl BackendMatcher {
    pub fn new(template: impl Into<String>, overrides: BTreeMap<String, String>) -> Self {
        Self {
            template: template.into(),
            overrides,
        }
    }

    pub fn backend_name(&self, instance: &Instance) -> Option<String> {
        if let Some(name) = self
            .overrides
            .get(&instance.display_name)
            .or_else(|| self.overrides.get(&instance.id))
        {
            return Some(name.clone());
        }
        ordinal_suffix(&instance.display_name).map(|n| self.template.replace("{ordinal}", n))
    }
}

fn ordinal_suffix(name: &str) -> Option<&str> {
    let head = name.trim_end_matches(|c: char| c.is_ascii_digit());
    let digits = &name[head.len()..];
    (!digits.is_empty()).then_some(digits)
}

pub struct Aggregator {
    inventory: Arc<dyn InventorySource>,
    routing: Arc<RoutingClient>,
    stats: Arc<dyn StatsSource>,
    matcher: BackendMatcher,
    max_concurrency: usize,
    instance_deadline: Duration,
    started_at: Instant,
    metrics: Option<Arc<Metrics>>,
}

impl Aggregator {
    pub fn new(
        inventory: Arc<dyn InventorySource>,
        routing: Arc<RoutingClient>,
        stats: Arc<dyn StatsSource>,
        matcher: BackendMatcher,
        max_concurrency: usize,
        instance_deadline: Duration,
    ) -> Self {
        Self {
            inventory,
            routing,
            stats,
            matcher,
            max_concurrency: max_concurrency.max(1),
            instance_deadline,
            started_at: Instant::now(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn routing(&self) -> &RoutingClient {
        &self.routing
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>, InventoryError> {
        let mut instances = self.discover().await?;
        instances.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(instances)
    }

    pub async fn find_instance(&self, id: &str) -> Result<Option<Instance>, InventoryError> {
        Ok(self
            .discover()
            .await?
            .into_iter()
            .find(|instance| instance.id == id))
    }

    async fn discover(&self) -> Result<Vec<Instance>, InventoryError> {
        self.inventory.list().await.inspect_err(|_| {
            if let Some(metrics) = &self.metrics {
                metrics.inc_collect_error("inventory");
            }
        })
    }

    pub async fn build(&self) -> DashboardSnapshot {
        let cycle_started = Instant::now();
        let (instances, discovery_error) = match self.discover().await {
            Ok(instances) => (instances, None),
            Err(err) => {
                warn!(error = %err, "не удалось получить список инстансов, снимок будет пустым");
                (Vec::new(), Some(err.to_string()))
            }
        };

        let (reports, backend_stats) =
            tokio::join!(self.fetch_all(&instances), self.stats.fetch());

        let snapshot = assemble(
            instances,
            reports,
            backend_stats,
            &self.matcher,
            discovery_error,
            self.started_at.elapsed().as_secs(),
            SystemTime::now(),
        );

        let elapsed = cycle_started.elapsed();
        debug!(
            instances = snapshot.instances.len(),
            circuits = snapshot.summary.total_circuits,
            elapsed_ms = elapsed.as_millis() as u64,
            "снимок собран"
        );
        if let Some(metrics) = &self.metrics {
            let failed = snapshot
                .instances
                .iter()
                .filter(|entry| entry.error.is_some())
                .count();
            for _ in 0..failed {
                metrics.inc_collect_error("routing");
            }
            metrics.observe_build(elapsed);
            metrics.update_from_snapshot(&snapshot);
        }
        snapshot
    }

    async fn fetch_all(&self, instances: &[Instance]) -> Vec<CircuitReport> {
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let deadline = self.instance_deadline;
        let mut tasks = JoinSet::new();

        for (idx, instance) in instances.iter().cloned().enumerate() {
            let routing = self.routing.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let report = match time::timeout(deadline, routing.fetch_circuits(&instance)).await
                {
                    Ok(report) => report,
                    Err(_elapsed) => {
                        warn!(instance = %instance.id, "опрос инстанса не уложился в лимит времени");
                        CircuitReport::failed(format!(
                            "превышен лимит времени опроса ({})",
                            humantime::format_duration(deadline)
                        ))
                    }
                };
                (idx, report)
            });
        }

        let mut reports = vec![
            CircuitReport::failed("опрос инстанса прерван".to_string());
            instances.len()
        ];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, report)) => reports[idx] = report,
                Err(err) => warn!(error = %err, "задача опроса инстанса завершилась с ошибкой"),
            }
        }
        reports
    }
}

#[async_trait]
impl SnapshotSource for Aggregator {
    async fn build(&self) -> DashboardSnapshot {
        let snapshot = Aggregator::build(self).await;
        info!(
            instances = snapshot.summary.total_instances,
            healthy = snapshot.summary.healthy_instances,
            circuits = snapshot.summary.total_circuits,
            "снимок флота обновлён"
        );
        snapshot
    }
}

pub fn assemble(
    instances: Vec<Instance>,
    reports: Vec<CircuitReport>,
    backend_stats: Vec<BackendStat>,
    matcher: &BackendMatcher,
    discovery_error: Option<String>,
    uptime_secs: u64,
    now: SystemTime,
) -> DashboardSnapshot {
    let mut entries: Vec<InstanceEntry> = instances
        .into_iter()
        .zip(reports)
        .map(|(instance, report)| {
            let backend_name = matcher.backend_name(&instance);
            let backend = backend_name
                .as_deref()
                .and_then(|name| {
                    backend_stats
                        .iter()
                        .find(|row| !row.is_aggregate() && row.name == name)
                })
                .cloned()
                .unwrap_or_else(|| BackendStat::unknown(backend_name.as_deref().unwrap_or("")));
            InstanceEntry {
                instance,
                circuits: report.circuits,
                external_ip: report.external_ip,
                error: report.error,
                backend,
            }
        })
        .collect();
    entries.sort_by(|a, b| {
        a.instance
            .display_name
            .cmp(&b.instance.display_name)
            .then_with(|| a.instance.id.cmp(&b.instance.id))
    });

    let summary = summarize(&entries, &backend_stats, uptime_secs);
    let taken_at_unix = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    DashboardSnapshot {
        instances: entries,
        backend_stats,
        summary,
        discovery_error,
        taken_at: humantime::format_rfc3339_seconds(now).to_string(),
        taken_at_unix,
    }
}

pub fn summarize(entries: &[InstanceEntry], backend_stats: &[BackendStat], uptime_secs: u64) -> Summary {
    let total_circuits = entries.iter().map(|e| e.circuits.len() as u64).sum();
    let active_circuits = entries
        .iter()
        .flat_map(|e| e.circuits.iter())
        .filter(|c| c.is_active())
        .count() as u64;

    let members: Vec<&BackendStat> = backend_stats.iter().filter(|b| !b.is_aggregate()).collect();
    let up: Vec<&BackendStat> = members.iter().copied().filter(|b| b.is_up()).collect();
    let average_latency_ms = if up.is_empty() {
        0.0
    } else {
        up.iter().map(|b| b.latency_total_ms as f64).sum::<f64>() / up.len() as f64
    };

    let healthy_instances = entries.iter().filter(|e| e.is_healthy()).count() as u64;
    let total_instances = entries.len() as u64;

    Summary {
        total_circuits,
        active_circuits,
        total_sessions: members.iter().map(|b| b.total_sessions).sum(),
        total_bytes_in: members.iter().map(|b| b.bytes_in).sum(),
        total_bytes_out: members.iter().map(|b| b.bytes_out).sum(),
        total_errors: members.iter().map(|b| b.errors.total()).sum(),
        average_latency_ms,
        healthy_backends: up.len() as u64,
        total_backends: members.len() as u64,
        healthy_instances,
        total_instances,
        uptime_secs,
        health: fleet_health(healthy_instances, total_instances, active_circuits),
    }
}

fn fleet_health(healthy: u64, total: u64, active_circuits: u64) -> FleetHealth {
    if healthy == 0 {
        return FleetHealth {
            status: HealthStatus::Critical,
            message: "все инстансы недоступны".to_string(),
        };
    }
    if healthy * 2 < total {
        return FleetHealth {
            status: HealthStatus::Warning,
            message: format!("исправно {healthy}/{total} инстансов"),
        };
    }
    if active_circuits == 0 {
        return FleetHealth {
            status: HealthStatus::Warning,
            message: "нет активных цепочек".to_string(),
        };
    }
    FleetHealth {
        status: HealthStatus::Healthy,
        message: format!("{healthy}/{total} инстансов, {active_circuits} цепочек"),
    }
}
