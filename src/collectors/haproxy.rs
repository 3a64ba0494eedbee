use crate::collectors::StatsSource;
use crate::config::StatsConfig;
use crate::metrics::Metrics;
use crate::model::{BackendRowKind, BackendStat, ErrorCounters};
use async_trait::async_trait;
use csv::{ReaderBuilder, StringRecord, Trim};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("ошибка запроса статистики: {0}")]
    Request(#[from] reqwest::Error),
    #[error("статистика вернула статус {0}")]
    Status(u16),
    #[error("ошибка разбора CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("в CSV нет колонки {0}")]
    MissingColumn(&'static str),
}

pub struct HaproxyStats {
    client: Client,
    url: String,
    timeout: Duration,
    backend_group: String,
    metrics: Option<Arc<Metrics>>,
}

impl HaproxyStats {
    pub fn new(client: Client, cfg: &StatsConfig) -> Self {
        Self {
            client,
            url: cfg.url.clone(),
            timeout: Duration::from_millis(cfg.timeout_ms),
            backend_group: cfg.backend_group.clone(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn try_fetch(&self) -> Result<Vec<BackendStat>, StatsError> {
        let resp = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(StatsError::Status(resp.status().as_u16()));
        }
        let body = resp.text().await?;
        parse_stats_csv(&body, &self.backend_group)
    }
}

#[async_trait]
impl StatsSource for HaproxyStats {
    async fn fetch(&self) -> Vec<BackendStat> {
        match self.try_fetch().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(url = %self.url, error = %err, "не удалось получить статистику балансировщика");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_collect_error("stats");
                }
                Vec::new()
            }
        }
    }
}

struct Columns(HashMap<String, usize>);

impl Columns {
    fn from_headers(headers: &StringRecord) -> Self {
        Self(
            headers
                .iter()
                .enumerate()
                .map(|(idx, name)| (name.to_string(), idx))
                .collect(),
        )
    }

    fn text<'r>(&self, record: &'r StringRecord, name: &str) -> &'r str {
        self.0
            .get(name)
            .and_then(|idx| record.get(*idx))
            .unwrap_or("")
    }

    fn number(&self, record: &StringRecord, name: &str) -> u64 {
        parse_u64_loose(self.text(record, name)).unwrap_or(0)
    }
}

pub fn parse_stats_csv(body: &str, backend_group: &str) -> Result<Vec<BackendStat>, StatsError> {
    let body = body.trim_start().trim_start_matches('#').trim_start();
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(body.as_bytes());

    let columns = Columns::from_headers(reader.headers()?);
    for required in ["pxname", "svname"] {
        if !columns.0.contains_key(required) {
            return Err(StatsError::MissingColumn(required));
        }
    }

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        if columns.text(&record, "pxname") != backend_group {
            continue;
        }
        let name = columns.text(&record, "svname").to_string();
        out.push(BackendStat {
            proxy: backend_group.to_string(),
            kind: BackendRowKind::from_svname(&name),
            name,
            status: columns.text(&record, "status").to_string(),
            current_sessions: columns.number(&record, "scur"),
            max_sessions: columns.number(&record, "smax"),
            total_sessions: columns.number(&record, "stot"),
            bytes_in: columns.number(&record, "bin"),
            bytes_out: columns.number(&record, "bout"),
            errors: ErrorCounters {
                request: columns.number(&record, "ereq"),
                connection: columns.number(&record, "econ"),
                response: columns.number(&record, "eresp"),
                retries: columns.number(&record, "wretr"),
                redispatches: columns.number(&record, "wredis"),
            },
            weight: columns.number(&record, "weight"),
            check_status: columns.text(&record, "check_status").to_string(),
            downtime_secs: columns.number(&record, "downtime"),
            latency_total_ms: columns.number(&record, "ttime"),
        });
    }
    Ok(out)
}

fn parse_u64_loose(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = trimmed.parse::<u64>() {
        return Some(v);
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| if v < 0.0 { 0 } else { v as u64 })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "# pxname,svname,qcur,qmax,scur,smax,slim,stot,bin,bout,dreq,dresp,ereq,econ,eresp,wretr,wredis,status,weight,act,bck,chkfail,chkdown,lastchg,downtime,check_status,ttime,
stats,FRONTEND,,,1,2,3000,10,1000,2000,0,0,0,,,,,OPEN,,,,,,,,,,
tor,tor1,0,0,2,5,,120,5000,9000,,0,,1,0,0,0,UP,1,1,0,0,0,50,0,L4OK,340,
tor,tor2,0,0,0,3,,80,100,200,,0,,4,2,1,0,DOWN,1,1,0,3,1,20,61,L4CON,n/a,
tor,BACKEND,0,0,2,8,300,200,5100,9200,0,0,,5,2,1,0,UP,2,2,0,,1,20,0,,170,
";

    #[test]
    fn keeps_only_backend_group_rows() {
        let rows = parse_stats_csv(SAMPLE, "tor").unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.proxy == "tor"));
        assert_eq!(rows[2].kind, BackendRowKind::Backend);
        assert!(rows[2].is_aggregate());
    }

    #[test]
    fn numbers_default_to_zero_and_status_passes_through() {
        let rows = parse_stats_csv(SAMPLE, "tor").unwrap();
        let tor1 = &rows[0];
        assert_eq!(tor1.name, "tor1");
        assert_eq!(tor1.status, "UP");
        assert_eq!(tor1.current_sessions, 2);
        assert_eq!(tor1.total_sessions, 120);
        assert_eq!(tor1.bytes_in, 5000);
        assert_eq!(tor1.errors.request, 0);
        assert_eq!(tor1.errors.connection, 1);
        assert_eq!(tor1.latency_total_ms, 340);
        assert_eq!(tor1.check_status, "L4OK");

        let tor2 = &rows[1];
        assert_eq!(tor2.status, "DOWN");
        assert_eq!(tor2.latency_total_ms, 0);
        assert_eq!(tor2.errors.total(), 4 + 2 + 1);
    }

    #[test]
    fn missing_header_is_an_error() {
        assert!(matches!(
            parse_stats_csv("foo,bar\n1,2\n", "tor"),
            Err(StatsError::MissingColumn("pxname"))
        ));
    }

    #[tokio::test]
    async fn unreachable_feed_yields_empty_list() {
        let cfg = StatsConfig {
            url: "http://127.0.0.1:9/;csv".to_string(),
            timeout_ms: 200,
            backend_group: "tor".to_string(),
            backend_name_template: "tor{ordinal}".to_string(),
            backend_names: Default::default(),
        };
        let stats = HaproxyStats::new(Client::new(), &cfg);
        assert!(stats.fetch().await.is_empty());
    }
}
