use serde::{Deserialize, Serialize};

pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Instance {
    pub id: String,
    pub address: String,
    pub display_name: String,
    pub image: String,
    pub runtime_state: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Location {
    pub country: String,
    pub city: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Location {
    pub fn unknown() -> Self {
        Self {
            country: UNKNOWN.to_string(),
            city: UNKNOWN.to_string(),
            latitude: None,
            longitude: None,
        }
    }

    #[cfg(test)]
    pub fn is_unknown(&self) -> bool {
        self.country == UNKNOWN && self.latitude.is_none() && self.longitude.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Hop {
    pub fingerprint: String,
    pub nickname: String,
    pub address: String,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Circuit {
    pub circuit_id: String,
    pub purpose: String,
    /// Entry first, exit last.
    pub path: Vec<Hop>,
}

impl Circuit {
    pub fn exit_address(&self) -> Option<&str> {
        self.path
            .last()
            .map(|hop| hop.address.as_str())
            .filter(|addr| *addr != UNKNOWN)
    }

    pub fn is_active(&self) -> bool {
        !self.purpose.eq_ignore_ascii_case("closed")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendRowKind {
    Frontend,
    Backend,
    #[default]
    Server,
}

impl BackendRowKind {
    pub fn from_svname(svname: &str) -> Self {
        match svname {
            "FRONTEND" => Self::Frontend,
            "BACKEND" => Self::Backend,
            _ => Self::Server,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorCounters {
    pub request: u64,
    pub connection: u64,
    pub response: u64,
    pub retries: u64,
    pub redispatches: u64,
}

impl ErrorCounters {
    pub fn total(&self) -> u64 {
        self.request
            .saturating_add(self.connection)
            .saturating_add(self.response)
            .saturating_add(self.retries)
            .saturating_add(self.redispatches)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct BackendStat {
    pub proxy: String,
    pub name: String,
    pub kind: BackendRowKind,
    pub status: String,
    pub current_sessions: u64,
    pub max_sessions: u64,
    pub total_sessions: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub errors: ErrorCounters,
    pub weight: u64,
    pub check_status: String,
    pub downtime_secs: u64,
    pub latency_total_ms: u64,
}

impl BackendStat {
    pub fn unknown(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: UNKNOWN.to_string(),
            check_status: UNKNOWN.to_string(),
            ..Self::default()
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.kind != BackendRowKind::Server
    }

    pub fn is_up(&self) -> bool {
        self.status == "UP"
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InstanceEntry {
    #[serde(flatten)]
    pub instance: Instance,
    pub circuits: Vec<Circuit>,
    pub external_ip: Option<String>,
    pub error: Option<String>,
    pub backend: BackendStat,
}

impl InstanceEntry {
    pub fn is_healthy(&self) -> bool {
        self.error.is_none() && !self.circuits.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FleetHealth {
    pub status: HealthStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Summary {
    pub total_circuits: u64,
    pub active_circuits: u64,
    pub total_sessions: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub total_errors: u64,
    pub average_latency_ms: f64,
    pub healthy_backends: u64,
    pub total_backends: u64,
    pub healthy_instances: u64,
    pub total_instances: u64,
    pub uptime_secs: u64,
    pub health: FleetHealth,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DashboardSnapshot {
    pub instances: Vec<InstanceEntry>,
    pub backend_stats: Vec<BackendStat>,
    pub summary: Summary,
    pub discovery_error: Option<String>,
    pub taken_at: String,
    pub taken_at_unix: i64,
}
