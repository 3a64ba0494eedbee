use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default = "default_broadcast_interval_secs")]
    pub broadcast_interval_secs: u64,
    #[serde(default = "default_snapshot_ttl_secs")]
    pub snapshot_ttl_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_instance_deadline_ms")]
    pub instance_deadline_ms: u64,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub control: ControlConfig,
    pub stats: StatsConfig,
    #[serde(default)]
    pub geo: GeoConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InventoryConfig {
    Docker(DockerInventoryConfig),
    Static(StaticInventoryConfig),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerInventoryConfig {
    pub url: String,
    pub image: String,
    pub network: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StaticInventoryConfig {
    #[serde(default)]
    pub instances: Vec<StaticInstanceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StaticInstanceConfig {
    pub id: String,
    pub address: String,
    pub name: String,
    #[serde(default = "default_unknown")]
    pub image: String,
    #[serde(default = "default_static_state")]
    pub state: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    #[serde(default = "default_control_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_control_password_env")]
    pub password_env: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatsConfig {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub backend_group: String,
    #[serde(default = "default_backend_name_template")]
    pub backend_name_template: String,
    #[serde(default)]
    pub backend_names: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeoConfig {
    #[serde(default = "default_geo_database")]
    pub database: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            port: default_control_port(),
            password: None,
            password_env: default_control_password_env(),
            timeout_ms: default_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            database: default_geo_database(),
        }
    }
}

impl ControlConfig {
    /// Password from the environment wins over the one in the file.
    pub fn resolve_password(&self) -> Option<String> {
        if let Ok(v) = std::env::var(&self.password_env) {
            if !v.trim().is_empty() {
                return Some(v);
            }
        }
        self.password
            .as_ref()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.broadcast_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "broadcast_interval_secs должно быть >= 1".to_string(),
            ));
        }
        if self.snapshot_ttl_secs < 1 {
            return Err(ConfigError::Validation(
                "snapshot_ttl_secs должно быть >= 1".to_string(),
            ));
        }
        if self.max_concurrency < 1 {
            return Err(ConfigError::Validation(
                "max_concurrency должно быть >= 1".to_string(),
            ));
        }
        if self.instance_deadline_ms == 0 {
            return Err(ConfigError::Validation(
                "instance_deadline_ms должен быть > 0".to_string(),
            ));
        }

        validate_inventory(&self.inventory)?;
        validate_control(&self.control)?;
        validate_stats(&self.stats)?;

        if self.geo.database.trim().is_empty() {
            return Err(ConfigError::Validation(
                "geo.database не должен быть пустым".to_string(),
            ));
        }

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }

    pub fn instance_deadline(&self) -> Duration {
        Duration::from_millis(self.instance_deadline_ms)
    }
}

fn validate_inventory(cfg: &InventoryConfig) -> Result<(), ConfigError> {
    match cfg {
        InventoryConfig::Docker(docker) => {
            if docker.url.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "inventory.url не должен быть пустым".to_string(),
                ));
            }
            if docker.image.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "inventory.image не должен быть пустым".to_string(),
                ));
            }
            if docker.network.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "inventory.network не должен быть пустым".to_string(),
                ));
            }
            if docker.timeout_ms == 0 {
                return Err(ConfigError::Validation(
                    "inventory.timeout_ms должен быть > 0".to_string(),
                ));
            }
        }
        InventoryConfig::Static(list) => {
            let mut ids = HashSet::new();
            for instance in &list.instances {
                if instance.id.trim().is_empty() {
                    return Err(ConfigError::Validation(
                        "inventory.instances[*].id не должен быть пустым".to_string(),
                    ));
                }
                if !ids.insert(instance.id.clone()) {
                    return Err(ConfigError::Validation(format!(
                        "id инстанса '{}' должен быть уникальным",
                        instance.id
                    )));
                }
                if instance.address.trim().is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "инстанс '{}': address не должен быть пустым",
                        instance.id
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_control(cfg: &ControlConfig) -> Result<(), ConfigError> {
    if cfg.port == 0 {
        return Err(ConfigError::Validation(
            "control.port должен быть в диапазоне 1..65535".to_string(),
        ));
    }
    if cfg.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "control.timeout_ms должен быть > 0".to_string(),
        ));
    }
    if cfg.retry_attempts < 1 {
        return Err(ConfigError::Validation(
            "control.retry_attempts должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_stats(cfg: &StatsConfig) -> Result<(), ConfigError> {
    if cfg.url.trim().is_empty() {
        return Err(ConfigError::Validation(
            "stats.url не должен быть пустым".to_string(),
        ));
    }
    if cfg.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "stats.timeout_ms должен быть > 0".to_string(),
        ));
    }
    if cfg.backend_group.trim().is_empty() {
        return Err(ConfigError::Validation(
            "stats.backend_group не должен быть пустым".to_string(),
        ));
    }
    if !cfg.backend_name_template.contains("{ordinal}") {
        return Err(ConfigError::Validation(
            "stats.backend_name_template должен содержать {ordinal}".to_string(),
        ));
    }
    Ok(())
}

const fn default_broadcast_interval_secs() -> u64 {
    5
}

const fn default_snapshot_ttl_secs() -> u64 {
    4
}

const fn default_max_concurrency() -> usize {
    16
}

const fn default_instance_deadline_ms() -> u64 {
    20_000
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

const fn default_timeout_ms() -> u64 {
    3000
}

fn default_unknown() -> String {
    "unknown".to_string()
}

fn default_static_state() -> String {
    "running".to_string()
}

const fn default_control_port() -> u16 {
    9051
}

fn default_control_password_env() -> String {
    "CIRCUITD_CONTROL_PASSWORD".to_string()
}

const fn default_retry_attempts() -> u32 {
    3
}

const fn default_retry_base_ms() -> u64 {
    1000
}

fn default_backend_name_template() -> String {
    "tor{ordinal}".to_string()
}

fn default_geo_database() -> String {
    "GeoLite2-City.mmdb".to_string()
}
