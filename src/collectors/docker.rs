use crate::collectors::InventorySource;
use crate::config::{DockerInventoryConfig, StaticInventoryConfig};
use crate::model::{Instance, UNKNOWN};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("источник инстансов недоступен: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("источник инстансов вернул статус {0}")]
    Status(u16),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSummary {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    image: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    network_settings: Option<NetworkSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(default)]
    networks: HashMap<String, EndpointSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointSettings {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

pub struct DockerInventory {
    client: Client,
    cfg: DockerInventoryConfig,
}

impl DockerInventory {
    pub fn new(client: Client, cfg: DockerInventoryConfig) -> Self {
        Self { client, cfg }
    }
}

#[async_trait]
impl InventorySource for DockerInventory {
    async fn list(&self) -> Result<Vec<Instance>, InventoryError> {
        let url = format!("{}/containers/json", self.cfg.url.trim_end_matches('/'));
        let filters = serde_json::json!({ "ancestor": [self.cfg.image] }).to_string();
        let resp = self
            .client
            .get(url)
            .query(&[("filters", filters)])
            .timeout(Duration::from_millis(self.cfg.timeout_ms))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(InventoryError::Status(resp.status().as_u16()));
        }
        let containers: Vec<ContainerSummary> = resp.json().await?;
        Ok(containers
            .into_iter()
            .map(|c| container_to_instance(c, &self.cfg.network))
            .collect())
    }
}

fn container_to_instance(container: ContainerSummary, network: &str) -> Instance {
    let address = container
        .network_settings
        .and_then(|mut ns| ns.networks.remove(network))
        .map(|ep| ep.ip_address)
        .unwrap_or_default();
    let display_name = container
        .names
        .first()
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| container.id.chars().take(12).collect());
    let image = if container.image.is_empty() {
        UNKNOWN.to_string()
    } else {
        container.image
    };

    Instance {
        id: container.id,
        address,
        display_name,
        image,
        runtime_state: container.state,
    }
}

pub struct StaticInventory {
    instances: Vec<Instance>,
}

impl StaticInventory {
    pub fn new(cfg: &StaticInventoryConfig) -> Self {
        Self::from_instances(
            cfg.instances
                .iter()
                .map(|i| Instance {
                    id: i.id.clone(),
                    address: i.address.clone(),
                    display_name: i.name.clone(),
                    image: i.image.clone(),
                    runtime_state: i.state.clone(),
                })
                .collect(),
        )
    }

    pub fn from_instances(instances: Vec<Instance>) -> Self {
        Self { instances }
    }
}

#[async_trait]
impl InventorySource for StaticInventory {
    async fn list(&self) -> Result<Vec<Instance>, InventoryError> {
        Ok(self.instances.clone())
    }
}
