pub mod docker;
pub mod haproxy;

use crate::model::{BackendStat, Instance};
use async_trait::async_trait;
use docker::InventoryError;

#[async_trait]
pub trait InventorySource: Send + Sync {
    async fn list(&self) -> Result<Vec<Instance>, InventoryError>;
}

/// Never fails: an unreachable or malformed feed yields an empty list.
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn fetch(&self) -> Vec<BackendStat>;
}
