use crate::control::{ControlConnector, ControlError, ControlSession, RawCircuit};
use crate::geo::GeoCache;
use crate::model::{Circuit, Hop, Instance, Location, UNKNOWN};
use futures::future::join_all;
use serde::Serialize;
use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("инстанс {0} не найден")]
    InstanceNotFound(String),
    #[error("цепочка {circuit_id} не найдена на инстансе {instance}")]
    CircuitNotFound { instance: String, circuit_id: String },
    #[error("инстанс {instance} недоступен: {reason}")]
    Unreachable { instance: String, reason: String },
    #[error("ошибка аутентификации на инстансе {instance}: {reason}")]
    Auth { instance: String, reason: String },
    #[error("инстанс {instance} отклонил команду: {reason}")]
    UpstreamMutation { instance: String, reason: String },
}

impl RoutingError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::InstanceNotFound(_) | Self::CircuitNotFound { .. }
        )
    }

    fn from_control(instance: &Instance, err: ControlError) -> Self {
        let instance = instance.id.clone();
        match err {
            ControlError::Auth(reason) => Self::Auth { instance, reason },
            ControlError::Rejected { .. } => Self::UpstreamMutation {
                instance,
                reason: err.to_string(),
            },
            other => Self::Unreachable {
                instance,
                reason: other.to_string(),
            },
        }
    }
}

/// Exponential backoff: waits `base`, `2 * base`, ... between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.attempts {
            return None;
        }
        let factor = 1_u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor))
    }

    #[cfg(test)]
    pub fn delays(&self) -> Vec<Duration> {
        (1..self.attempts).filter_map(|a| self.delay_after(a)).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CircuitReport {
    pub circuits: Vec<Circuit>,
    pub external_ip: Option<String>,
    pub error: Option<String>,
}

impl CircuitReport {
    fn ok(circuits: Vec<Circuit>) -> Self {
        let external_ip = circuits
            .iter()
            .find_map(|c| c.exit_address())
            .map(str::to_string);
        Self {
            circuits,
            external_ip,
            error: None,
        }
    }

    pub fn failed(message: String) -> Self {
        Self {
            error: Some(message),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildOutcome {
    pub closed: Vec<String>,
    pub failed: Vec<String>,
}

const DEFAULT_DEADLINE: Duration = Duration::from_secs(20);

pub struct RoutingClient {
    connector: Arc<dyn ControlConnector>,
    geo: Arc<GeoCache>,
    retry: RetryPolicy,
    step_timeout: Duration,
    deadline: Duration,
}

impl RoutingClient {
    pub fn new(
        connector: Arc<dyn ControlConnector>,
        geo: Arc<GeoCache>,
        retry: RetryPolicy,
        step_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            geo,
            retry,
            step_timeout,
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Built circuits of one instance. Never fails: after the last attempt the
    /// report carries the error and no circuits.
    pub async fn fetch_circuits(&self, instance: &Instance) -> CircuitReport {
        match time::timeout(self.deadline, self.fetch_with_retries(instance)).await {
            Ok(report) => report,
            Err(_elapsed) => {
                warn!(instance = %instance.id, deadline_ms = self.deadline.as_millis() as u64, "опрос инстанса превысил общий срок");
                CircuitReport::failed(ControlError::Timeout(self.deadline).to_string())
            }
        }
    }

    async fn fetch_with_retries(&self, instance: &Instance) -> CircuitReport {
        let mut attempt = 1;
        loop {
            match self.read_once(instance).await {
                Ok(circuits) => return CircuitReport::ok(circuits),
                Err(err) => match self.retry.delay_after(attempt) {
                    Some(delay) => {
                        debug!(
                            instance = %instance.id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "опрос инстанса не удался, повтор"
                        );
                        time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        warn!(instance = %instance.id, attempts = attempt, error = %err, "инстанс недоступен");
                        return CircuitReport::failed(err.to_string());
                    }
                },
            }
        }
    }

    pub async fn close_circuit(
        &self,
        instance: &Instance,
        circuit_id: &str,
    ) -> Result<(), RoutingError> {
        let result = self
            .within_deadline(instance, async {
                let mut session = self.open(instance).await?;
                let result = self.close_in_session(session.as_mut(), circuit_id).await;
                self.release(session).await;
                Ok::<_, RoutingError>(result)
            })
            .await?;

        match result {
            Ok(true) => {
                info!(instance = %instance.id, circuit_id, "цепочка закрыта");
                Ok(())
            }
            Ok(false) => Err(RoutingError::CircuitNotFound {
                instance: instance.id.clone(),
                circuit_id: circuit_id.to_string(),
            }),
            Err(err) => Err(RoutingError::from_control(instance, err)),
        }
    }

    pub async fn rebuild_circuits(&self, instance: &Instance) -> Result<RebuildOutcome, RoutingError> {
        let result = self
            .within_deadline(instance, async {
                let mut session = self.open(instance).await?;
                let result = self.rebuild_in_session(session.as_mut(), instance).await;
                self.release(session).await;
                Ok::<_, RoutingError>(result)
            })
            .await?;

        let outcome = result.map_err(|err| RoutingError::from_control(instance, err))?;
        info!(
            instance = %instance.id,
            closed = outcome.closed.len(),
            failed = outcome.failed.len(),
            "цепочки перестроены"
        );
        Ok(outcome)
    }

    pub async fn rotate_identity(&self, instance: &Instance) -> Result<(), RoutingError> {
        let result = self
            .within_deadline(instance, async {
                let mut session = self.open(instance).await?;
                let result = self.bounded(session.signal_new_identity()).await;
                self.release(session).await;
                Ok::<_, RoutingError>(result)
            })
            .await?;
        result.map_err(|err| RoutingError::from_control(instance, err))?;
        info!(instance = %instance.id, "запрошена новая личность");
        Ok(())
    }

    async fn open(&self, instance: &Instance) -> Result<Box<dyn ControlSession>, RoutingError> {
        let mut session = self
            .bounded(self.connector.connect(&instance.address))
            .await
            .map_err(|err| RoutingError::from_control(instance, err))?;
        if let Err(err) = self.bounded(session.authenticate()).await {
            self.release(session).await;
            return Err(RoutingError::from_control(instance, err));
        }
        Ok(session)
    }

    async fn close_in_session(
        &self,
        session: &mut dyn ControlSession,
        circuit_id: &str,
    ) -> Result<bool, ControlError> {
        let circuits = self.bounded(session.list_circuits()).await?;
        if !circuits.iter().any(|c| c.id == circuit_id) {
            return Ok(false);
        }
        self.bounded(session.close_circuit(circuit_id)).await?;
        Ok(true)
    }

    async fn rebuild_in_session(
        &self,
        session: &mut dyn ControlSession,
        instance: &Instance,
    ) -> Result<RebuildOutcome, ControlError> {
        let circuits = self.bounded(session.list_circuits()).await?;
        let mut outcome = RebuildOutcome::default();
        for circuit in circuits.iter().filter(|c| c.is_built()) {
            match self.bounded(session.close_circuit(&circuit.id)).await {
                Ok(()) => outcome.closed.push(circuit.id.clone()),
                // A rejected close leaves the session usable; transport errors do not.
                Err(err @ ControlError::Rejected { .. }) => {
                    warn!(
                        instance = %instance.id,
                        circuit_id = %circuit.id,
                        error = %err,
                        "не удалось закрыть цепочку, пропуск"
                    );
                    outcome.failed.push(circuit.id.clone());
                }
                Err(err) => return Err(err),
            }
        }
        self.bounded(session.signal_new_identity()).await?;
        Ok(outcome)
    }

    async fn read_once(&self, instance: &Instance) -> Result<Vec<Circuit>, RoutingError> {
        let mut session = self.open(instance).await?;
        let result = self.read_circuits(session.as_mut()).await;
        self.release(session).await;
        result.map_err(|err| match err {
            ControlError::Rejected { .. } => RoutingError::Unreachable {
                instance: instance.id.clone(),
                reason: err.to_string(),
            },
            other => RoutingError::from_control(instance, other),
        })
    }

    async fn read_circuits(
        &self,
        session: &mut dyn ControlSession,
    ) -> Result<Vec<Circuit>, ControlError> {
        let mut built: Vec<RawCircuit> = self
            .bounded(session.list_circuits())
            .await?
            .into_iter()
            .filter(RawCircuit::is_built)
            .collect();
        built.sort_by(|a, b| circuit_order(&a.id, &b.id));

        let mut circuits = Vec::with_capacity(built.len());
        for raw in built {
            let mut hops = Vec::with_capacity(raw.path.len());
            for (fingerprint, nickname) in raw.path {
                let address = self
                    .bounded(session.resolve_descriptor(&fingerprint))
                    .await?
                    .unwrap_or_else(|| UNKNOWN.to_string());
                hops.push((fingerprint, nickname, address));
            }

            let locations = join_all(hops.iter().map(|(_, _, address)| self.locate(address))).await;
            let path = hops
                .into_iter()
                .zip(locations)
                .map(|((fingerprint, nickname, address), location)| Hop {
                    fingerprint,
                    nickname,
                    address,
                    location,
                })
                .collect();

            circuits.push(Circuit {
                circuit_id: raw.id,
                purpose: raw.purpose,
                path,
            });
        }
        Ok(circuits)
    }

    async fn locate(&self, address: &str) -> Location {
        if address == UNKNOWN {
            return Location::unknown();
        }
        self.geo.locate(address).await
    }

    async fn release(&self, session: Box<dyn ControlSession>) {
        if time::timeout(self.step_timeout, session.quit()).await.is_err() {
            debug!(timeout_ms = self.step_timeout.as_millis() as u64, "сессия закрыта без ответа на QUIT");
        }
    }

    async fn within_deadline<T>(
        &self,
        instance: &Instance,
        fut: impl Future<Output = Result<T, RoutingError>>,
    ) -> Result<T, RoutingError> {
        match time::timeout(self.deadline, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(RoutingError::Unreachable {
                instance: instance.id.clone(),
                reason: ControlError::Timeout(self.deadline).to_string(),
            }),
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, ControlError>>,
    ) -> Result<T, ControlError> {
        match time::timeout(self.step_timeout, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ControlError::Timeout(self.step_timeout)),
        }
    }
}

fn circuit_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}
