use crate::cache::SnapshotCache;
use crate::metrics::Metrics;
use crate::model::DashboardSnapshot;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

pub type Payload = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connected,
    Streaming,
}

struct Subscriber {
    state: SubscriberState,
    tx: mpsc::Sender<Payload>,
}

pub struct SubscriberRegistry {
    next_id: AtomicU64,
    capacity: usize,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    metrics: Option<Arc<Metrics>>,
}

impl SubscriberRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            subscribers: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn register(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        let count = {
            let mut subscribers = self.lock();
            subscribers.insert(
                id,
                Subscriber {
                    state: SubscriberState::Connected,
                    tx,
                },
            );
            subscribers.len()
        };
        self.report(count);
        debug!(subscriber = id, total = count, "подписчик подключён");
        Subscription {
            id,
            rx,
            registry: self.clone(),
        }
    }

    pub fn mark_streaming(&self, id: u64) {
        if let Some(subscriber) = self.lock().get_mut(&id) {
            subscriber.state = SubscriberState::Streaming;
        }
    }

    #[cfg(test)]
    pub fn state(&self, id: u64) -> Option<SubscriberState> {
        self.lock().get(&id).map(|s| s.state)
    }

    pub fn remove(&self, id: u64) -> bool {
        let (removed, count) = {
            let mut subscribers = self.lock();
            let removed = subscribers.remove(&id).is_some();
            (removed, subscribers.len())
        };
        if removed {
            self.report(count);
            debug!(subscriber = id, total = count, "подписчик отключён");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn publish(&self, payload: Payload) -> usize {
        let (delivered, dropped, count) = {
            let mut subscribers = self.lock();
            let mut delivered = 0;
            let mut dropped = Vec::new();
            for (id, subscriber) in subscribers.iter() {
                if subscriber.state != SubscriberState::Streaming {
                    continue;
                }
                match subscriber.tx.try_send(payload.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => dropped.push(*id),
                }
            }
            for id in &dropped {
                subscribers.remove(id);
            }
            (delivered, dropped, subscribers.len())
        };
        if !dropped.is_empty() {
            self.report(count);
            debug!(dropped = ?dropped, total = count, "отстающие подписчики отключены");
        }
        delivered
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn report(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_subscribers(count);
        }
    }
}

pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Payload>,
    registry: Arc<SubscriberRegistry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn start_streaming(&self) {
        self.registry.mark_streaming(self.id);
    }

    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

pub fn encode_snapshot(snapshot: &DashboardSnapshot) -> Result<Payload, serde_json::Error> {
    serde_json::to_string(snapshot).map(Payload::from)
}

pub async fn run(
    cache: Arc<SnapshotCache>,
    registry: Arc<SubscriberRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("получен сигнал остановки рассылки");
                break;
            }
            _ = ticker.tick() => {
                if registry.is_empty() {
                    continue;
                }
                let snapshot = tokio::select! {
                    _ = shutdown.changed() => {
                        info!("получен сигнал остановки рассылки");
                        break;
                    }
                    snapshot = cache.get() => snapshot,
                };
                match encode_snapshot(&snapshot) {
                    Ok(payload) => {
                        let delivered = registry.publish(payload);
                        debug!(delivered, "снимок разослан");
                    }
                    Err(err) => error!(error = %err, "не удалось сериализовать снимок"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::CountingSource;
    use crate::cache::TokioClock;

    #[tokio::test]
    async fn failed_subscriber_does_not_block_others() {
        let registry = Arc::new(SubscriberRegistry::new(1));
        let mut subs: Vec<Subscription> = (0..4).map(|_| registry.register()).collect();
        for sub in &subs {
            sub.start_streaming();
        }

        // Fill the second subscriber's buffer so the next send fails.
        assert_eq!(registry.publish(Payload::from("warmup")), 4);
        for (idx, sub) in subs.iter_mut().enumerate() {
            if idx != 1 {
                assert_eq!(sub.recv().await.as_deref(), Some("warmup"));
            }
        }

        let slow_id = subs[1].id();
        assert_eq!(registry.publish(Payload::from("tick")), 3);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.state(slow_id), None);
        for (idx, sub) in subs.iter_mut().enumerate() {
            if idx != 1 {
                assert_eq!(sub.recv().await.as_deref(), Some("tick"));
            }
        }
    }

    #[tokio::test]
    async fn dropped_subscription_leaves_registry() {
        let registry = Arc::new(SubscriberRegistry::new(4));
        let first = registry.register();
        let second = registry.register();
        assert_eq!(registry.state(first.id()), Some(SubscriberState::Connected));
        second.start_streaming();

        drop(first);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.publish(Payload::from("x")), 1);
    }

    #[tokio::test]
    async fn connected_subscribers_are_skipped() {
        let registry = Arc::new(SubscriberRegistry::new(4));
        let _pending = registry.register();
        assert_eq!(registry.publish(Payload::from("x")), 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_pushes_on_interval_and_stops_on_shutdown() {
        let source = Arc::new(CountingSource::default());
        let cache = Arc::new(SnapshotCache::new(
            source.clone(),
            Arc::new(TokioClock),
            Duration::from_secs(4),
        ));
        let registry = Arc::new(SubscriberRegistry::new(4));
        let mut sub = registry.register();
        sub.start_streaming();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(
            cache,
            registry.clone(),
            Duration::from_secs(5),
            shutdown_rx,
        ));

        let first = sub.recv().await.unwrap();
        assert!(first.contains("\"taken_at_unix\":1"));
        let second = sub.recv().await.unwrap();
        assert!(second.contains("\"taken_at_unix\":2"));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
