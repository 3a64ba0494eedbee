use crate::model::DashboardSnapshot;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn build(&self) -> DashboardSnapshot;
}

struct Entry {
    built_at: Instant,
    generation: u64,
    snapshot: Arc<DashboardSnapshot>,
}

/// Holds the last snapshot for `ttl`. Concurrent readers that find it stale
/// wait on a single rebuild instead of starting their own.
pub struct SnapshotCache {
    source: Arc<dyn SnapshotSource>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    entry: RwLock<Option<Entry>>,
    refresh: Mutex<()>,
    generation: AtomicU64,
}

impl SnapshotCache {
    pub fn new(source: Arc<dyn SnapshotSource>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            source,
            clock,
            ttl,
            entry: RwLock::new(None),
            refresh: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub async fn get(&self) -> Arc<DashboardSnapshot> {
        if let Some(snapshot) = self.fresh().await {
            return snapshot;
        }

        let _guard = self.refresh.lock().await;
        // Someone else may have rebuilt while we waited for the lock.
        if let Some(snapshot) = self.fresh().await {
            return snapshot;
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let snapshot = Arc::new(self.source.build().await);
        *self.entry.write().await = Some(Entry {
            built_at: self.clock.now(),
            generation,
            snapshot: snapshot.clone(),
        });
        debug!(ttl_ms = self.ttl.as_millis() as u64, "кэш снимка обновлён");
        snapshot
    }

    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    async fn fresh(&self) -> Option<Arc<DashboardSnapshot>> {
        let entry = self.entry.read().await;
        let entry = entry.as_ref()?;
        let current = self.generation.load(Ordering::SeqCst);
        let age = self.clock.now().saturating_duration_since(entry.built_at);
        (entry.generation == current && age < self.ttl).then(|| entry.snapshot.clone())
    }
}
