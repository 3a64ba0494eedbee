use crate::model::Location;
use async_trait::async_trait;
use maxminddb::geoip2;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("некорректный IP-адрес: {0}")]
    InvalidAddress(String),
    #[error("база геолокации недоступна: {0}")]
    DatabaseUnavailable(String),
    #[error("адрес {address} не найден в базе: {reason}")]
    Lookup { address: String, reason: String },
}

#[async_trait]
pub trait GeoSource: Send + Sync {
    async fn lookup(&self, address: &str) -> Result<Location, GeoError>;
}

pub struct MaxMindGeoSource {
    reader: Option<maxminddb::Reader<Vec<u8>>>,
    load_error: Option<String>,
}

impl MaxMindGeoSource {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path_ref = path.as_ref();
        match maxminddb::Reader::open_readfile(path_ref) {
            Ok(reader) => Self {
                reader: Some(reader),
                load_error: None,
            },
            Err(err) => {
                warn!(
                    path = %path_ref.display(),
                    error = %err,
                    "база геолокации не загружена, все адреса будут unknown"
                );
                Self {
                    reader: None,
                    load_error: Some(err.to_string()),
                }
            }
        }
    }
}

#[async_trait]
impl GeoSource for MaxMindGeoSource {
    async fn lookup(&self, address: &str) -> Result<Location, GeoError> {
        let Some(reader) = &self.reader else {
            return Err(GeoError::DatabaseUnavailable(
                self.load_error.clone().unwrap_or_default(),
            ));
        };
        let ip: IpAddr = address
            .parse()
            .map_err(|_| GeoError::InvalidAddress(address.to_string()))?;
        let city: geoip2::City = reader.lookup(ip).map_err(|err| GeoError::Lookup {
            address: address.to_string(),
            reason: err.to_string(),
        })?;

        let country = city
            .country
            .and_then(|c| c.names)
            .and_then(|names| names.get("en").map(|n| n.to_string()));
        let city_name = city
            .city
            .and_then(|c| c.names)
            .and_then(|names| names.get("en").map(|n| n.to_string()));
        let (latitude, longitude) = city
            .location
            .map(|l| (l.latitude, l.longitude))
            .unwrap_or((None, None));

        let unknown = Location::unknown();
        Ok(Location {
            country: country.unwrap_or(unknown.country),
            city: city_name.unwrap_or(unknown.city),
            latitude,
            longitude,
        })
    }
}

pub struct GeoCache {
    source: Arc<dyn GeoSource>,
    entries: Mutex<HashMap<String, Arc<OnceCell<Location>>>>,
}

impl GeoCache {
    pub fn new(source: Arc<dyn GeoSource>) -> Self {
        Self {
            source,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn locate(&self, address: &str) -> Location {
        let cell = {
            let mut entries = match self.entries.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            entries
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        cell.get_or_init(|| async {
            match self.source.lookup(address).await {
                Ok(location) => location,
                Err(err) => {
                    debug!(address, error = %err, "геолокация не определена");
                    Location::unknown()
                }
            }
        })
        .await
        .clone()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    pub(crate) struct FixedGeo {
        pub calls: AtomicUsize,
        pub failing: Vec<String>,
    }

    impl FixedGeo {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failing: Vec::new(),
            }
        }

        pub(crate) fn location_for(address: &str) -> Location {
            Location {
                country: "Germany".to_string(),
                city: format!("city-{address}"),
                latitude: Some(52.5),
                longitude: Some(13.4),
            }
        }
    }

    #[async_trait]
    impl GeoSource for FixedGeo {
        async fn lookup(&self, address: &str) -> Result<Location, GeoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.failing.iter().any(|a| a == address) || address.parse::<IpAddr>().is_err() {
                return Err(GeoError::InvalidAddress(address.to_string()));
            }
            Ok(Self::location_for(address))
        }
    }

    #[tokio::test]
    async fn repeated_lookups_hit_source_once() {
        let source = Arc::new(FixedGeo::new());
        let cache = GeoCache::new(source.clone());

        let first = cache.locate("1.2.3.4").await;
        let second = cache.locate("1.2.3.4").await;

        assert_eq!(first, second);
        assert_eq!(first, FixedGeo::location_for("1.2.3.4"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_call() {
        let source = Arc::new(FixedGeo::new());
        let cache = Arc::new(GeoCache::new(source.clone()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.locate("5.6.7.8").await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), FixedGeo::location_for("5.6.7.8"));
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_becomes_unknown_and_is_remembered() {
        let mut source = FixedGeo::new();
        source.failing = vec!["9.9.9.9".to_string()];
        let source = Arc::new(source);
        let cache = GeoCache::new(source.clone());

        let location = cache.locate("9.9.9.9").await;
        assert!(location.is_unknown());
        assert_eq!(location.country, "unknown");
        let again = cache.locate("9.9.9.9").await;
        assert!(again.is_unknown());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_database_yields_unknown() {
        let source = Arc::new(MaxMindGeoSource::open("/nonexistent/GeoLite2-City.mmdb"));
        let cache = GeoCache::new(source);

        assert!(cache.locate("8.8.8.8").await.is_unknown());
        assert!(cache.locate("unknown").await.is_unknown());
        assert_eq!(cache.len(), 2);
    }
}
