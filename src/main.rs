mod aggregator;
mod broadcast;
mod cache;
mod collectors;
mod config;
mod control;
mod geo;
mod http;
mod metrics;
mod model;
mod routing;

use aggregator::{Aggregator, BackendMatcher};
use axum::serve;
use broadcast::SubscriberRegistry;
use cache::{SnapshotCache, TokioClock};
use clap::Parser;
use collectors::docker::{DockerInventory, StaticInventory};
use collectors::haproxy::HaproxyStats;
use collectors::InventorySource;
use config::{Config, InventoryConfig};
use control::TcpControlConnector;
use geo::{GeoCache, MaxMindGeoSource};
use metrics::Metrics;
use reqwest::Client;
use routing::{RetryPolicy, RoutingClient};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SUBSCRIBER_BUFFER: usize = 4;

#[derive(Parser, Debug)]
#[command(name = "circuitd")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
        if let Err(err) = cfg.validate() {
            error!(error = %err, "некорректный адрес --listen");
            std::process::exit(1);
        }
    }

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let client = Client::builder()
        .user_agent(concat!("circuitd/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|err| {
            warn!(error = %err, "не удалось настроить HTTP-клиент, используются параметры по умолчанию");
            Client::new()
        });

    let inventory: Arc<dyn InventorySource> = match &cfg.inventory {
        InventoryConfig::Docker(docker) => {
            info!(url = %docker.url, image = %docker.image, "инстансы берутся из Docker");
            Arc::new(DockerInventory::new(client.clone(), docker.clone()))
        }
        InventoryConfig::Static(fixed) => {
            info!(instances = fixed.instances.len(), "используется статический список инстансов");
            Arc::new(StaticInventory::new(fixed))
        }
    };

    let geo = Arc::new(GeoCache::new(Arc::new(MaxMindGeoSource::open(
        &cfg.geo.database,
    ))));
    let password = cfg.control.resolve_password();
    if password.is_none() {
        warn!(env = %cfg.control.password_env, "пароль control-порта не задан, аутентификация без пароля");
    }
    let connector = Arc::new(TcpControlConnector::new(
        cfg.control.port,
        password,
        cfg.control.timeout(),
    ));
    let routing = Arc::new(RoutingClient::new(
        connector,
        geo,
        RetryPolicy {
            attempts: cfg.control.retry_attempts,
            base: Duration::from_millis(cfg.control.retry_base_ms),
        },
        cfg.control.timeout(),
    )
    .with_deadline(cfg.instance_deadline()));
    let stats = Arc::new(HaproxyStats::new(client, &cfg.stats).with_metrics(metrics.clone()));

    let aggregator = Arc::new(
        Aggregator::new(
            inventory,
            routing,
            stats,
            BackendMatcher::new(
                cfg.stats.backend_name_template.clone(),
                cfg.stats.backend_names.clone(),
            ),
            cfg.max_concurrency,
            cfg.instance_deadline(),
        )
        .with_metrics(metrics.clone()),
    );
    let cache = Arc::new(SnapshotCache::new(
        aggregator.clone(),
        Arc::new(TokioClock),
        cfg.snapshot_ttl(),
    ));
    let registry = Arc::new(SubscriberRegistry::new(SUBSCRIBER_BUFFER).with_metrics(metrics.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let state = http::HttpAppState {
            metrics: metrics.clone(),
            aggregator,
            cache: cache.clone(),
            registry: registry.clone(),
        };
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(state, &cfg.cors_origins);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };
            info!(listen = %addr, "HTTP-сервер запущен");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    let broadcast_task = tokio::spawn(broadcast::run(
        cache,
        registry,
        cfg.broadcast_interval(),
        shutdown_rx,
    ));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    let _ = broadcast_task.await;
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
