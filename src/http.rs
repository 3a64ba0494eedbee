use crate::aggregator::Aggregator;
use crate::broadcast::{encode_snapshot, SubscriberRegistry};
use crate::cache::SnapshotCache;
use crate::collectors::docker::InventoryError;
use crate::metrics::Metrics;
use crate::model::Instance;
use crate::routing::{CircuitReport, RoutingError};
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub aggregator: Arc<Aggregator>,
    pub cache: Arc<SnapshotCache>,
    pub registry: Arc<SubscriberRegistry>,
}

pub fn build_router(state: HttpAppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/fleet", get(fleet_handler))
        .route("/fleet/:id/circuits", get(circuits_handler))
        .route("/fleet/:id/rebuild-circuits", post(rebuild_handler))
        .route("/fleet/:id/new-identity", post(new_identity_handler))
        .route("/circuits/:circuit_id/close", post(close_circuit_handler))
        .route("/circuits/rebuild-all", post(rebuild_all_handler))
        .route("/backend-stats", get(backend_stats_handler))
        .route("/dashboard", get(dashboard_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(cors_layer(cors_origins))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(origin = %origin, error = %err, "некорректный CORS origin пропущен");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn routing(err: RoutingError, not_found: StatusCode) -> Self {
        let status = match &err {
            e if e.is_not_found() => not_found,
            RoutingError::UpstreamMutation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            RoutingError::Unreachable { .. } | RoutingError::Auth { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }

    fn unknown_instance(id: &str, status: StatusCode) -> Self {
        Self::routing(RoutingError::InstanceNotFound(id.to_string()), status)
    }
}

impl From<InventoryError> for ApiError {
    fn from(err: InventoryError) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "message": self.message })),
        )
            .into_response()
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn fleet_handler(State(state): State<HttpAppState>) -> Result<Json<Vec<Instance>>, ApiError> {
    Ok(Json(state.aggregator.list_instances().await?))
}

#[derive(Debug, Serialize)]
struct InstanceCircuits {
    instance_id: String,
    #[serde(flatten)]
    report: CircuitReport,
}

async fn circuits_handler(
    State(state): State<HttpAppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceCircuits>, ApiError> {
    let instance = state
        .aggregator
        .find_instance(&id)
        .await?
        .ok_or_else(|| ApiError::unknown_instance(&id, StatusCode::NOT_FOUND))?;
    let report = state.aggregator.routing().fetch_circuits(&instance).await;
    Ok(Json(InstanceCircuits {
        instance_id: instance.id,
        report,
    }))
}

async fn backend_stats_handler(State(state): State<HttpAppState>) -> Response {
    let snapshot = state.cache.get().await;
    Json(snapshot.backend_stats.clone()).into_response()
}

async fn dashboard_handler(State(state): State<HttpAppState>) -> Response {
    let snapshot = state.cache.get().await;
    match encode_snapshot(&snapshot) {
        Ok(payload) => (
            [(CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            payload.to_string(),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка сериализации снимка: {err}"),
        )
            .into_response(),
    }
}

async fn rebuild_handler(
    State(state): State<HttpAppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let instance = state
        .aggregator
        .find_instance(&id)
        .await?
        .ok_or_else(|| ApiError::unknown_instance(&id, StatusCode::BAD_REQUEST))?;
    let result = state.aggregator.routing().rebuild_circuits(&instance).await;
    state.cache.invalidate();
    let outcome = result.map_err(|err| {
        warn!(instance = %id, error = %err, "перестроение цепочек не удалось");
        ApiError::routing(err, StatusCode::BAD_REQUEST)
    })?;
    Ok(Json(json!({
        "success": true,
        "message": format!("цепочки инстанса {} перестроены", instance.display_name),
        "closed": outcome.closed,
        "failed": outcome.failed,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct CloseQuery {
    instance: String,
}

async fn close_circuit_handler(
    State(state): State<HttpAppState>,
    Path(circuit_id): Path<String>,
    Query(query): Query<CloseQuery>,
) -> Result<Response, ApiError> {
    let instance = state
        .aggregator
        .find_instance(&query.instance)
        .await?
        .ok_or_else(|| ApiError::unknown_instance(&query.instance, StatusCode::BAD_REQUEST))?;
    state
        .aggregator
        .routing()
        .close_circuit(&instance, &circuit_id)
        .await
        .map_err(|err| {
            warn!(instance = %instance.id, circuit_id = %circuit_id, error = %err, "закрытие цепочки не удалось");
            ApiError::routing(err, StatusCode::BAD_REQUEST)
        })?;
    state.cache.invalidate();
    Ok(Json(json!({
        "success": true,
        "message": format!("цепочка {circuit_id} закрыта"),
    }))
    .into_response())
}

#[derive(Debug, Serialize)]
struct RebuildResult {
    instance_id: String,
    display_name: String,
    success: bool,
    message: String,
    closed: Vec<String>,
    failed: Vec<String>,
}

async fn rebuild_all_handler(State(state): State<HttpAppState>) -> Result<Response, ApiError> {
    let instances = state.aggregator.list_instances().await?;
    let routing = state.aggregator.routing();
    let results: Vec<RebuildResult> = join_all(instances.iter().map(|instance| async move {
        match routing.rebuild_circuits(instance).await {
            Ok(outcome) => RebuildResult {
                instance_id: instance.id.clone(),
                display_name: instance.display_name.clone(),
                success: true,
                message: format!("закрыто цепочек: {}", outcome.closed.len()),
                closed: outcome.closed,
                failed: outcome.failed,
            },
            Err(err) => {
                warn!(instance = %instance.id, error = %err, "перестроение цепочек не удалось");
                RebuildResult {
                    instance_id: instance.id.clone(),
                    display_name: instance.display_name.clone(),
                    success: false,
                    message: err.to_string(),
                    closed: Vec::new(),
                    failed: Vec::new(),
                }
            }
        }
    }))
    .await;
    state.cache.invalidate();

    let succeeded = results.iter().filter(|r| r.success).count();
    Ok(Json(json!({
        "success": succeeded == results.len(),
        "message": format!("перестроено {succeeded}/{} инстансов", results.len()),
        "results": results,
    }))
    .into_response())
}

async fn new_identity_handler(
    State(state): State<HttpAppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let instance = state
        .aggregator
        .find_instance(&id)
        .await?
        .ok_or_else(|| ApiError::unknown_instance(&id, StatusCode::NOT_FOUND))?;
    state
        .aggregator
        .routing()
        .rotate_identity(&instance)
        .await
        .map_err(|err| {
            warn!(instance = %id, error = %err, "смена личности не удалась");
            ApiError::routing(err, StatusCode::NOT_FOUND)
        })?;
    state.cache.invalidate();
    Ok(Json(json!({
        "success": true,
        "message": format!("запрошена новая личность для {}", instance.display_name),
    }))
    .into_response())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HttpAppState>) -> Response {
    ws.on_upgrade(move |socket| stream_snapshots(socket, state))
}

async fn stream_snapshots(socket: WebSocket, state: HttpAppState) {
    let mut subscription = state.registry.register();
    let (mut sender, mut receiver) = socket.split();

    let initial = state.cache.get().await;
    match encode_snapshot(&initial) {
        Ok(payload) => {
            if sender.send(Message::Text(payload.to_string())).await.is_err() {
                return;
            }
        }
        Err(err) => warn!(error = %err, "не удалось сериализовать начальный снимок"),
    }
    subscription.start_streaming();

    loop {
        tokio::select! {
            payload = subscription.recv() => {
                let Some(payload) = payload else {
                    debug!(subscriber = subscription.id(), "подписчик исключён из рассылки");
                    break;
                };
                if sender.send(Message::Text(payload.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::BackendMatcher;
    use crate::cache::TokioClock;
    use crate::collectors::docker::StaticInventory;
    use crate::collectors::StatsSource;
    use crate::geo::tests::FixedGeo;
    use crate::geo::GeoCache;
    use crate::model::BackendStat;
    use crate::routing::testing::{raw, FakeConnector, FakeNode};
    use crate::routing::{RetryPolicy, RoutingClient};
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tower::ServiceExt;

    struct NoStats;

    #[async_trait]
    impl StatsSource for NoStats {
        async fn fetch(&self) -> Vec<BackendStat> {
            Vec::new()
        }
    }

    fn instance(id: &str, address: &str) -> Instance {
        Instance {
            id: id.to_string(),
            address: address.to_string(),
            display_name: format!("multisocks-tor-{id}"),
            image: "multisocks-private-tor".to_string(),
            runtime_state: "running".to_string(),
        }
    }

    fn app_with(connector: Arc<FakeConnector>, instances: Vec<Instance>) -> (Router, HttpAppState) {
        let metrics = Metrics::new().expect("инициализация метрик");
        let routing = RoutingClient::new(
            connector,
            Arc::new(GeoCache::new(Arc::new(FixedGeo::new()))),
            RetryPolicy {
                attempts: 1,
                base: Duration::from_millis(1),
            },
            Duration::from_secs(1),
        );
        let aggregator = Arc::new(
            Aggregator::new(
                Arc::new(StaticInventory::from_instances(instances)),
                Arc::new(routing),
                Arc::new(NoStats),
                BackendMatcher::new("tor{ordinal}", BTreeMap::new()),
                4,
                Duration::from_secs(5),
            )
            .with_metrics(metrics.clone()),
        );
        let cache = Arc::new(SnapshotCache::new(
            aggregator.clone(),
            Arc::new(TokioClock),
            Duration::from_secs(60),
        ));
        let state = HttpAppState {
            metrics,
            aggregator,
            cache,
            registry: Arc::new(SubscriberRegistry::new(4)),
        };
        let app = build_router(state.clone(), &["http://localhost:3000".to_string()]);
        (app, state)
    }

    fn default_app() -> (Router, HttpAppState, Arc<FakeConnector>) {
        let node = FakeNode {
            circuits: vec![raw("7", "BUILT", &["E", "M", "X"])],
            descriptors: [("X", "185.220.1.1")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..FakeNode::default()
        };
        let connector = Arc::new(FakeConnector::default().with_node("10.1.0.1", node));
        let (app, state) = app_with(connector.clone(), vec![instance("1", "10.1.0.1")]);
        (app, state, connector)
    }

    async fn call(app: Router, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (app, _, _) = default_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn metrics_reflect_dashboard_build() {
        let (app, _, _) = default_app();
        let (status, _) = call(app.clone(), Method::GET, "/dashboard").await;
        assert_eq!(status, StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("circuitd_circuits_total 1"));
        assert!(text.contains("circuitd_snapshot_builds_total 1"));
    }

    #[tokio::test]
    async fn dashboard_is_served_from_cache() {
        let (app, state, _) = default_app();
        let (status, body) = call(app.clone(), Method::GET, "/dashboard").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["total_circuits"], 1);
        assert_eq!(body["instances"][0]["external_ip"], "185.220.1.1");

        call(app.clone(), Method::GET, "/dashboard").await;
        call(app, Method::GET, "/backend-stats").await;
        assert_eq!(state.metrics.circuitd_snapshot_builds_total.get(), 1.0);
    }

    #[tokio::test]
    async fn fleet_and_circuits() {
        let (app, _, _) = default_app();
        let (status, body) = call(app.clone(), Method::GET, "/fleet").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "1");
        assert!(body[0].get("circuits").is_none());

        let (status, body) = call(app.clone(), Method::GET, "/fleet/1/circuits").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["circuits"][0]["circuit_id"], "7");
        assert_eq!(body["error"], serde_json::Value::Null);

        let (status, body) = call(app, Method::GET, "/fleet/nope/circuits").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn unknown_targets_map_to_client_errors() {
        let (app, _, connector) = default_app();

        let (status, body) = call(app.clone(), Method::POST, "/fleet/nope/rebuild-circuits").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = call(app.clone(), Method::POST, "/circuits/999/close?instance=1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(app, Method::POST, "/fleet/nope/new-identity").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(connector.commands().is_empty());
    }

    #[tokio::test]
    async fn mutations_invalidate_snapshot() {
        let (app, state, connector) = default_app();
        call(app.clone(), Method::GET, "/dashboard").await;

        let (status, body) = call(app.clone(), Method::POST, "/fleet/1/new-identity").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(connector.commands(), vec!["10.1.0.1 SIGNAL NEWNYM"]);

        call(app, Method::GET, "/dashboard").await;
        assert_eq!(state.metrics.circuitd_snapshot_builds_total.get(), 2.0);
    }

    #[tokio::test]
    async fn close_and_rebuild_succeed() {
        let (app, _, connector) = default_app();

        let (status, _) = call(app.clone(), Method::POST, "/circuits/7/close?instance=1").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(app, Method::POST, "/fleet/1/rebuild-circuits").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["closed"][0], "7");
        assert_eq!(
            connector.commands(),
            vec![
                "10.1.0.1 CLOSECIRCUIT 7",
                "10.1.0.1 CLOSECIRCUIT 7",
                "10.1.0.1 SIGNAL NEWNYM",
            ]
        );
    }

    #[tokio::test]
    async fn rebuild_all_reports_per_instance() {
        let down = FakeNode {
            unreachable: true,
            ..FakeNode::default()
        };
        let connector = Arc::new(
            FakeConnector::default()
                .with_node("10.1.0.1", FakeNode::default())
                .with_node("10.1.0.2", down),
        );
        let (app, _) = app_with(
            connector,
            vec![instance("1", "10.1.0.1"), instance("2", "10.1.0.2")],
        );

        let (status, body) = call(app, Method::POST, "/circuits/rebuild-all").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["results"][0]["instance_id"], "1");
        assert_eq!(body["results"][0]["success"], true);
        assert_eq!(body["results"][1]["success"], false);
    }

    #[tokio::test]
    async fn unreachable_instance_is_bad_gateway() {
        let down = FakeNode {
            unreachable: true,
            ..FakeNode::default()
        };
        let connector = Arc::new(FakeConnector::default().with_node("10.1.0.2", down));
        let (app, _) = app_with(connector, vec![instance("2", "10.1.0.2")]);

        let (status, body) = call(app, Method::POST, "/fleet/2/new-identity").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["success"], false);
    }
}
