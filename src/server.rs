use crate::{
    analytics::UsageService,
    broadcast::BroadcastManager,
    config::AppConfig,
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{NaiveDate, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::mpsc, sync::oneshot, task::JoinHandle};

const DEFAULT_DAYS: u32 = 30;
const MAX_DAYS: u32 = 365;
const OUTBOUND_BUFFER: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let body = Json(json!({ "error": kind, "message": self.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Clone)]
struct ServerState {
    config: Arc<AppConfig>,
    usage: Arc<UsageService>,
    broadcast: Arc<BroadcastManager>,
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!(err)),
        }
    }
}

pub async fn spawn(
    config: Arc<AppConfig>,
    usage: Arc<UsageService>,
    broadcast: Arc<BroadcastManager>,
) -> Result<ServerHandle> {
    let addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| format!("failed to parse listen_addr {}", config.server.listen_addr))?;

    let router = router(ServerState {
        config,
        usage,
        broadcast,
    });

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind listener on {addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to read bound listener address")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .map_err(|err| anyhow!(err))
    });

    tracing::info!(listen = %local_addr, "http server started");

    Ok(ServerHandle {
        local_addr,
        shutdown: Some(shutdown_tx),
        join,
    })
}

fn router(state: ServerState) -> Router {
    let prefix = normalize_api_prefix(&state.config.server.api_prefix);
    let mut router = Router::new()
        .route("/", get(root))
        .route("/health", get(health));
    if !prefix.is_empty() {
        router = router.route(&format!("{prefix}/health"), get(health));
    }
    router
        .route(&format!("{prefix}/usage/realtime"), get(realtime))
        .route(&format!("{prefix}/usage/daily"), get(daily))
        .route(&format!("{prefix}/usage/history"), get(history))
        .route(&format!("{prefix}/usage/plan-usage"), get(plan_usage))
        .route(&format!("{prefix}/stats/models"), get(model_stats))
        .route("/ws/realtime", get(ws_realtime))
        .with_state(state)
}

/// `"api/"` -> `"/api"`; empty or `"/"` mounts at the root.
fn normalize_api_prefix(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Runs a synchronous engine call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|err| {
        tracing::error!(error = %err, "analytics task failed");
        ApiError::Internal("failed to compute usage".to_string())
    })
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    data_path_valid: bool,
    timestamp: chrono::DateTime<Utc>,
    details: HealthDetails,
}

#[derive(Serialize)]
struct HealthDetails {
    data_path: String,
    session_window_hours: u32,
    websocket_interval: u64,
    websocket_subscribers: usize,
    broadcast_running: bool,
}

async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    let data_path_valid = state.config.data.is_data_path_valid();
    Json(HealthResponse {
        status: if data_path_valid { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        data_path_valid,
        timestamp: Utc::now(),
        details: HealthDetails {
            data_path: state.config.data.resolved_data_path().display().to_string(),
            session_window_hours: state.usage.window_hours(),
            websocket_interval: state.broadcast.interval().as_secs(),
            websocket_subscribers: state.broadcast.subscriber_count(),
            broadcast_running: state.broadcast.is_running(),
        },
    })
}

async fn realtime(State(state): State<ServerState>) -> Result<impl IntoResponse, ApiError> {
    let usage = state.usage.clone();
    Ok(Json(blocking(move || usage.realtime_usage()).await?))
}

#[derive(Debug, Deserialize)]
struct DailyQuery {
    date: Option<String>,
}

async fn daily(
    State(state): State<ServerState>,
    Query(query): Query<DailyQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let date = query
        .date
        .as_deref()
        .map(|raw| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
                ApiError::BadRequest(format!("invalid date '{raw}', expected YYYY-MM-DD"))
            })
        })
        .transpose()?;

    let usage = state.usage.clone();
    let stats = blocking(move || match date {
        Some(date) => usage.daily_stats(date),
        None => usage.today_stats(),
    })
    .await?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
struct DaysQuery {
    days: Option<String>,
}

impl DaysQuery {
    fn days(&self) -> Result<u32, ApiError> {
        let Some(raw) = self.days.as_deref() else {
            return Ok(DEFAULT_DAYS);
        };
        match raw.trim().parse::<u32>() {
            Ok(days) if (1..=MAX_DAYS).contains(&days) => Ok(days),
            _ => Err(ApiError::BadRequest(format!(
                "days must be between 1 and {MAX_DAYS}, got '{raw}'"
            ))),
        }
    }
}

async fn history(
    State(state): State<ServerState>,
    Query(query): Query<DaysQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let days = query.days()?;
    let usage = state.usage.clone();
    Ok(Json(blocking(move || usage.history(days)).await?))
}

async fn model_stats(
    State(state): State<ServerState>,
    Query(query): Query<DaysQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let days = query.days()?;
    let usage = state.usage.clone();
    Ok(Json(blocking(move || usage.model_stats(days)).await?))
}

#[derive(Debug, Deserialize)]
struct PlanQuery {
    plan: Option<String>,
}

async fn plan_usage(
    State(state): State<ServerState>,
    Query(query): Query<PlanQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let usage = state.usage.clone();
    let plan = query
        .plan
        .unwrap_or_else(|| usage.plans().default_plan_name().to_string());
    Ok(Json(blocking(move || usage.plan_usage(&plan)).await?))
}

async fn ws_realtime(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.broadcast))
}

async fn handle_socket(socket: WebSocket, broadcast: Arc<BroadcastManager>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<str>>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_tx.send(Message::Text(payload.to_string())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let id = broadcast.connect(tx).await;
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => broadcast.handle_inbound(id, &text).await,
            Ok(Message::Close(_)) => break,
            Err(err) => {
                tracing::debug!(subscriber = %id, error = %err, "websocket read failed");
                break;
            }
            Ok(_) => {}
        }
    }

    broadcast.disconnect(id);
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analytics::{EngineSettings, UsageCache},
        blocks::{BlockAnalysis, BlockAnalyzer},
        ingest::RecordSource,
        plans::PlanCatalog,
        usage::{UsageRecord, tests::sample_record},
    };
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    struct StaticSource(Vec<UsageRecord>);

    impl RecordSource for StaticSource {
        fn load_records(&self, _hours_back: Option<u32>) -> anyhow::Result<Vec<UsageRecord>> {
            Ok(self.0.clone())
        }
    }

    struct NoBlocks;

    impl BlockAnalyzer for NoBlocks {
        fn analyze(&self, _hours_back: u32, _plan: &str) -> anyhow::Result<BlockAnalysis> {
            Ok(BlockAnalysis::default())
        }
    }

    fn test_router() -> Router {
        let mut config = AppConfig::default();
        config.data.data_path = std::path::PathBuf::from("/definitely/not/here");
        let records = vec![
            sample_record(Utc::now(), "claude-sonnet-4", (100, 200, 0, 0), 0.2),
            sample_record(Utc::now() - chrono::Duration::minutes(5), "claude-opus-4", (300, 100, 0, 0), 1.0),
        ];
        let usage = Arc::new(UsageService::new(
            Arc::new(StaticSource(records)),
            Arc::new(NoBlocks),
            PlanCatalog::default(),
            Arc::new(UsageCache::new(Duration::from_secs(30))),
            EngineSettings::default(),
        ));
        let broadcast = Arc::new(BroadcastManager::new(
            usage.clone(),
            Duration::from_secs(10),
            Duration::from_secs(1),
        ));
        router(ServerState {
            config: Arc::new(config),
            usage,
            broadcast,
        })
    }

    async fn get_json(uri: &str) -> (StatusCode, Value) {
        let response = test_router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_reports_degraded_without_data() {
        for uri in ["/health", "/api/health"] {
            let (status, body) = get_json(uri).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "degraded");
            assert_eq!(body["data_path_valid"], false);
            assert_eq!(body["details"]["session_window_hours"], 5);
            assert_eq!(body["details"]["websocket_interval"], 10);
            assert_eq!(body["details"]["broadcast_running"], false);
        }
    }

    #[tokio::test]
    async fn realtime_includes_recent_entries() {
        let (status, body) = get_json("/api/usage/realtime").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["recent_entries"].as_array().unwrap().len(), 2);
        assert_eq!(body["session"]["is_active"], true);
        assert_eq!(body["today_stats"]["total_requests"], 2);
    }

    #[tokio::test]
    async fn history_rejects_out_of_range_days() {
        for uri in [
            "/api/usage/history?days=0",
            "/api/usage/history?days=366",
            "/api/stats/models?days=abc",
        ] {
            let (status, body) = get_json(uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body["error"], "bad_request");
            assert!(body["message"].as_str().unwrap().contains("days"));
        }

        let (status, body) = get_json("/api/usage/history?days=7").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["days_requested"], 7);
    }

    #[tokio::test]
    async fn daily_validates_date_format() {
        let (status, body) = get_json("/api/usage/daily?date=14-08-2025").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");

        let (status, body) = get_json("/api/usage/daily?date=2001-01-01").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["date"], "2001-01-01");
        assert_eq!(body["total_requests"], 0);
    }

    #[tokio::test]
    async fn plan_usage_and_models() {
        let (status, body) = get_json("/api/usage/plan-usage?plan=max5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["plan"]["plan"], "max5");
        assert_eq!(body["token_usage"]["current"], 0.0);

        let (status, body) = get_json("/api/usage/plan-usage").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["plan"]["plan"], "custom");

        let (status, body) = get_json("/api/stats/models").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_models"], 2);
        assert_eq!(body["models"][0]["model"], "claude-opus-4");
    }

    #[test]
    fn api_prefix_normalization() {
        assert_eq!(normalize_api_prefix("/api"), "/api");
        assert_eq!(normalize_api_prefix("api/"), "/api");
        assert_eq!(normalize_api_prefix(" / "), "");
        assert_eq!(normalize_api_prefix(""), "");
        assert_eq!(normalize_api_prefix("/v1/usage/"), "/v1/usage");
    }
}
