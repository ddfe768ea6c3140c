//! ---
//! bw_section: "05-networking-external-interfaces"
//! bw_subsection: "module"
//! bw_type: "source"
//! bw_scope: "code"
//! bw_description: "Administrative HTTP API over the resilience engine."
//! bw_version: "v0.1.0"
//! bw_owner: "tbd"
//! ---

use std::fmt;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bulwark_resilience::{
    BreakerSnapshot, ChaosExperimentConfig, ErrorStatistics, ExperimentStatus,
    ExperimentSummary, HealthStatus, ResilienceEngine,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

/// Shared API state exposed to handlers.
pub struct ApiState {
    engine: Arc<ResilienceEngine>,
    version: String,
    start: Instant,
}

impl ApiState {
    pub fn new(engine: Arc<ResilienceEngine>, version: impl Into<String>) -> Self {
        Self {
            engine,
            version: version.into(),
            start: Instant::now(),
        }
    }

    pub fn engine(&self) -> &Arc<ResilienceEngine> {
        &self.engine
    }

    fn status(&self) -> StatusResponse {
        StatusResponse {
            version: self.version.clone(),
            uptime_seconds: self.start.elapsed().as_secs(),
            breaker_count: self.engine.breaker_snapshots().len(),
            chaos_enabled: self.engine.chaos().enabled(),
        }
    }

    fn require_chaos(&self) -> Result<(), ApiError> {
        if self.engine.chaos().enabled() {
            Ok(())
        } else {
            Err(ApiError::new(
                StatusCode::FORBIDDEN,
                "chaos experiments are disabled",
            ))
        }
    }
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Handle to the running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// Route table for the administrative API.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/status", get(get_status))
        .route("/api/breakers", get(list_breakers))
        .route("/api/breakers/reset", post(reset_all_breakers))
        .route("/api/breakers/:key", get(get_breaker))
        .route("/api/breakers/:key/reset", post(reset_breaker))
        .route("/api/errors/stats", get(get_statistics))
        .route("/api/errors/reset", post(reset_statistics))
        .route(
            "/api/chaos/experiments",
            get(list_experiments).post(start_experiment),
        )
        .route("/api/chaos/experiments/:id", delete(stop_experiment))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve the API until [`ApiServer::shutdown`] is called.
pub fn spawn_api_server(state: Arc<ApiState>, addr: SocketAddr) -> Result<ApiServer> {
    let router = router(state);

    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let addr = listener
        .local_addr()
        .context("failed to read API listener address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %addr, "api server listening");
        if let Err(err) = axum::serve(tcp_listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %addr, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    breaker_count: usize,
    chaos_enabled: bool,
}

#[derive(Debug, Serialize)]
struct ResetAck {
    reset: usize,
}

#[derive(Debug, Serialize)]
struct StatisticsResetAck {
    reset_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ExperimentStarted {
    id: Uuid,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

async fn get_health(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<HealthStatus>) {
    let health = state.engine.health();
    let status = if health.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(health))
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    Json(state.status())
}

async fn list_breakers(State(state): State<Arc<ApiState>>) -> Json<Vec<BreakerSnapshot>> {
    Json(state.engine.breaker_snapshots())
}

async fn get_breaker(
    State(state): State<Arc<ApiState>>,
    Path(key): Path<String>,
) -> Result<Json<BreakerSnapshot>, ApiError> {
    state
        .engine
        .breaker_snapshot(&key)
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown breaker {key}")))
}

async fn reset_breaker(
    State(state): State<Arc<ApiState>>,
    Path(key): Path<String>,
) -> Result<Json<ResetAck>, ApiError> {
    if state.engine.reset_circuit_breaker(&key) {
        info!(breaker = %key, "breaker reset via api");
        Ok(Json(ResetAck { reset: 1 }))
    } else {
        Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("unknown breaker {key}"),
        ))
    }
}

async fn reset_all_breakers(State(state): State<Arc<ApiState>>) -> Json<ResetAck> {
    let reset = state.engine.reset_all_circuit_breakers();
    info!(reset, "all breakers reset via api");
    Json(ResetAck { reset })
}

async fn get_statistics(State(state): State<Arc<ApiState>>) -> Json<ErrorStatistics> {
    Json(state.engine.statistics())
}

async fn reset_statistics(State(state): State<Arc<ApiState>>) -> Json<StatisticsResetAck> {
    state.engine.reset_statistics();
    info!("error statistics reset via api");
    Json(StatisticsResetAck {
        reset_at: Utc::now(),
    })
}

async fn list_experiments(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<ExperimentStatus>>, ApiError> {
    state.require_chaos()?;
    Ok(Json(state.engine.chaos().list_experiments().await))
}

async fn start_experiment(
    State(state): State<Arc<ApiState>>,
    Json(config): Json<ChaosExperimentConfig>,
) -> Result<(StatusCode, Json<ExperimentStarted>), ApiError> {
    state.require_chaos()?;
    let id = state
        .engine
        .start_experiment(config)
        .await
        .map_err(|err| ApiError::new(StatusCode::BAD_REQUEST, format!("{err:#}")))?;
    Ok((StatusCode::ACCEPTED, Json(ExperimentStarted { id })))
}

async fn stop_experiment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExperimentSummary>, ApiError> {
    state.require_chaos()?;
    state
        .engine
        .stop_experiment(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown experiment {id}")))
}
