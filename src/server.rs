use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing::{get, post}};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::simulator::{SimulatedModel, SimulatorAction};
use crate::analysis::RiskLevel;
use crate::events::MemoryLog;
use crate::monitor::{Monitor, SessionError};
use crate::session::{ClientStatus, LogEntry, SessionInfo};
use crate::settings::SessionSettings;

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<Mutex<Monitor>>,
    pub log: Arc<MemoryLog>,
    /// Present only when the simulated provider is wired in.
    pub simulator: Option<Arc<SimulatedModel>>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub id: Uuid,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error(status: StatusCode, err: impl ToString) -> Response {
    (status, Json(ErrorBody { error: err.to_string() })).into_response()
}

async fn create_session(
    axum::extract::State(state): axum::extract::State<AppState>,
    body: Option<Json<SessionSettings>>,
) -> Response {
    let settings = body.map(|Json(s)| s).unwrap_or_default();
    let mut monitor = state.monitor.lock().await;
    state.log.clear_disconnected();
    if let Some(sim) = &state.simulator {
        sim.set_scene(RiskLevel::Safe);
    }
    match monitor.start(settings).await {
        Ok(id) => (StatusCode::CREATED, Json(CreateSessionResponse { id })).into_response(),
        Err(SessionError::Device(err)) => error(StatusCode::SERVICE_UNAVAILABLE, err),
        Err(err) => error(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

async fn delete_session(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Response {
    let mut monitor = state.monitor.lock().await;
    match monitor.stop().await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

async fn get_session(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<SessionInfo>, StatusCode> {
    let monitor = state.monitor.lock().await;
    monitor.snapshot().map(Json).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    since: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    pub entries: Vec<LogEntry>,
    /// Index to pass as `since` on the next poll.
    pub next: usize,
    pub status: ClientStatus,
    pub disconnected: bool,
}

async fn get_logs(
    axum::extract::State(state): axum::extract::State<AppState>,
    axum::extract::Query(query): axum::extract::Query<LogsQuery>,
) -> Json<LogsResponse> {
    let start = query.since.min(state.log.len());
    let entries = state.log.since(start);
    Json(LogsResponse {
        next: start + entries.len(),
        entries,
        status: state.log.status(),
        disconnected: state.log.was_disconnected(),
    })
}

async fn simulate(
    axum::extract::State(state): axum::extract::State<AppState>,
    axum::extract::Path(action): axum::extract::Path<String>,
) -> Response {
    let Some(action) = SimulatorAction::parse(&action) else {
        return error(StatusCode::NOT_FOUND, format!("unknown simulator action '{action}'"));
    };
    match action.scene() {
        Some(level) => match &state.simulator {
            Some(sim) => {
                sim.set_scene(level);
                info!(scene = %level, "simulator scene changed");
                StatusCode::NO_CONTENT.into_response()
            }
            None => error(StatusCode::CONFLICT, "simulated provider is not active"),
        },
        None => {
            let monitor = state.monitor.lock().await;
            match monitor.exhaust_quota() {
                Ok(()) => StatusCode::NO_CONTENT.into_response(),
                Err(err) => {
                    warn!(error = %err, "quota simulation rejected");
                    error(StatusCode::CONFLICT, err)
                }
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/session",
            post(create_session).get(get_session).delete(delete_session),
        )
        .route("/v1/logs", get(get_logs))
        .route("/v1/simulate/:action", post(simulate))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let monitor = state.monitor.clone();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control surface listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    monitor.lock().await.stop().await?;
    Ok(())
}
