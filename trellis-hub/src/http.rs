/**
 * API REST TRELLIS - Surface d'administration du hub
 *
 * RÔLE :
 * Expose les opérations de l'Instance Store et de l'orchestrateur aux
 * outils d'admin (CLI, setup, dashboard).
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key
 * - Routes : /health, /instances (CRUD), actions start/stop/restart,
 *   /instances/.../logs, /containers, /status
 * - Erreurs HubError → JSON {ok, error: {code, message}}
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - TRELLIS_API_KEY absent = API fermée
 */
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use crate::config::HubSettings;
use crate::error::HubError;
use crate::logs::LogLine;
use crate::models::{InstanceConfig, Shared, StatusMap};
use crate::orchestrator::Orchestrator;
use crate::store::InstanceStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<InstanceStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub statuses: Shared<StatusMap>,
    pub settings: HubSettings,
}

/// Enveloppe d'erreur de l'API.
struct ApiError(HubError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            HubError::NotFound(_) => StatusCode::NOT_FOUND,
            HubError::AlreadyExists(_) => StatusCode::CONFLICT,
            HubError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            HubError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "ok": false,
            "error": { "code": self.0.code(), "message": self.0.to_string() },
        });
        (status, Json(body)).into_response()
    }
}

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        Self(e)
    }
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    // Health check toujours accessible
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("TRELLIS_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        warn!("TRELLIS_API_KEY absent, accès API refusé");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/instances", get(list_instances).post(create_instance))
        .route(
            "/instances/{connector}/{id}",
            get(get_instance).put(update_instance).delete(remove_instance),
        )
        .route("/instances/{connector}/{id}/start", post(start_instance))
        .route("/instances/{connector}/{id}/stop", post(stop_instance))
        .route("/instances/{connector}/{id}/restart", post(restart_instance))
        .route("/instances/{connector}/{id}/logs", get(instance_logs))
        .route("/containers", get(list_containers))
        .route("/status", get(get_status))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    connector: Option<String>,
}

// GET /instances (liste, filtre ?connector=)
async fn list_instances(
    State(app): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<InstanceConfig>>, ApiError> {
    Ok(Json(app.store.list(params.connector.as_deref()).await?))
}

// POST /instances : persiste puis crée l'unité (Configuring→...→Starting)
async fn create_instance(
    State(app): State<AppState>,
    Json(cfg): Json<InstanceConfig>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let cfg = app.store.create(cfg).await?;
    let record = match app.orchestrator.create(&cfg).await {
        Ok(record) => record,
        Err(e) => {
            // Pas d'unité = pas de définition orpheline.
            let _ = app.store.delete(&cfg.connector_type, &cfg.id).await;
            return Err(e.into());
        }
    };
    app.orchestrator.start(&cfg.connector_type, &cfg.id).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "ok": true, "instance": cfg, "container": record })),
    ))
}

// GET /instances/:connector/:id
async fn get_instance(
    State(app): State<AppState>,
    Path((connector, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cfg = app.store.get(&connector, &id).await?;
    let lifecycle = app.orchestrator.state_of(&id).map(|s| s.as_str());
    let presence = app.statuses.lock().get(&id).cloned();
    Ok(Json(serde_json::json!({
        "instance": cfg,
        "lifecycle": lifecycle,
        "status": presence,
    })))
}

// PUT /instances/:connector/:id : nouvelle définition, prise en compte au
// prochain restart (le fichier est monté, l'unité relit au démarrage)
async fn update_instance(
    State(app): State<AppState>,
    Path((connector, id)): Path<(String, String)>,
    Json(mut cfg): Json<InstanceConfig>,
) -> Result<Json<InstanceConfig>, ApiError> {
    cfg.connector_type = connector;
    cfg.id = id;
    Ok(Json(app.store.update(cfg).await?))
}

#[derive(Debug, Deserialize)]
struct RemoveParams {
    #[serde(default)]
    force: bool,
}

// DELETE /instances/:connector/:id : unité puis définition
async fn remove_instance(
    State(app): State<AppState>,
    Path((connector, id)): Path<(String, String)>,
    Query(params): Query<RemoveParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    app.orchestrator.remove(&connector, &id, params.force).await?;
    app.store.delete(&connector, &id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn start_instance(
    State(app): State<AppState>,
    Path((connector, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    app.store.get(&connector, &id).await?;
    app.orchestrator.start(&connector, &id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct StopParams {
    grace: Option<u64>,
}

async fn stop_instance(
    State(app): State<AppState>,
    Path((connector, id)): Path<(String, String)>,
    Query(params): Query<StopParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    app.orchestrator.stop(&connector, &id, params.grace).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn restart_instance(
    State(app): State<AppState>,
    Path((connector, id)): Path<(String, String)>,
    Query(params): Query<StopParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    app.orchestrator.restart(&connector, &id, params.grace).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct LogsParams {
    tail: Option<u32>,
    since: Option<String>,
}

// GET /instances/:connector/:id/logs : lignes classifiées, sans suivi
// (le suivi temps réel passe par le CLI du runtime)
async fn instance_logs(
    State(app): State<AppState>,
    Path((connector, id)): Path<(String, String)>,
    Query(params): Query<LogsParams>,
) -> Result<Json<Vec<LogLine>>, ApiError> {
    let mut rx = app
        .orchestrator
        .logs(&connector, &id, params.tail.or(Some(200)), params.since, false)?;
    let mut lines = Vec::new();
    while let Some(line) = rx.recv().await {
        lines.push(line);
    }
    Ok(Json(lines))
}

// GET /containers (vue runtime fusionnée)
async fn list_containers(State(app): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let records = app.orchestrator.list().await?;
    Ok(Json(serde_json::json!({ "containers": records })))
}

// GET /status (présences observées sur le bus)
async fn get_status(State(app): State<AppState>) -> Json<serde_json::Value> {
    let statuses: Vec<_> = app.statuses.lock().values().cloned().collect();
    Json(serde_json::json!({ "instances": statuses }))
}
