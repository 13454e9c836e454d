use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{Job, JobBuilder, JobEngine, JobIn, Transform, TransformBuilder, TransformIn};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::{lock, AppState};

pub const USER_HEADER: &str = "x-user-id";

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/transforms", post(create_transform).get(list_transforms))
        .route("/api/v1/transforms/:id", get(get_transform).delete(delete_transform))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores ---------------- */

/// Error de la API: se responde como `{"detail": msg}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn not_found(kind: &str, id: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("The {kind} {id:?} does not exist."))
    }

    fn forbidden(kind: &str, id: &str) -> Self {
        Self::new(StatusCode::FORBIDDEN, format!("The {kind} {id:?} belongs to another user."))
    }
}

impl From<common::Error> for ApiError {
    fn from(e: common::Error) -> Self {
        let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

/// Identidad del llamador; la autenticación queda fuera del servicio.
fn caller(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, format!("Missing {USER_HEADER} header.")))
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Compila el fuente y guarda el transform
async fn create_transform(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TransformIn>,
) -> Result<Json<Transform>, ApiError> {
    let user = caller(&headers)?;
    let transform = TransformBuilder::new(&req, &user).create()?;

    lock(&state.transforms).insert(transform.id.clone(), transform.clone());
    info!("transform {} creado por {}", transform.id, user);
    Ok(Json(transform))
}

// Transforms propios o públicos
async fn list_transforms(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Vec<Transform>>, ApiError> {
    let user = caller(&headers)?;
    let transforms = lock(&state.transforms);
    let mut visible: Vec<Transform> = transforms.values().filter(|t| t.readable_by(&user)).cloned().collect();
    visible.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(Json(visible))
}

fn readable_transform(state: &AppState, id: &str, user: &str) -> Result<Transform, ApiError> {
    let transforms = lock(&state.transforms);
    let transform = transforms.get(id).ok_or_else(|| ApiError::not_found("transform", id))?;
    if !transform.readable_by(user) {
        return Err(ApiError::forbidden("transform", id));
    }
    Ok(transform.clone())
}

async fn get_transform(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Transform>, ApiError> {
    let user = caller(&headers)?;
    readable_transform(&state, &id, &user).map(Json)
}

// Solo el dueño puede borrar
async fn delete_transform(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let user = caller(&headers)?;
    let mut transforms = lock(&state.transforms);
    match transforms.get(&id) {
        None => return Err(ApiError::not_found("transform", &id)),
        Some(t) if t.user_id != user => return Err(ApiError::forbidden("transform", &id)),
        Some(_) => {}
    }
    transforms.remove(&id);
    info!("transform {} borrado", id);
    Ok(StatusCode::NO_CONTENT)
}

// Arma el job, lo ejecuta y transfiere las salidas. El job queda guardado
// aunque falle.
async fn create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<JobIn>,
) -> Result<Json<Job>, ApiError> {
    let user = caller(&headers)?;
    let transform = readable_transform(&state, &req.transform_id, &user)?;
    let mut job = JobBuilder::new(&req, &user, &transform).create()?;

    let engine = JobEngine::new(
        state.executor.as_ref(),
        state.blobs.as_ref(),
        &state.settings.jobs_bucket,
        &state.settings.public_url,
    );
    let result = engine.run(&transform, &mut job).await;
    lock(&state.jobs).insert(job.id.clone(), job.clone());

    if let Err(e) = result {
        warn!("job {} terminó con error: {}", job.id, e);
        return Err(e.into());
    }
    Ok(Json(job))
}

async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let user = caller(&headers)?;
    let jobs = lock(&state.jobs);
    let job = jobs.get(&id).ok_or_else(|| ApiError::not_found("job", &id))?;
    if job.user_id != user {
        return Err(ApiError::forbidden("job", &id));
    }
    Ok(Json(job.clone()))
}
