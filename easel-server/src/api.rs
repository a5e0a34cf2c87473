use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use easel_core::{
    registry, ArtifactCache, GenerationEvent, Orchestrator, OutputFormat, Phase, Progress,
    ProgressLabel, RecordId, RecordSummary, RequestParams, ResourceTier, Settings,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};

/// Thumbnail edge used when the query does not name one.
const DEFAULT_THUMBNAIL_EDGE: u32 = 256;
const MAX_THUMBNAIL_EDGE: u32 = 2048;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub thumbnails: ArtifactCache,
    /// Settings file re-read on reload.
    pub config_path: PathBuf,
    /// Cancellation handle of the request currently being served.
    current: Mutex<Option<CancellationToken>>,
    last_progress: Mutex<Option<ProgressReport>>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        thumbnails: ArtifactCache,
        config_path: PathBuf,
    ) -> Self {
        Self {
            orchestrator,
            thumbnails,
            config_path,
            current: Mutex::new(None),
            last_progress: Mutex::new(None),
        }
    }
}

/// Clears the active cancellation handle however the handler exits.
struct ActiveRun<'a>(&'a AppState);

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.0.current.lock().take();
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/images/generations", post(generate_image_handler))
        .route("/v1/images/generations/cancel", post(cancel_handler))
        .route("/v1/status", get(status_handler))
        .route("/v1/models", get(list_models_handler))
        .route("/v1/settings", get(settings_handler))
        .route("/v1/settings/reload", post(reload_settings_handler))
        .route(
            "/v1/history",
            get(list_history_handler).delete(clear_history_handler),
        )
        .route(
            "/v1/history/{id}",
            get(get_record_handler).delete(delete_record_handler),
        )
        .route("/v1/history/{id}/image", get(record_image_handler))
        .route("/v1/history/{id}/thumbnail", get(thumbnail_handler))
        .with_state(state)
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
struct ProgressReport {
    label: ProgressLabel,
    completed: u32,
    total: u32,
    fraction: f32,
}

impl ProgressReport {
    fn new(label: ProgressLabel, progress: Progress) -> Self {
        Self {
            label,
            completed: progress.completed,
            total: progress.total,
            fraction: progress.fraction(),
        }
    }
}

#[derive(Serialize)]
struct GenerationResponse {
    record_id: RecordId,
    seed: u64,
    width: u32,
    height: u32,
    output_format: OutputFormat,
    mime_type: &'static str,
    image: String,
}

async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    Json(params): Json<RequestParams>,
) -> AppResult<Json<GenerationResponse>> {
    let request = params.resolve(&state.orchestrator.settings());

    let cancel = {
        let mut current = state.current.lock();
        if current.is_some() || state.orchestrator.is_busy() {
            return Err(easel_core::GenerationError::Busy.into());
        }
        let token = CancellationToken::new();
        *current = Some(token.clone());
        token
    };
    let _active = ActiveRun(&state);
    state.last_progress.lock().take();

    let (events, mut rx) = mpsc::unbounded_channel();
    let relay_state = Arc::clone(&state);
    let relay = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                GenerationEvent::Progress { label, progress } => {
                    *relay_state.last_progress.lock() = Some(ProgressReport::new(label, progress));
                }
                GenerationEvent::Phase(phase) => tracing::debug!(?phase, "Generation phase"),
                GenerationEvent::Preview(_) => {}
            }
        }
    });

    let outcome = state.orchestrator.submit(request, events, cancel).await;
    let _ = relay.await;
    let outcome = outcome?;

    tracing::info!(record_id = %outcome.record_id, seed = outcome.seed(), "Served generation");
    Ok(Json(GenerationResponse {
        record_id: outcome.record_id,
        seed: outcome.seed(),
        width: outcome.request.width,
        height: outcome.request.height,
        output_format: outcome.request.output_format,
        mime_type: outcome.request.output_format.mime_type(),
        image: BASE64_STANDARD.encode(&outcome.encoded),
    }))
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn cancel_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cancelled = match state.current.lock().as_ref() {
        Some(token) => {
            token.cancel();
            true
        }
        None => false,
    };
    tracing::info!(cancelled, "Cancel requested");
    let status = if cancelled {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    (status, Json(CancelResponse { cancelled }))
}

#[derive(Serialize)]
struct StatusResponse {
    state: Phase,
    busy: bool,
    tier: ResourceTier,
    model_id: String,
    progress: Option<ProgressReport>,
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let orchestrator = &state.orchestrator;
    Json(StatusResponse {
        state: orchestrator.state(),
        busy: orchestrator.is_busy(),
        tier: orchestrator.tier(),
        model_id: orchestrator.settings().selected_model_id,
        progress: *state.last_progress.lock(),
    })
}

#[derive(Serialize)]
struct ModelEntry {
    id: &'static str,
    display_name: &'static str,
    selected: bool,
}

async fn list_models_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ModelEntry>> {
    let selected = registry::lookup(&state.orchestrator.settings().selected_model_id)
        .map(|model| model.id);
    Json(
        registry::models()
            .iter()
            .map(|model| ModelEntry {
                id: model.id,
                display_name: model.display_name,
                selected: selected == Some(model.id),
            })
            .collect(),
    )
}

async fn settings_handler(State(state): State<Arc<AppState>>) -> Json<Settings> {
    Json(state.orchestrator.settings())
}

/// Re-read the settings file. Applies from the next generation on.
async fn reload_settings_handler(State(state): State<Arc<AppState>>) -> AppResult<Json<Settings>> {
    let path = state.config_path.clone();
    let settings = tokio::task::spawn_blocking(move || Settings::load(&path))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;
    state.orchestrator.reload_settings(settings.clone());
    Ok(Json(settings))
}

async fn list_history_handler(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<RecordSummary>>> {
    Ok(Json(state.orchestrator.history().list_summaries().await?))
}

async fn get_record_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RecordId>,
) -> AppResult<Json<RecordSummary>> {
    state
        .orchestrator
        .history()
        .summary(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("record {id}")))
}

async fn record_image_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RecordId>,
) -> AppResult<impl IntoResponse> {
    let record = state
        .orchestrator
        .history()
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("record {id}")))?;
    Ok((
        [(
            header::CONTENT_TYPE,
            record.request.output_format.mime_type(),
        )],
        record.image,
    ))
}

#[derive(Deserialize)]
struct ThumbnailQuery {
    size: Option<u32>,
}

async fn thumbnail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RecordId>,
    Query(query): Query<ThumbnailQuery>,
) -> AppResult<impl IntoResponse> {
    let edge = query.size.unwrap_or(DEFAULT_THUMBNAIL_EDGE);
    if edge == 0 || edge > MAX_THUMBNAIL_EDGE {
        return Err(AppError::BadRequest(format!(
            "size must be between 1 and {MAX_THUMBNAIL_EDGE}"
        )));
    }

    let thumbnail = state
        .thumbnails
        .get(id, edge)
        .await
        .ok_or_else(|| AppError::NotFound(format!("thumbnail for record {id}")))?;
    let png = tokio::task::spawn_blocking(move || thumbnail.encode_png())
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png))
}

async fn delete_record_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RecordId>,
) -> AppResult<StatusCode> {
    let existed = state.orchestrator.history().delete(id).await?;
    state.thumbnails.invalidate(id);
    if existed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("record {id}")))
    }
}

#[derive(Serialize)]
struct ClearResponse {
    deleted: u64,
}

async fn clear_history_handler(State(state): State<Arc<AppState>>) -> AppResult<Json<ClearResponse>> {
    let deleted = state.orchestrator.history().delete_all().await?;
    state.thumbnails.clear();
    Ok(Json(ClearResponse { deleted }))
}
