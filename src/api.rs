use std::sync::Arc;
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    config::ServiceCfg,
    error::{CompareError, ValidationError},
    events::TracingSink,
    reaper,
    service::{CompareService, ComparisonResult},
    similarity::KeypointOutcome,
    upload::{CompareRequest, Slot, UploadPart},
};

const INDEX_HTML: &str = include_str!("../static/index.html");
const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Clone)]
pub struct AppState {
    service: Arc<CompareService>,
}

pub fn router(service: Arc<CompareService>) -> Router {
    let limit = service.config().max_body_bytes as usize;
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .route("/compare", post(compare))
        .layer(DefaultBodyLimit::max(limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service })
}

pub async fn serve(cfg: ServiceCfg) -> Result<()> {
    tokio::fs::create_dir_all(&cfg.scratch_dir)
        .await
        .with_context(|| format!("Failed to create scratch directory: {}", cfg.scratch_dir.display()))?;

    let reaper = cfg.reaper.enabled.then(|| reaper::spawn(cfg.scratch_dir.clone(), cfg.reaper.clone()));

    let service = Arc::new(CompareService::new(cfg.clone(), Arc::new(TracingSink)));
    let app = router(service);

    let listener = tokio::net::TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.bind))?;
    tracing::info!(
        bind = %cfg.bind,
        scratch_dir = %cfg.scratch_dir.display(),
        max_body_bytes = cfg.max_body_bytes,
        ssim = cfg.metrics.ssim,
        keypoints = cfg.metrics.keypoints,
        "forgecheck listening"
    );
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    if let Some(handle) = reaper {
        handle.abort();
    }
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Serialize)]
struct Health { status: &'static str }

async fn healthz() -> Json<Health> {
    Json(Health { status: "ok" })
}

#[derive(Debug, Serialize)]
pub struct CompareResponse {
    pub hash1: String,
    pub hash2: String,
    pub result: &'static str,
    pub identical: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssim_index: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssim_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keypoints: Option<KeypointReport>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum KeypointReport {
    Outcome(KeypointOutcome),
    Failed { status: &'static str, error: String },
}

impl From<ComparisonResult> for CompareResponse {
    fn from(r: ComparisonResult) -> Self {
        let (ssim_index, ssim_error) = match r.ssim {
            Some(Ok(s)) => (Some(s), None),
            Some(Err(e)) => (None, Some(e.to_string())),
            None => (None, None),
        };
        let keypoints = r.keypoints.map(|k| match k {
            Ok(outcome) => KeypointReport::Outcome(outcome),
            Err(e) => KeypointReport::Failed { status: "failed", error: e.to_string() },
        });
        Self {
            result: r.verdict.message(),
            identical: r.verdict == crate::service::Verdict::Identical,
            hash1: r.hash1,
            hash2: r.hash2,
            ssim_index,
            ssim_error,
            keypoints,
        }
    }
}

async fn compare(
    State(st): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<impl IntoResponse, ApiErr> {
    let limit = st.service.config().max_body_bytes;
    let mut multipart = multipart.map_err(|e| ApiErr::bad_request(e.body_text()))?;

    let mut req = CompareRequest::default();
    while let Some(field) = multipart.next_field().await.map_err(|e| ApiErr::multipart(e.status(), e.body_text(), limit))? {
        let Some(slot) = field.name().and_then(Slot::from_field) else { continue };
        // Parts without a filename are form fields, not files.
        let Some(file_name) = field.file_name().map(str::to_string) else { continue };
        let bytes = field.bytes().await.map_err(|e| ApiErr::multipart(e.status(), e.body_text(), limit))?;
        if !req.insert(slot, UploadPart { file_name, bytes }) {
            tracing::debug!(%slot, "ignoring duplicate part");
        }
    }

    let result = st.service.compare(req).await?;
    let request_id = HeaderValue::from_str(&result.request_id.to_string()).map_err(ApiErr::internal)?;
    Ok(([(REQUEST_ID, request_id)], Json(CompareResponse::from(result))))
}

#[derive(Debug)]
struct ApiErr {
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiErr {
    fn internal(e: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error".to_string(),
            message: format!("Internal error: {}", e),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request".to_string(),
            message: message.into(),
        }
    }

    fn multipart(status: StatusCode, body_text: String, limit: u64) -> Self {
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return Self::from(CompareError::from(ValidationError::TooLarge { limit }));
        }
        Self { status, code: "bad_multipart".to_string(), message: body_text }
    }
}

impl From<CompareError> for ApiErr {
    fn from(e: CompareError) -> Self {
        let status = match &e {
            CompareError::Validation(ValidationError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            CompareError::Validation(_) => StatusCode::BAD_REQUEST,
            CompareError::Storage { .. } | CompareError::Hash { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            CompareError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        };
        Self { status, code: e.code().to_string(), message: e.to_string() }
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> axum::response::Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            code: String,
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: self.code,
            }),
        )
            .into_response()
    }
}
