use crate::config::Config;
use crate::document::{self, DecodedDocument, SUPPORTED_EXTENSIONS};
use crate::engines::{EngineInfo, EngineRegistry};
use crate::error::OcrError;
use crate::ocr::{LanguageKey, OcrOutput, OcrProcessor};
use axum::{
    extract::{DefaultBodyLimit, State},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

/// Room for JSON framing around the base64 payload
const BODY_OVERHEAD: usize = 64 * 1024;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<OcrProcessor>,
    pub config: Arc<Config>,
    pub engines: Arc<Vec<EngineInfo>>,
}

/// OCR request
#[derive(Debug, Deserialize)]
pub struct OcrRequest {
    pub file_name: String,
    #[serde(default)]
    pub content_base64: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// OCR response
#[derive(Debug, Serialize)]
pub struct OcrResponse {
    pub text: String,
    pub lines: Vec<String>,
    pub language: String,
    pub engine: String,
    /// Pages run through OCR; zero for documents read as text
    pub pages: usize,
    pub processing_time_ms: u64,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Server info response
#[derive(Serialize)]
pub struct InfoResponse {
    pub version: String,
    pub engine: String,
    pub available_engines: Vec<EngineInfo>,
    pub supported_formats: Vec<String>,
    pub loaded_languages: Vec<String>,
    pub max_file_size_bytes: usize,
    pub default_language: String,
}

/// Run the HTTP server
pub async fn run(config: Config) -> anyhow::Result<()> {
    let registry = EngineRegistry::new(&config)?;
    let engine = registry.select(config.engine.as_deref())?;
    let default_language = LanguageKey::new(&config.default_language)
        .ok_or_else(|| anyhow::anyhow!("Default language must not be empty"))?;

    tracing::info!(
        "Using engine '{}' v{} (available: {})",
        engine.name(),
        engine.version(),
        registry.list().join(", ")
    );

    let processor = OcrProcessor::new(engine, config.construction_candidates(), default_language);
    let addr = format!("{}:{}", config.host, config.port);

    let state = AppState {
        processor: Arc::new(processor),
        config: Arc::new(config),
        engines: Arc::new(registry.info()),
    };

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, router(state)).await?;

    Ok(())
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    // base64 inflates the payload by a third
    let body_limit = state.config.max_file_size / 3 * 4 + BODY_OVERHEAD;

    Router::new()
        .route("/v1/ocr", post(handle_ocr))
        .route("/healthz", get(handle_health))
        .route("/info", get(handle_info))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handle OCR requests
async fn handle_ocr(
    State(state): State<AppState>,
    Json(request): Json<OcrRequest>,
) -> Result<Json<OcrResponse>, OcrError> {
    let start = Instant::now();

    if request.content_base64.trim().is_empty() {
        return Err(OcrError::InvalidRequest(
            "content_base64 is required".to_string(),
        ));
    }

    let data = document::decode_base64(&request.content_base64)?;

    // Check file size
    if data.len() > state.config.max_file_size {
        return Err(OcrError::ImageTooLarge {
            size: data.len(),
            max: state.config.max_file_size,
        });
    }

    let language = state.processor.language_for(request.language.as_deref());
    let processor = Arc::clone(&state.processor);
    let file_name = request.file_name;
    let job_language = language.clone();

    let (output, pages) = tokio::task::spawn_blocking(move || {
        match document::decode(&file_name, &data)? {
            DecodedDocument::Pages { pages, _spool } => {
                let output = processor.run_ocr(&pages, &job_language)?;
                Ok::<_, OcrError>((output, pages.len()))
            }
            DecodedDocument::Lines(lines) => Ok((OcrOutput::from_lines(lines), 0)),
        }
    })
    .await
    .map_err(|e| OcrError::Internal(format!("OCR task failed: {}", e)))??;

    let processing_time_ms = start.elapsed().as_millis() as u64;

    tracing::info!(
        "OCR completed in {}ms, language: {}, pages: {}, lines: {}",
        processing_time_ms,
        language,
        pages,
        output.lines.len()
    );

    Ok(Json(OcrResponse {
        text: output.text,
        lines: output.lines,
        language: language.to_string(),
        engine: state.processor.engine().name().to_string(),
        pages,
        processing_time_ms,
    }))
}

/// Handle health check requests
async fn handle_health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Handle info requests
async fn handle_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        engine: state.processor.engine().name().to_string(),
        available_engines: state.engines.as_ref().clone(),
        supported_formats: SUPPORTED_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        loaded_languages: state.processor.cache().loaded_languages(),
        max_file_size_bytes: state.config.max_file_size,
        default_language: state.processor.default_language().to_string(),
    })
}
