use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{GenerationPrompt, ModelMetadata, ModelService, TextResponse},
    preprocess::ImageNormalizer,
    prompts,
    sanitize::Sanitizer,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub service: Arc<ModelService>,
    pub normalizer: ImageNormalizer,
    pub sanitizer: Arc<Sanitizer>,
}

#[derive(Serialize)]
struct MetadataResponse {
    model: ModelMetadata,
    max_new_tokens: usize,
    max_pixels: u64,
    generation_timeout_secs: Option<u64>,
}

pub fn build_router(config: Arc<AppConfig>, service: Arc<ModelService>) -> Router {
    let state = AppState {
        normalizer: ImageNormalizer::new(config.max_pixels),
        sanitizer: Arc::new(Sanitizer::new(config.dedup_min_key_len)),
        service,
        config,
    };
    let body_limit = state.config.max_body_bytes;

    Router::new()
        .route("/health", get(health))
        .route("/metadata", get(metadata))
        .route("/api/convert", post(convert_image))
        .route("/api/refactor", post(refactor_text))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn metadata(State(state): State<AppState>) -> Json<MetadataResponse> {
    Json(MetadataResponse {
        model: state.service.metadata(),
        max_new_tokens: state.service.params().max_new_tokens,
        max_pixels: state.normalizer.max_pixels,
        generation_timeout_secs: state.service.timeout().map(|t| t.as_secs()),
    })
}

async fn convert_image(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<TextResponse>, ServiceError> {
    let _release = state.service.release_guard();

    let request = json_object(&body).ok_or(ServiceError::MissingImageData)?;
    let payload =
        string_field(&request, "base64Data")?.ok_or(ServiceError::MissingImageData)?;
    info!(payload_bytes = payload.len(), "convert request");

    let normalizer = state.normalizer;
    let image = task::spawn_blocking(move || normalizer.decode_and_normalize(&payload))
        .await
        .map_err(|e| ServiceError::Other(format!("image task failed: {e}")))??;

    let raw = state
        .service
        .generate(GenerationPrompt::with_image(prompts::OCR_INSTRUCTION, image))
        .await?;

    Ok(Json(TextResponse {
        text: state.sanitizer.sanitize(&raw),
    }))
}

async fn refactor_text(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<TextResponse>, ServiceError> {
    let _release = state.service.release_guard();

    let request = json_object(&body).ok_or(ServiceError::MissingText)?;
    let text = string_field(&request, "text")?.ok_or(ServiceError::MissingText)?;
    let instruction = string_field(&request, "prompt")?.unwrap_or_default();
    info!(
        text_chars = text.len(),
        instruction_chars = instruction.len(),
        "refactor request"
    );

    let raw = state
        .service
        .generate(GenerationPrompt::text(prompts::refactor_prompt(
            &instruction,
            &text,
        )))
        .await?;

    Ok(Json(TextResponse {
        text: state.sanitizer.sanitize(&raw),
    }))
}

/// Parse a request body as a JSON object.
fn json_object(body: &[u8]) -> Option<Map<String, Value>> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// `Ok(None)` when `key` is absent; a present key must hold a string.
fn string_field(
    object: &Map<String, Value>,
    key: &'static str,
) -> Result<Option<String>, ServiceError> {
    match object.get(key) {
        None => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(ServiceError::InvalidField {
            field: key,
            found: json_type_name(other),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
