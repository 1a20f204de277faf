use axum::body::Bytes;
use axum::extract::Request;
use axum::{
  extract::{Path, Query, State},
  http::StatusCode,
  middleware::Next,
  response::{IntoResponse, Response},
  routing::{delete, get},
  Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tower_http::trace::TraceLayer;

use crate::cache::CacheAdmin;
use crate::config::AuthSection;
use crate::store::StoreError;

pub const API_TOKEN_HEADER: &str = "x-render-cache-api";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
  pub admin: CacheAdmin,
  pub auth: AuthSection,
}

/// Admin API router. Everything under `/api/render-cache` except `/health`
/// requires the API token.
pub fn router(state: AppState) -> Router {
  let admin_routes = Router::new()
    .route("/keys", get(api_list_keys).delete(api_delete_by_tags))
    .route("/keys/{key}", get(api_get_key).delete(api_delete_key))
    .route("/clear", delete(api_clear))
    .route("/stats", get(api_stats))
    .layer(axum::middleware::from_fn_with_state(
      state.clone(),
      api_auth_middleware,
    ));

  let api = Router::new().route("/health", get(api_health)).merge(admin_routes);

  Router::new()
    .nest("/api/render-cache", api)
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

// =============================================================================
// Auth Middleware
// =============================================================================

/// Hash a token using SHA-256
fn hash_token(token: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(token.as_bytes());
  format!("{:x}", hasher.finalize())
}

/// Missing header is 401; a token that does not match the configured one (or no
/// configured token at all) is 403.
async fn api_auth_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
  if !state.auth.enabled {
    return next.run(req).await;
  }

  let Some(provided) = req
    .headers()
    .get(API_TOKEN_HEADER)
    .and_then(|v| v.to_str().ok())
    .filter(|v| !v.is_empty())
  else {
    return AppError::Unauthorized(format!("Missing {} header", API_TOKEN_HEADER)).into_response();
  };

  let authorized = match state.auth.api_token.as_deref() {
    Some(expected) if !expected.is_empty() => hash_token(provided) == hash_token(expected),
    _ => false,
  };

  if authorized {
    next.run(req).await
  } else {
    AppError::Forbidden("Invalid token".to_string()).into_response()
  }
}

// =============================================================================
// Handlers
// =============================================================================

async fn api_health() -> Json<serde_json::Value> {
  Json(json!({ "status": "ok" }))
}

async fn api_list_keys(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
  let listing = state.admin.list_keys().await?;
  Ok(Json(json!({
    "count": listing.keys.len(),
    "keys": listing.keys,
    "tags": listing.tags,
    "success": true,
  })))
}

#[derive(Debug, Default, Deserialize)]
struct TagsQuery {
  tags: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TagsBody {
  #[serde(default)]
  tags: Vec<String>,
}

fn clean_tags<I: IntoIterator<Item = String>>(tags: I) -> Vec<String> {
  tags
    .into_iter()
    .map(|t| t.trim().to_string())
    .filter(|t| !t.is_empty())
    .collect()
}

/// Tags come from `?tags=a,b`, falling back to a `{"tags": [..]}` body
async fn api_delete_by_tags(
  State(state): State<AppState>,
  Query(query): Query<TagsQuery>,
  body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
  let mut tags = clean_tags(
    query
      .tags
      .unwrap_or_default()
      .split(',')
      .map(str::to_string),
  );

  if tags.is_empty() && !body.is_empty() {
    let parsed: TagsBody = serde_json::from_slice(&body)
      .map_err(|e| AppError::BadRequest(format!("Invalid body: {}", e)))?;
    tags = clean_tags(parsed.tags);
  }

  if tags.is_empty() {
    return Err(AppError::BadRequest(
      "Tags are required (query: ?tags=tag1,tag2 or body: {\"tags\": [\"tag1\", \"tag2\"]})"
        .to_string(),
    ));
  }

  let deleted = state.admin.delete_by_tags(&tags).await?;
  Ok(Json(json!({
    "tags": tags,
    "deletedCount": deleted,
    "success": true,
  })))
}

async fn api_get_key(
  State(state): State<AppState>,
  Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
  let body = match state.admin.get_entry(&key).await? {
    Some(entry) => json!({
      "key": key,
      "exists": true,
      "data": entry.payload,
      "timestamp": entry.created_at,
      "tags": entry.tags,
      "success": true,
    }),
    None => json!({
      "key": key,
      "exists": false,
      "success": true,
    }),
  };
  Ok(Json(body))
}

async fn api_delete_key(
  State(state): State<AppState>,
  Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
  let deleted = state.admin.delete_entry(&key).await?;
  Ok(Json(json!({
    "key": key,
    "deleted": deleted > 0,
    "success": true,
  })))
}

async fn api_clear(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
  let deleted = state.admin.clear_all().await?;
  Ok(Json(json!({
    "cleared": true,
    "deletedCount": deleted,
    "success": true,
  })))
}

async fn api_stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
  let stats = state.admin.get_stats().await?;
  Ok(Json(json!({
    "totalKeys": stats.total_keys,
    "storeInfo": stats.store_info,
    "success": true,
  })))
}

// =============================================================================
// Errors
// =============================================================================

enum AppError {
  Internal(anyhow::Error),
  BadRequest(String),
  Unauthorized(String),
  Forbidden(String),
}

impl From<StoreError> for AppError {
  fn from(e: StoreError) -> Self {
    Self::Internal(e.into())
  }
}

impl IntoResponse for AppError {
  fn into_response(self) -> Response {
    let (status, msg) = match self {
      Self::Internal(e) => {
        tracing::error!("Admin API request failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
      }
      Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
      Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
      Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
    };
    (status, Json(json!({ "error": msg }))).into_response()
  }
}
