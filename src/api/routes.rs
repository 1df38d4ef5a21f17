//! API routes for cache administration

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::context::CacheContext;
use crate::invalidation::{pattern_prefix, AffectedData, InvalidationScope, InvalidationStats};
use crate::metrics::MetricsSnapshot;
use crate::swr::SwrStats;

/// Application state
pub struct AppState {
    pub context: Arc<CacheContext>,
}

/// Error body returned with a non-success status
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Rejection carrying a status and a message
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

/// Health check response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub store: String,
    pub store_available: bool,
}

/// Invalidation request body
#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub target: Option<String>,
    #[serde(default = "default_reason")]
    pub reason: String,
    pub data: Option<Value>,
    /// What `manual` invalidation targets
    #[serde(default)]
    pub scope: InvalidationScope,
}

fn default_method() -> String {
    "rule".to_string()
}

fn default_reason() -> String {
    "manual".to_string()
}

/// Invalidation response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateResponse {
    pub success: bool,
    pub method: String,
    pub target: String,
    pub reason: String,
    pub invalidated_count: usize,
    /// Milliseconds spent invalidating
    pub duration: u64,
    pub timestamp: DateTime<Utc>,
}

/// Query parameters for the statistics endpoint
#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub action: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub invalidation_manager: InvalidationStats,
    pub swr_cache: SwrStats,
    pub metrics: MetricsSnapshot,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct RulesResponse {
    pub rules: Vec<String>,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = state.context.store();
    let store_available = store.is_available().await;

    Json(HealthResponse {
        status: if store_available { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: store.backend().to_string(),
        store_available,
    })
}

/// Invalidate cache entries by tag, pattern, rule, described change, or manually
pub async fn invalidate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let target = match request.target.as_deref().map(str::trim) {
        Some(target) if !target.is_empty() => target.to_string(),
        _ => return Err(ApiError::bad_request("Target is required")),
    };

    info!(
        "Cache invalidation API called: {}:{} ({})",
        request.method, target, request.reason
    );

    let context = &state.context;
    let started = Instant::now();

    let invalidated_count = match request.method.as_str() {
        "tag" => context.swr().invalidate_by_tag(&target).await,
        "pattern" => {
            let prefix = pattern_prefix(&target)
                .ok_or_else(|| ApiError::bad_request("Pattern must start with a prefix"))?;
            context.swr().clear(Some(&prefix)).await
        }
        "rule" => {
            context
                .invalidation()
                .invalidate_by_rule(&target, request.data.as_ref())
                .await
        }
        "smart" => {
            let affected = request
                .data
                .filter(|data| data.get("type").is_some())
                .and_then(|data| serde_json::from_value::<AffectedData>(data).ok())
                .ok_or_else(|| ApiError::bad_request("Smart invalidation requires data.type"))?;
            context.invalidation().smart_invalidate(&target, &affected).await
        }
        "manual" => {
            context
                .invalidation()
                .manual_invalidate(&target, &request.reason, request.scope)
                .await
        }
        other => {
            return Err(ApiError::bad_request(format!(
                "Unknown invalidation method: {}",
                other
            )))
        }
    };

    Ok(Json(InvalidateResponse {
        success: true,
        method: request.method,
        target,
        reason: request.reason,
        invalidated_count,
        duration: started.elapsed().as_millis() as u64,
        timestamp: Utc::now(),
    }))
}

/// Invalidation statistics or the list of registered rules
pub async fn invalidation_info(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsQuery>,
) -> Result<Response, ApiError> {
    let context = &state.context;

    match params.action.as_deref() {
        Some("stats") => Ok(Json(StatsResponse {
            invalidation_manager: context.invalidation().get_stats(),
            swr_cache: context.swr().get_stats(None).await,
            metrics: context.metrics().snapshot(),
            timestamp: Utc::now(),
        })
        .into_response()),
        Some("rules") => {
            let rules = context.invalidation().get_stats().rules;
            Ok(Json(RulesResponse {
                count: rules.len(),
                rules,
                timestamp: Utc::now(),
            })
            .into_response())
        }
        _ => Err(ApiError::bad_request(
            "Unknown action. Use ?action=stats or ?action=rules",
        )),
    }
}
