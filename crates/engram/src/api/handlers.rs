use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::{ApiError, AppState};
use crate::error::EngramError;
use crate::memory::{MemoryRecord, RetrievedMemory, Speaker, format_context};
use crate::service::ServiceStats;

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Health check endpoint - returns JSON status
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub text: String,
    #[serde(default)]
    pub speaker: Speaker,
    /// Event time; defaults to the time of the request
    pub timestamp: Option<DateTime<Utc>>,
}

pub async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Json(request): Json<IngestRequest>,
) -> ApiResult<(StatusCode, Json<MemoryRecord>)> {
    let record = state
        .service
        .ingest(&conversation_id, request.speaker, &request.text, request.timestamp)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Deserialize)]
pub struct RetrieveRequest {
    pub query: String,
    pub k: Option<usize>,
    pub token_budget: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RetrieveResponse {
    pub memories: Vec<RetrievedMemory>,
    /// `memories` rendered for a system prompt; empty when there are none
    pub context: String,
}

pub async fn retrieve_handler(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Json(request): Json<RetrieveRequest>,
) -> ApiResult<Json<RetrieveResponse>> {
    let memories = state
        .service
        .retrieve(&conversation_id, &request.query, request.k, request.token_budget)
        .await?;
    let context = format_context(&memories);
    Ok(Json(RetrieveResponse { memories, context }))
}

#[derive(Debug, Deserialize, Default)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RecentResponse {
    pub turns: Vec<MemoryRecord>,
}

pub async fn recent_handler(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Query(query): Query<RecentQuery>,
) -> ApiResult<Json<RecentResponse>> {
    let limit = query.limit.unwrap_or(state.recent_turns_limit);
    let turns = state.service.recent_turns(&conversation_id, limit).await?;
    Ok(Json(RecentResponse { turns }))
}

pub async fn memory_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<MemoryRecord>> {
    state
        .service
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError(EngramError::NotFound(format!("memory {id}"))))
}

pub async fn stats_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<ServiceStats>> {
    Ok(Json(state.service.stats().await?))
}
