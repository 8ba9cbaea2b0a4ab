use crate::event::{Row, TableId};
use crate::pipeline::{PipelineStatus, StatusBoard, TableStatus};
use crate::schema::TableSchema;
use crate::storage::DuckDbStore;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

/// Shared state for the admin API.
#[derive(Clone)]
pub struct AppState {
    pub board: Arc<StatusBoard>,
    pub store: Arc<DuckDbStore>,
}

#[derive(Debug, Serialize)]
pub struct TableDetail {
    pub schema: TableSchema,
    pub fingerprint: String,
    pub status: Option<TableStatus>,
    /// Stored row versions, including superseded ones and tombstones.
    pub stored_versions: u64,
}

#[derive(Debug, Serialize)]
pub struct CompactResponse {
    pub table: TableId,
    pub removed_versions: usize,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Response {
    let status = state.board.state();
    let body = Json(serde_json::json!({ "state": status }));
    if status == crate::pipeline::PipelineState::Faulted {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    } else {
        (StatusCode::OK, body).into_response()
    }
}

/// GET /status
pub async fn get_status(State(state): State<AppState>) -> Json<PipelineStatus> {
    Json(state.board.snapshot())
}

/// GET /tables/:schema/:name
pub async fn get_table(
    State(state): State<AppState>,
    Path((schema, name)): Path<(String, String)>,
) -> Result<Json<TableDetail>, ApiError> {
    let table = TableId::new(schema, name);
    let definition = registered(&state, &table)?;
    let stored_versions = state
        .store
        .count_versions(&table)
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;

    Ok(Json(TableDetail {
        fingerprint: definition.fingerprint(),
        schema: definition.as_ref().clone(),
        status: state.board.snapshot().table(&table).cloned(),
        stored_versions,
    }))
}

/// GET /tables/:schema/:name/rows
pub async fn get_table_rows(
    State(state): State<AppState>,
    Path((schema, name)): Path<(String, String)>,
) -> Result<Json<Vec<Row>>, ApiError> {
    let table = TableId::new(schema, name);
    let definition = registered(&state, &table)?;
    let rows = state
        .store
        .read_merged(&definition)
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(Json(rows))
}

/// POST /tables/:schema/:name/compact
pub async fn compact_table(
    State(state): State<AppState>,
    Path((schema, name)): Path<(String, String)>,
) -> Result<Json<CompactResponse>, ApiError> {
    let table = TableId::new(schema, name);
    let definition = registered(&state, &table)?;
    let removed_versions = state
        .store
        .compact(&definition)
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;

    tracing::info!(table = %table, removed = removed_versions, "Compacted table");
    Ok(Json(CompactResponse {
        table,
        removed_versions,
    }))
}

fn registered(state: &AppState, table: &TableId) -> Result<Arc<TableSchema>, ApiError> {
    state
        .board
        .registry()
        .get(table)
        .ok_or_else(|| ApiError::NotFound(format!("table {} is not registered", table)))
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
