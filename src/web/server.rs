use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::WebConfig;

use super::api::{compact_table, get_status, get_table, get_table_rows, health_check, AppState};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/tables/:schema/:name", get(get_table))
        .route("/tables/:schema/:name/rows", get(get_table_rows))
        .route("/tables/:schema/:name/compact", post(compact_table))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API until `shutdown` is cancelled.
pub async fn run_server(
    web_config: WebConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(&web_config.listen).await?;
    tracing::info!("Admin API listening on {}", web_config.listen);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            tracing::info!("Admin API shutting down");
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddl::TargetDdl;
    use crate::event::{Row, TableId, Value};
    use crate::pipeline::StatusBoard;
    use crate::schema::{ColumnSchema, SchemaRegistry, TableSchema, TargetType};
    use crate::sequencer::VersionStamp;
    use crate::storage::{DuckDbStore, TargetStore};
    use crate::transform::{RowKind, TargetRowOperation};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn orders() -> TableSchema {
        TableSchema {
            table: TableId::new("shop", "orders"),
            columns: vec![
                ColumnSchema::new("id", TargetType::BigInt, false),
                ColumnSchema::new("total", TargetType::Double, true),
            ],
            primary_key: vec!["id".to_string()],
        }
    }

    fn upsert(id: i64, total: f64, version: u64) -> TargetRowOperation {
        let mut values = Row::new();
        values.insert("id", id);
        values.insert("total", Value::Float(total));
        TargetRowOperation {
            table: TableId::new("shop", "orders"),
            kind: RowKind::Upsert,
            values,
            version: VersionStamp(version),
            deleted: false,
            ticket: version,
        }
    }

    async fn state_with_orders() -> AppState {
        let store = Arc::new(DuckDbStore::in_memory().unwrap());
        store.init_schema().await.unwrap();
        let schema = orders();
        store
            .execute_ddl(&TargetDdl::CreateSchema("shop".to_string()))
            .await
            .unwrap();
        store
            .execute_ddl(&TargetDdl::CreateTable(schema.clone()))
            .await
            .unwrap();
        store
            .execute_bulk_write(&schema, &[upsert(1, 10.0, 1), upsert(1, 12.5, 2)])
            .await
            .unwrap();

        let registry = Arc::new(SchemaRegistry::new());
        registry.replace(schema);
        AppState {
            board: Arc::new(StatusBoard::new(Uuid::new_v4(), registry)),
            store,
        }
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_status_reports_pipeline_state() {
        let app = build_router(state_with_orders().await);
        let (status, body) = send(app, "GET", "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "initializing");
    }

    #[tokio::test]
    async fn test_table_detail_and_merged_rows() {
        let state = state_with_orders().await;

        let (status, body) = send(build_router(state.clone()), "GET", "/tables/shop/orders").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stored_versions"], 2);
        assert_eq!(body["schema"]["primary_key"][0], "id");

        let (status, body) = send(build_router(state), "GET", "/tables/shop/orders/rows").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["total"], 12.5);
    }

    #[tokio::test]
    async fn test_compact_removes_superseded_versions() {
        let state = state_with_orders().await;
        let (status, body) =
            send(build_router(state.clone()), "POST", "/tables/shop/orders/compact").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed_versions"], 1);
        assert_eq!(
            state
                .store
                .count_versions(&TableId::new("shop", "orders"))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_table_is_not_found() {
        let app = build_router(state_with_orders().await);
        let (status, body) = send(app, "GET", "/tables/shop/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("shop.missing"));
    }
}
