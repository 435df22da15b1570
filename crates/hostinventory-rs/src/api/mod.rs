use std::{collections::BTreeSet, time::Duration};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch},
    Json, Router,
};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::{
    error::PersistenceError,
    orchestrator::ToolSelection,
    reconcile::FindingUpdate,
    security::{in_scope, is_valid_target},
    AppState,
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tools/status", get(tools_status))
        .route("/api/scans", get(list_scans).post(create_scan))
        .route("/api/scans/:id", get(get_scan))
        .route("/api/assets", get(list_assets))
        .route("/api/assets/:id", get(get_asset))
        .route("/api/assets/:id/findings", patch(update_finding))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "service": "hostinventory-rs"}))
}

pub async fn tools_status(State(state): State<AppState>) -> Response {
    Json(state.service.get_scan_tools_status().await).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScanRequest {
    target: String,
    #[serde(default)]
    tools: Option<ToolSelection>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    labels: BTreeSet<String>,
}

pub async fn create_scan(
    State(state): State<AppState>,
    Json(payload): Json<CreateScanRequest>,
) -> Response {
    let target = payload.target.trim();
    if !is_valid_target(target) {
        return (StatusCode::BAD_REQUEST, "invalid target").into_response();
    }
    if !in_scope(target, &state.config.scope_allowlist) {
        return (StatusCode::FORBIDDEN, "target out of scope").into_response();
    }

    let request = state.service.request(
        target,
        payload.tools,
        payload.timeout_secs.map(|s| Duration::from_secs(s.max(1))),
        payload.labels,
    );
    let outcome = state.service.scan_and_reconcile(&request).await;
    Json(outcome).into_response()
}

pub async fn list_scans(State(state): State<AppState>) -> Response {
    match state.service.scan_history().await {
        Ok(items) => Json(items).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn get_scan(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.service.scan_by_id(&id).await {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "scan not found").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn list_assets(State(state): State<AppState>) -> Response {
    match state.service.list_assets().await {
        Ok(items) => Json(items).into_response(),
        Err(e) => persistence_error(e),
    }
}

pub async fn get_asset(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.service.get_asset(&id).await {
        Ok(Some(asset)) => Json(asset).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "asset not found").into_response(),
        Err(e) => persistence_error(e),
    }
}

pub async fn update_finding(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<FindingUpdate>,
) -> Response {
    match state.service.update_finding_status(&id, &update).await {
        Ok(asset) => Json(asset).into_response(),
        Err(e) => persistence_error(e),
    }
}

fn persistence_error(e: PersistenceError) -> Response {
    match e {
        PersistenceError::NotFound(_) | PersistenceError::FindingNotFound { .. } => {
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
        other => {
            warn!(error = %other, "asset store request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{
        adapters::fake::{Behaviour, FakeAdapter, THREE_PORTS},
        config::AppConfig,
        models::ToolId,
        reconcile::MemoryAssetStore,
        service::InventoryService,
    };

    fn app() -> Router {
        let config = Arc::new(AppConfig {
            output_dir: None,
            ..AppConfig::default()
        });
        let service = InventoryService::new(config.clone(), Arc::new(MemoryAssetStore::default()))
            .with_adapters(vec![FakeAdapter::shared(
                ToolId::Nmap,
                Behaviour::Output(THREE_PORTS),
            )]);
        router(AppState {
            service: Arc::new(service),
            config,
        })
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn health_answers() {
        let resp = app()
            .oneshot(Request::get("/api/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn out_of_scope_target_is_forbidden() {
        let resp = app()
            .oneshot(json_request(
                Method::POST,
                "/api/scans",
                serde_json::json!({"target": "8.8.8.8"}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn option_like_target_is_rejected() {
        let resp = app()
            .oneshot(json_request(
                Method::POST,
                "/api/scans",
                serde_json::json!({"target": "-oN/tmp/x"}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn scan_creates_asset_then_lists_it() {
        let app = app();
        let resp = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/scans",
                serde_json::json!({"target": "127.0.0.1", "labels": ["lab"]}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["report"]["status"], "completed");
        assert_eq!(body["reconciliation"]["action"], "created");
        let asset_id = body["reconciliation"]["asset"]["id"]
            .as_str()
            .expect("asset id")
            .to_string();

        let resp = app
            .clone()
            .oneshot(
                Request::get(format!("/api/assets/{asset_id}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::get("/api/assets").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let assets = body_json(resp).await;
        assert_eq!(assets.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn unknown_asset_and_finding_are_not_found() {
        let app = app();
        let resp = app
            .clone()
            .oneshot(Request::get("/api/assets/nope").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(json_request(
                Method::PATCH,
                "/api/assets/nope/findings",
                serde_json::json!({"name": "x", "type": "vulnerability", "status": "fixed"}),
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn scan_history_is_empty_without_artifacts() {
        let resp = app()
            .oneshot(Request::get("/api/scans").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!([]));
    }
}
