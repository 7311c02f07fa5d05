use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use easel_engine::{MaskRecord, MaskRelay, MemoryMaskRelay, RelayError};
use serde_json::{json, Value};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let bind = env::var("EASEL_RELAY_BIND").unwrap_or_else(|_| "127.0.0.1:8077".to_string());
    let addr: SocketAddr = bind.parse()?;

    let relay = Arc::new(MemoryMaskRelay::new());
    let app = Router::new()
        .route("/upload_mask", post(upload_mask))
        .route("/get_mask/:mask_id", get(get_mask))
        .route("/send_mask_id", post(send_mask_id))
        .route("/get_pending_mask/:user_id", get(get_pending_mask))
        .route("/health", get(health))
        .with_state(relay);

    println!("easel-relay listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn upload_mask(
    State(relay): State<Arc<MemoryMaskRelay>>,
    Json(record): Json<MaskRecord>,
) -> (StatusCode, Json<Value>) {
    match relay.upload_mask(record) {
        Ok(mask_id) => (
            StatusCode::OK,
            Json(json!({ "mask_id": mask_id, "status": "ok" })),
        ),
        Err(err) => relay_failure(err),
    }
}

async fn get_mask(
    State(relay): State<Arc<MemoryMaskRelay>>,
    Path(mask_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match relay.fetch_mask(&mask_id) {
        Ok(record) => match serde_json::to_value(&record) {
            Ok(payload) => (StatusCode::OK, Json(payload)),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            ),
        },
        Err(err) => relay_failure(err),
    }
}

async fn send_mask_id(
    State(relay): State<Arc<MemoryMaskRelay>>,
    Json(payload): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let user_id = payload.get("user_id").and_then(Value::as_u64);
    let mask_id = payload.get("mask_id").and_then(Value::as_str);
    let (Some(user_id), Some(mask_id)) = (user_id, mask_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "user_id and mask_id are required" })),
        );
    };
    match relay.register_pending(user_id, mask_id) {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(err) => relay_failure(err),
    }
}

async fn get_pending_mask(
    State(relay): State<Arc<MemoryMaskRelay>>,
    Path(user_id): Path<u64>,
) -> (StatusCode, Json<Value>) {
    match relay.fetch_pending(user_id) {
        Ok(mask_id) => (StatusCode::OK, Json(json!({ "mask_id": mask_id }))),
        Err(err) => relay_failure(err),
    }
}

async fn health(State(relay): State<Arc<MemoryMaskRelay>>) -> (StatusCode, Json<Value>) {
    match relay.health() {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({ "status": report.status, "masks_count": report.masks_count })),
        ),
        Err(err) => relay_failure(err),
    }
}

fn relay_failure(err: RelayError) -> (StatusCode, Json<Value>) {
    let status = match err {
        RelayError::NotFound | RelayError::NoPending => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() })))
}
