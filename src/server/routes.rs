//! HTTP surface. The engine contract leaks into exactly one place here:
//! `POST /users` appends to the log before the index accepts the update,
//! and an append failure is 503 with the index untouched.

use crate::server::AppState;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

#[derive(Debug, Serialize, Deserialize)]
pub struct User {
    pub id: i32,
    pub name: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/users", post(create_user).get(list_users))
        .route("/users/:id", get(get_user))
        .route("/admin/compact", post(compact))
        .route("/health", get(health))
        .with_state(state)
}

async fn create_user(State(state): State<AppState>, body: Bytes) -> Response {
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Invalid JSON"})),
            )
                .into_response();
        }
    };
    let user: User = match serde_json::from_value(value) {
        Ok(u) => u,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Missing or invalid fields"})),
            )
                .into_response();
        }
    };

    let stored = serde_json::to_vec(&user).expect("user record serializes");

    // Holding the write lock across append + save keeps the log and the
    // index in step around a compaction cut.
    let mut index = state.index.write().await;
    if let Err(e) = state.persistence.append(user.id, &stored).await {
        error!(key = user.id, error = %e, "append failed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "Disk full"})),
        )
            .into_response();
    }
    index.save(user.id, &stored);
    drop(index);

    json_bytes(StatusCode::OK, stored)
}

async fn get_user(State(state): State<AppState>, Path(id): Path<i32>) -> Response {
    let index = state.index.read().await;
    match index.get(id) {
        Some(record) => json_bytes(StatusCode::OK, record.to_vec()),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "User not found"})),
        )
            .into_response(),
    }
}

async fn list_users(State(state): State<AppState>) -> Response {
    let index = state.index.read().await;
    // Stored records are canonical JSON objects; join them in place.
    let mut body = Vec::with_capacity(2 + index.len() * 32);
    body.push(b'[');
    for (i, (_, record)) in index.iter().enumerate() {
        if i > 0 {
            body.push(b',');
        }
        body.extend_from_slice(record);
    }
    body.push(b']');
    json_bytes(StatusCode::OK, body)
}

async fn compact(State(state): State<AppState>) -> Response {
    // Respond immediately; the rewrite proceeds in the background.
    let persistence = state.persistence.clone();
    tokio::spawn(async move {
        let _ = persistence.compact().await;
    });
    (
        StatusCode::OK,
        Json(json!({"result": "compaction_started", "async": true})),
    )
        .into_response()
}

async fn health() -> Response {
    json_bytes(StatusCode::OK, br#"{"ok":1}"#.to_vec())
}

fn json_bytes(status: StatusCode, bytes: Vec<u8>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        bytes,
    )
        .into_response()
}
