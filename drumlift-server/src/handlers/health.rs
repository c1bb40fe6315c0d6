use crate::state::AppState;
use axum::{Json, extract::State};
use chrono::Utc;
use serde_json::{Value, json};

pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "active_tasks": state.registry.active_count().await,
    }))
}

pub async fn ping_handler() -> &'static str {
    "pong"
}
