//! Router assembly.

use crate::handlers::{
    download::{download_drum_handler, download_midi_handler},
    health::{health_handler, ping_handler},
    process::process_ws_handler,
    status::status_handler,
    tasks::delete_task_handler,
    upload::upload_handler,
};
use crate::state::AppState;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    routing::{delete, get, post},
};
use tower_http::{
    cors::{Any, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

pub fn create_router(state: AppState) -> Router {
    // Leave slack above the configured payload ceiling for the
    // multipart framing itself.
    let body_limit = state.config.max_upload_bytes + 1024 * 1024;

    Router::new()
        .route("/ping", get(ping_handler))
        .route("/health", get(health_handler))
        .route("/upload", post(upload_handler))
        .route("/ws/process/{task_id}", get(process_ws_handler))
        .route("/status/{task_id}", get(status_handler))
        .route("/download/midi/{task_id}", get(download_midi_handler))
        .route("/download/drum/{task_id}", get(download_drum_handler))
        .route("/task/{task_id}", delete(delete_task_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors_layer(&state.config.cors_allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| {
            match HeaderValue::from_str(o) {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("ignoring malformed CORS origin {o:?}");
                    None
                }
            }
        }))
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
}
