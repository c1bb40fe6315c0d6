//! HTTP and WebSocket surface of the Drumlift drum-extraction service.
//!
//! Thin layer over `drumlift-core`: multipart upload, per-task progress
//! WebSocket, status polling, artifact download and task deletion.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use routes::create_router;
pub use state::AppState;
