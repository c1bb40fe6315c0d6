//! HTTP and WebSocket request handlers.

pub mod download;
pub mod health;
pub mod process;
pub mod status;
pub mod tasks;
pub mod upload;
