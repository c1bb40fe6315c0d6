//! Server-side configuration.

use std::path::PathBuf;

/// Settings for the HTTP surface; pipeline knobs live in
/// [`drumlift_core::config::PipelineConfig`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub cors_allowed_origins: Vec<String>,
    pub max_upload_bytes: usize,
    /// Accepted upload extensions, lowercase, with leading dot.
    pub allowed_extensions: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            data_dir: PathBuf::from("/tmp/drumlift"),
            cors_allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
            ],
            max_upload_bytes: 100 * 1024 * 1024,
            allowed_extensions: vec![
                ".wav".to_string(),
                ".mp3".to_string(),
                ".m4a".to_string(),
                ".flac".to_string(),
            ],
        }
    }
}

impl ServerConfig {
    /// Whether `ext` (lowercase, leading dot) is an accepted upload type.
    pub fn allows_extension(&self, ext: &str) -> bool {
        self.allowed_extensions.iter().any(|e| e == ext)
    }
}
