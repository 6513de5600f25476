use std::path::Path;
use tracing::info;

use super::StreamerConfig;
use crate::error::{AppError, Result};

/// Load streamer configuration from a JSON file
///
/// Missing keys take their defaults; a missing file is an error so that a typo
/// in `--config` is not silently ignored.
pub async fn load_config(path: &Path) -> Result<StreamerConfig> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        AppError::Config(format!("Failed to read config {}: {}", path.display(), e))
    })?;
    let config: StreamerConfig = serde_json::from_str(&text)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Load configuration if a path was given, otherwise use defaults
pub async fn load_or_default(path: Option<&Path>) -> Result<StreamerConfig> {
    match path {
        Some(p) => load_config(p).await,
        None => Ok(StreamerConfig::default()),
    }
}
