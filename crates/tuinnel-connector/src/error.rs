//! Connector-layer errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("failed to create the connector token file: {0}")]
    SecretFile(std::io::Error),

    #[error("failed to spawn cloudflared: {0}")]
    Spawn(std::io::Error),

    #[error("cloudflared release metadata was malformed: {0}")]
    ReleaseMetadata(String),

    #[error("no release asset named {0}")]
    AssetMissing(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}
