//! Unified error types for tcproxy

use thiserror::Error;

/// Unified error type for all tcproxy operations
#[derive(Error, Debug)]
pub enum TcProxyError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Claim errors
    #[error("Claim lost: {0}")]
    ClaimLost(String),

    #[error("Claim invalid: {0}")]
    ClaimInvalid(String),

    // Credential errors
    #[error("Credentials unavailable: {0}")]
    CredentialsUnavailable(String),

    #[error("Signing error: {0}")]
    Signing(String),

    // Queue errors
    #[error("Queue error: {0}")]
    Queue(String),

    // Proxy errors
    #[error("Proxy error: {0}")]
    Proxy(String),

    // Artifact contract
    #[error("Artifact validation failed: {0}")]
    ArtifactValidation(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias using TcProxyError
pub type Result<T> = std::result::Result<T, TcProxyError>;
