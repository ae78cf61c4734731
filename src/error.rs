//! Error types for the decision orchestrator

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Agent Call Errors
    // =============================

    #[error("Agent error: {0}")]
    AgentError(String),

    #[error("Agent output failed schema validation: {0}")]
    SchemaError(String),

    #[error("Agent call timed out after {0} ms")]
    Timeout(u64),

    #[error("LLM error: {0}")]
    LlmError(String),

    // =============================
    // Pipeline Errors
    // =============================

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    /// Cold start with no usable catalog and no viable neutral default.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Context source error: {0}")]
    SourceError(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Mirror error: {0}")]
    MirrorError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
