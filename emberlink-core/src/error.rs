//! Error types for emberlink-core

use thiserror::Error;

/// Main error type for the emberlink-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Obfuscation rule set rejected during validation
    #[error("invalid obfuscation rule set: {0}")]
    InvalidRuleSet(String),

    /// Feature not registered with the pipeline
    #[error("unknown feature: {0}")]
    UnknownFeature(String),

    /// Transport/collector error
    #[error("collector error: {0}")]
    Collector(String),
}

/// Result type alias for emberlink-core
pub type Result<T> = std::result::Result<T, Error>;
