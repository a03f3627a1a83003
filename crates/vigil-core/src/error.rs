//! Unified error types for Vigil

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all Vigil operations
#[derive(Error, Debug)]
pub enum VigilError {
    // Tool output errors
    #[error("Parsing error in {tool}: {message}")]
    Parsing { tool: String, message: String },

    #[error(
        "Extraction invariant violated: {failed_hooks:?} reported failure but no issues were extracted"
    )]
    ExtractionInvariantViolation { failed_hooks: Vec<String> },

    // Timeouts
    #[error("Agent batch exceeded iteration timeout of {timeout_secs}s")]
    AgentTimeout { timeout_secs: u64 },

    #[error("Hook {hook} timed out after {timeout_secs}s")]
    HookTimeout { hook: String, timeout_secs: u64 },

    // Process errors
    #[error("Unrecoverable tool failure in {hook}: {message}")]
    UnrecoverableToolFailure { hook: String, message: String },

    // Agent errors
    #[error("Agent subsystem unavailable: {0}")]
    AgentUnavailable(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Path validation failed: {0}")]
    PathValidation(String),

    // Control flow
    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Coarse error class reported in halt diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    ParsingError,
    ExtractionInvariantViolation,
    AgentTimeout,
    HookTimeout,
    UnrecoverableToolFailure,
    AgentUnavailable,
    AgentError,
    Cancelled,
    ConfigError,
    IoError,
    Internal,
}

impl ErrorClass {
    /// Stable identifier used in reports and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParsingError => "parsing-error",
            Self::ExtractionInvariantViolation => "extraction-invariant-violation",
            Self::AgentTimeout => "agent-timeout",
            Self::HookTimeout => "hook-timeout",
            Self::UnrecoverableToolFailure => "unrecoverable-tool-failure",
            Self::AgentUnavailable => "agent-unavailable",
            Self::AgentError => "agent-error",
            Self::Cancelled => "cancelled",
            Self::ConfigError => "config-error",
            Self::IoError => "io-error",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl VigilError {
    /// Classify this error for halt reporting
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Parsing { .. } => ErrorClass::ParsingError,
            Self::ExtractionInvariantViolation { .. } => ErrorClass::ExtractionInvariantViolation,
            Self::AgentTimeout { .. } => ErrorClass::AgentTimeout,
            Self::HookTimeout { .. } => ErrorClass::HookTimeout,
            Self::UnrecoverableToolFailure { .. } => ErrorClass::UnrecoverableToolFailure,
            Self::AgentUnavailable(_) => ErrorClass::AgentUnavailable,
            Self::Agent(_) | Self::PathValidation(_) => ErrorClass::AgentError,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::Config(_) => ErrorClass::ConfigError,
            Self::Io(_) => ErrorClass::IoError,
            Self::Serialization(_) | Self::Other(_) => ErrorClass::Internal,
        }
    }
}

/// Result type alias using VigilError
pub type Result<T> = std::result::Result<T, VigilError>;
