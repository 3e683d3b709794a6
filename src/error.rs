//! Error types for plan construction and rendering.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised while building or rendering a calls query.
///
/// Every variant is fatal for the request that produced it; nothing here is
/// retried by the compiler.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("Field {0} is not allowed")]
    UnknownField(String),
    #[error("Direction {0} is not allowed")]
    InvalidSortDirection(String),
    #[error("Limit can only be set once")]
    LimitAlreadySet,
    #[error("Limit must be a positive integer, got {0}")]
    NegativeLimit(i64),
    #[error("Offset can only be set once")]
    OffsetAlreadySet,
    #[error("Offset must be a positive integer, got {0}")]
    NegativeOffset(i64),
    #[error("Empty {0} operation")]
    EmptyBooleanOperation(&'static str),
    #[error("Unsupported operand: {0}")]
    UnsupportedOperand(String),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Dynamic field {0} cannot be selected with a sub-path, not implemented")]
    DynamicFieldSelection(String),
    #[error("Missing select columns")]
    MissingSelectFields,
}

/// Result type for compiler operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Top-level error for callers that load configuration, compile and execute.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] serde_json::Error),
    /// Raised by the executor when a compiled query's result exceeds its size
    /// budget. The compiler itself never produces this variant.
    #[error("Request too large: {0}")]
    RequestTooLarge(String),
}
