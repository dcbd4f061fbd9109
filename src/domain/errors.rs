use std::fmt;
use thiserror::Error;

use crate::domain::entities::exchange::Exchange;

/// Errors raised when constructing value objects and entities
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Invalid risk index: {0}")]
    InvalidIndex(String),

    #[error("Value must be non-negative")]
    MustBeNonNegative,

    #[error("Value must be finite")]
    MustBeFinite,
}

impl From<ValidationError> for String {
    fn from(error: ValidationError) -> Self {
        error.to_string()
    }
}

/// Errors surfaced by position and ledger storage backends
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Failed to decode stored record: {0}")]
    Decode(String),
}

/// One exchange's failure inside a fan-out (placement or close)
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeFailure {
    pub exchange: Exchange,
    pub credential_id: String,
    pub reason: String,
}

impl fmt::Display for ExchangeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]: {}", self.exchange, self.credential_id, self.reason)
    }
}

fn join_failures(failures: &[ExchangeFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error taxonomy of the position lifecycle engine
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Policy or gate failure; the signal is dropped
    #[error("Signal rejected: {reason}")]
    ValidationRejected { reason: String },

    #[error("Insufficient balance: required {required:.2}, available {available:.2}")]
    InsufficientBalance { required: f64, available: f64 },

    #[error("Invalid price: {price}")]
    InvalidPrice { price: f64 },

    /// Every exchange placement failed; nothing was persisted
    #[error("Execution failed on every exchange: {}", join_failures(.failures))]
    ExecutionFailed { failures: Vec<ExchangeFailure> },

    /// Some placements failed; the position was persisted with the successful receipts
    #[error("Partial execution for position {position_id}: {}", join_failures(.failures))]
    PartialExecutionFailed {
        position_id: String,
        failures: Vec<ExchangeFailure>,
    },

    #[error("Price unavailable for {symbol}: {reason}")]
    PriceUnavailable { symbol: String, reason: String },

    /// Exchange-side close exhausted its retries; the local close stands
    #[error(
        "Exchange close failed for position {position_id} on {exchange} after {attempts} attempts: {reason}"
    )]
    SettlementExchangeError {
        position_id: String,
        exchange: Exchange,
        attempts: u32,
        reason: String,
    },

    #[error("Risk index unavailable: {reason}")]
    IndexUnavailable { reason: String },

    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout {
        operation: String,
        elapsed_ms: u64,
        persisted_position: Option<String>,
    },

    #[error("Position {position_id} is already closed")]
    AlreadyClosed { position_id: String },

    #[error("Position not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl EngineError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        EngineError::ValidationRejected {
            reason: reason.into(),
        }
    }

    /// Get the severity level of this error
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            EngineError::ValidationRejected { .. } => ErrorSeverity::Minor,
            EngineError::AlreadyClosed { .. } => ErrorSeverity::Minor,
            EngineError::PriceUnavailable { .. } => ErrorSeverity::Minor,
            EngineError::InsufficientBalance { .. } => ErrorSeverity::Moderate,
            EngineError::InvalidPrice { .. } => ErrorSeverity::Moderate,
            EngineError::IndexUnavailable { .. } => ErrorSeverity::Moderate,
            EngineError::NotFound(_) => ErrorSeverity::Moderate,
            EngineError::PartialExecutionFailed { .. } => ErrorSeverity::Moderate,
            EngineError::Timeout { .. } => ErrorSeverity::Moderate,
            EngineError::ExecutionFailed { .. } => ErrorSeverity::Critical,
            EngineError::SettlementExchangeError { .. } => ErrorSeverity::Critical,
            EngineError::Storage(_) => ErrorSeverity::Critical,
        }
    }

    /// Check if this error is transient (a later attempt might succeed)
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::PriceUnavailable { .. } => true,
            EngineError::IndexUnavailable { .. } => true,
            EngineError::SettlementExchangeError { .. } => true,
            EngineError::Timeout { .. } => true,
            EngineError::Storage(_) => true,

            // Terminal for the signal or position they concern
            EngineError::ValidationRejected { .. } => false,
            EngineError::InsufficientBalance { .. } => false,
            EngineError::InvalidPrice { .. } => false,
            EngineError::ExecutionFailed { .. } => false,
            EngineError::PartialExecutionFailed { .. } => false,
            EngineError::AlreadyClosed { .. } => false,
            EngineError::NotFound(_) => false,
        }
    }

    /// Get a short error code for logging/monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::ValidationRejected { .. } => "ERR_VALIDATION_REJECTED",
            EngineError::InsufficientBalance { .. } => "ERR_INSUFFICIENT_BALANCE",
            EngineError::InvalidPrice { .. } => "ERR_INVALID_PRICE",
            EngineError::ExecutionFailed { .. } => "ERR_EXECUTION_FAILED",
            EngineError::PartialExecutionFailed { .. } => "ERR_PARTIAL_EXECUTION",
            EngineError::PriceUnavailable { .. } => "ERR_PRICE_UNAVAILABLE",
            EngineError::SettlementExchangeError { .. } => "ERR_SETTLEMENT_EXCHANGE",
            EngineError::IndexUnavailable { .. } => "ERR_INDEX_UNAVAILABLE",
            EngineError::Timeout { .. } => "ERR_TIMEOUT",
            EngineError::AlreadyClosed { .. } => "ERR_ALREADY_CLOSED",
            EngineError::NotFound(_) => "ERR_NOT_FOUND",
            EngineError::Storage(_) => "ERR_STORAGE",
        }
    }
}

/// Severity levels for engine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Expected during normal operation
    Minor,
    /// Indicates a problem with a single signal or position
    Moderate,
    /// Requires operator attention
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Minor => write!(f, "Minor"),
            ErrorSeverity::Moderate => write!(f, "Moderate"),
            ErrorSeverity::Critical => write!(f, "Critical"),
        }
    }
}
