use thiserror::Error;

use crate::persistence::DatabaseError;

pub type Result<T> = std::result::Result<T, BlotterError>;

/// Top level error returned by the ledger and the materializer
#[derive(Debug, Error)]
pub enum BlotterError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Trade already exists: {trade_id}")]
    AlreadyExists { trade_id: String },

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] DatabaseError),

    #[error("Batch partially failed: {count} item(s) failed: {}", failed.join(", "))]
    PartialBatchFailure { failed: Vec<String>, count: usize },

    #[error("Reference data lookup failed for {ticker}: {reason}")]
    Enrichment { ticker: String, reason: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Position arithmetic overflow in {0}")]
    Overflow(String),
}

impl BlotterError {
    pub fn trade_not_found(trade_id: impl Into<String>) -> Self {
        BlotterError::NotFound {
            kind: "Trade",
            id: trade_id.into(),
        }
    }

    pub fn position_not_found(book: &str, ticker: &str) -> Self {
        BlotterError::NotFound {
            kind: "Position",
            id: format!("{}:{}", book, ticker),
        }
    }

    /// True when the caller can correct its input and retry
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            BlotterError::NotFound { .. }
                | BlotterError::AlreadyExists { .. }
                | BlotterError::Validation(_)
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid number for {field}: '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Invalid date for {field}: '{value}' (expected YYYY-MM-DD)")]
    InvalidDate { field: &'static str, value: String },

    #[error("Invalid side: '{0}'")]
    InvalidSide(String),

    #[error("Invalid status: '{0}'")]
    InvalidStatus(String),

    #[error("Quantity must be non-negative, got {0}")]
    NegativeQuantity(String),

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },

    #[error("{field} must not contain ':', got '{value}'")]
    ReservedCharacter { field: &'static str, value: String },

    #[error("Wrong column count: expected {expected}, found {found}")]
    ColumnCount { expected: usize, found: usize },

    #[error("Invalid header: expected '{expected}', found '{found}'")]
    InvalidHeader { expected: String, found: String },

    #[error("Trade {0} is already closed")]
    AlreadyClosed(String),

    #[error("error at line {line}: {reason} ({valid_rows} row(s) valid before it)")]
    Row {
        line: usize,
        valid_rows: usize,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_error_mentions_line() {
        let err = BlotterError::from(ValidationError::Row {
            line: 3,
            valid_rows: 2,
            reason: "Invalid number for Price: 'abc'".to_string(),
        });
        assert!(err.to_string().contains("error at line 3"));
        assert!(err.is_caller_error());
    }

    #[test]
    fn test_partial_batch_failure_lists_ids() {
        let err = BlotterError::PartialBatchFailure {
            failed: vec!["t-1".to_string(), "t-9".to_string()],
            count: 2,
        };
        let message = err.to_string();
        assert!(message.contains("2 item(s)"));
        assert!(message.contains("t-1, t-9"));
        assert!(!err.is_caller_error());
    }

    #[test]
    fn test_not_found_helpers() {
        assert_eq!(
            BlotterError::trade_not_found("abc").to_string(),
            "Trade not found: abc"
        );
        assert_eq!(
            BlotterError::position_not_found("EQ", "AAPL").to_string(),
            "Position not found: EQ:AAPL"
        );
    }
}
