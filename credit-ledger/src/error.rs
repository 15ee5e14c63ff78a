//! Error types for the ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input (zero amount, empty description, bad rate, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Debit would drive the balance negative
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Amount the debit asked for
        required: i64,
        /// Balance actually available
        available: i64,
    },

    /// Capture or webhook references an order we never issued
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// Payment not found
    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    /// Commission not found
    #[error("Commission not found: {0}")]
    CommissionNotFound(String),

    /// Payment state machine rejected the transition
    #[error("Invalid payment transition: {0}")]
    InvalidTransition(String),

    /// Transient storage conflict, retried internally a bounded number of times
    #[error("Storage conflict: {0}")]
    Conflict(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        use rocksdb::ErrorKind;
        match err.kind() {
            ErrorKind::Busy | ErrorKind::TryAgain | ErrorKind::TimedOut => {
                Error::Conflict(err.to_string())
            }
            _ => Error::Storage(err.to_string()),
        }
    }
}

impl Error {
    /// Whether the operation may succeed if re-run as a whole
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_balance_message() {
        let err = Error::InsufficientBalance {
            required: 50,
            available: 0,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient balance: required 50, available 0"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn test_conflict_is_transient() {
        assert!(Error::Conflict("busy".to_string()).is_transient());
        assert!(!Error::Storage("corrupt".to_string()).is_transient());
    }
}
