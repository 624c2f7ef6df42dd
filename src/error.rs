//! Error types for transaction tracking

use crate::types::TxHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Name given to errors raised when the user aborts an action
pub const CANCELLATION_ERROR_NAME: &str = "CancellationError";

/// Provider error code for "user rejected the request"
pub const USER_REJECTED_CODE: i64 = 4001;

/// Name given to the error synthesized when a handle goes away without a receipt
pub const DROPPED_ERROR_NAME: &str = "TransactionDropped";

/// Plain-data projection of a provider error, safe to persist or transmit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedError {
    /// Error kind, e.g. `Error` or `CancellationError`
    pub name: String,

    /// Human readable message
    pub message: String,

    /// Provider specific code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,

    /// Extra plain JSON payload attached by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl SerializedError {
    /// Create a serialized error with the generic `Error` name
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_string(),
            message: message.into(),
            code: None,
            data: None,
        }
    }

    /// Override the error name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attach a provider code
    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    /// Project any error into plain data.
    ///
    /// The source chain is flattened into the message so no reference to the
    /// original error object survives.
    pub fn from_error(name: impl Into<String>, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::new(message).with_name(name)
    }

    /// The error synthesized when a handle completes before producing a receipt
    pub fn dropped() -> Self {
        Self::new("transaction handle completed before a receipt was available")
            .with_name(DROPPED_ERROR_NAME)
    }

    /// Whether this error signals a user-initiated abort
    pub fn is_cancellation(&self) -> bool {
        self.name == CANCELLATION_ERROR_NAME || self.code == Some(USER_REJECTED_CODE)
    }
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({}): {}", self.name, code, self.message),
            None => write!(f, "{}: {}", self.name, self.message),
        }
    }
}

impl std::error::Error for SerializedError {}

/// Context attached to errors raised by the tracker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Hash of the transaction, when it became known
    pub tx_hash: Option<TxHash>,
}

/// Tracker error type
#[derive(Error, Debug)]
pub enum Error {
    /// The handle failed before any hash was known
    #[error("Transaction submission failed: {error}")]
    Submission { error: SerializedError },

    /// The transaction got a hash but failed afterwards
    #[error("Transaction {tx_hash} failed: {error}")]
    MinedButFailed {
        tx_hash: TxHash,
        error: SerializedError,
    },

    /// The user aborted the transaction
    #[error("Transaction cancelled: {error}")]
    Cancelled {
        tx_hash: Option<TxHash>,
        error: SerializedError,
    },

    /// The handle completed without producing a receipt
    #[error("Transaction dropped: {error}")]
    Dropped {
        tx_hash: Option<TxHash>,
        error: SerializedError,
    },

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Snapshot (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {message}")]
    Internal {
        tx_hash: Option<TxHash>,
        message: String,
    },
}

impl Error {
    /// Classify a rejection coming out of the result stream
    pub fn from_rejection(tx_hash: Option<TxHash>, error: SerializedError) -> Self {
        if error.is_cancellation() {
            return Error::Cancelled { tx_hash, error };
        }
        if error.name == DROPPED_ERROR_NAME {
            return Error::Dropped { tx_hash, error };
        }
        match tx_hash {
            Some(tx_hash) => Error::MinedButFailed { tx_hash, error },
            None => Error::Submission { error },
        }
    }

    /// Build an internal error, annotated with `tx_hash` when known
    pub fn internal(tx_hash: Option<TxHash>, message: impl Into<String>) -> Self {
        Error::Internal {
            tx_hash,
            message: message.into(),
        }
    }

    /// Context of the failing transaction
    pub fn context(&self) -> ErrorContext {
        let tx_hash = match self {
            Error::MinedButFailed { tx_hash, .. } => Some(tx_hash.clone()),
            Error::Cancelled { tx_hash, .. }
            | Error::Dropped { tx_hash, .. }
            | Error::Internal { tx_hash, .. } => tx_hash.clone(),
            _ => None,
        };
        ErrorContext { tx_hash }
    }

    /// Hash of the failing transaction, when known
    pub fn tx_hash(&self) -> Option<TxHash> {
        self.context().tx_hash
    }

    /// The serialized provider error behind a transaction failure
    pub fn serialized(&self) -> Option<&SerializedError> {
        match self {
            Error::Submission { error }
            | Error::MinedButFailed { error, .. }
            | Error::Cancelled { error, .. }
            | Error::Dropped { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Whether this error is a user-initiated abort that displays should skip
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("connection reset")]
    struct Reset;

    #[derive(Debug, Error)]
    #[error("request failed")]
    struct Outer(#[source] Reset);

    #[test]
    fn test_from_error_flattens_sources() {
        let err = SerializedError::from_error("RpcError", &Outer(Reset));
        assert_eq!(err.name, "RpcError");
        assert_eq!(err.message, "request failed: connection reset");
        assert!(err.code.is_none());
    }

    #[test]
    fn test_rejection_classification() {
        let hash = TxHash::from("0xabc");

        let err = Error::from_rejection(None, SerializedError::new("nonce too low"));
        assert!(matches!(err, Error::Submission { .. }));
        assert_eq!(err.tx_hash(), None);

        let err = Error::from_rejection(Some(hash.clone()), SerializedError::new("reverted"));
        assert!(matches!(err, Error::MinedButFailed { .. }));
        assert_eq!(err.context().tx_hash, Some(hash.clone()));

        let err = Error::from_rejection(
            Some(hash.clone()),
            SerializedError::new("User denied transaction signature").with_code(USER_REJECTED_CODE),
        );
        assert!(err.is_cancellation());
        assert_eq!(err.tx_hash(), Some(hash));

        let err = Error::from_rejection(None, SerializedError::dropped());
        assert!(matches!(err, Error::Dropped { .. }));
    }

    #[test]
    fn test_internal_error_context() {
        let err = Error::internal(Some(TxHash::from("0xabc")), "stream closed");
        assert_eq!(err.tx_hash(), Some(TxHash::from("0xabc")));
        assert!(err.serialized().is_none());
        assert!(!err.is_cancellation());
        assert!(Error::internal(None, "stream closed").tx_hash().is_none());
    }

    #[test]
    fn test_serialized_error_json_shape() {
        let err = SerializedError::new("boom").with_code(-32000);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["name"], "Error");
        assert_eq!(json["code"], -32000);
        assert!(json.get("data").is_none());

        let back: SerializedError = serde_json::from_value(serde_json::json!({
            "name": "Error",
            "message": "boom",
        }))
        .unwrap();
        assert_eq!(back.code, None);
    }
}
