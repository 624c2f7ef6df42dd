//! Shared transaction types
//!
//! Hashes, receipts as delivered by a provider, and the trimmed receipt
//! projection kept in the store.

use crate::error::SerializedError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Transaction hash as reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    /// Create a hash from its string form
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Borrow the hash string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TxHash {
    fn from(hash: &str) -> Self {
        Self(hash.to_string())
    }
}

impl From<String> for TxHash {
    fn from(hash: String) -> Self {
        Self(hash)
    }
}

/// One decoded event log inside a provider receipt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLog {
    /// Emitting contract
    #[serde(default)]
    pub address: Option<String>,

    /// Decoded arguments, keyed both by position (`"0"`, `"1"`) and by name
    #[serde(default)]
    pub return_values: BTreeMap<String, serde_json::Value>,
}

/// Receipt as delivered by the provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderReceipt {
    pub transaction_hash: TxHash,
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    pub transaction_index: u64,
    pub block_hash: String,
    pub block_number: u64,
    #[serde(default)]
    pub gas_used: Option<u64>,
    #[serde(default)]
    pub status: Option<bool>,
    #[serde(default)]
    pub events: BTreeMap<String, EventLog>,
}

/// Receipt projection kept in the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    pub transaction_index: u64,
    pub block_hash: String,
    pub block_number: u64,
    /// Event name -> named (non-positional) return values
    #[serde(default)]
    pub events: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl From<&ProviderReceipt> for TxReceipt {
    fn from(receipt: &ProviderReceipt) -> Self {
        let events = receipt
            .events
            .iter()
            .map(|(name, log)| {
                let named = log
                    .return_values
                    .iter()
                    .filter(|(key, _)| key.parse::<u64>().is_err())
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                (name.clone(), named)
            })
            .collect();

        Self {
            from: receipt.from.clone(),
            to: receipt.to.clone(),
            transaction_index: receipt.transaction_index,
            block_hash: receipt.block_hash.clone(),
            block_number: receipt.block_number,
            events,
        }
    }
}

/// Error reported by a transaction handle
#[derive(Debug, Clone)]
pub struct ProviderError {
    /// Error kind reported by the provider
    pub name: String,

    /// Error message
    pub message: String,

    /// Provider specific code (e.g. 4001 for a user rejection)
    pub code: Option<i64>,

    /// Plain JSON payload
    pub data: Option<serde_json::Value>,

    /// Receipt of a mined but reverted transaction
    pub receipt: Option<ProviderReceipt>,

    /// Underlying error object, never persisted
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ProviderError {
    /// Create a provider error with the generic `Error` name
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_string(),
            message: message.into(),
            code: None,
            data: None,
            receipt: None,
            source: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_receipt(mut self, receipt: ProviderReceipt) -> Self {
        self.receipt = Some(receipt);
        self
    }

    pub fn with_source(mut self, source: Arc<dyn std::error::Error + Send + Sync>) -> Self {
        self.source = Some(source);
        self
    }

    /// Strip everything that cannot be persisted
    pub fn to_serialized(&self) -> SerializedError {
        let mut message = self.message.clone();
        if let Some(source) = &self.source {
            let cause = SerializedError::from_error(self.name.clone(), source.as_ref());
            message.push_str(": ");
            message.push_str(&cause.message);
        }
        SerializedError {
            name: self.name.clone(),
            message,
            code: self.code,
            data: self.data.clone(),
        }
    }
}

/// Notification pushed by a transaction handle to each of its subscribers
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// The transaction hash became known
    TransactionHash(TxHash),

    /// The transaction was included in a block
    Receipt(ProviderReceipt),

    /// A further block was built on top of the containing block
    Confirmation {
        number: u64,
        receipt: ProviderReceipt,
    },

    /// The handle stopped tracking the transaction
    Completed,

    /// The transaction failed
    Error(ProviderError),
}

/// How long `register_tx` waits before resolving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wait {
    /// Resolve as soon as the hash is known
    #[default]
    Hash,

    /// Resolve once the given number of confirmations is reached (0 = first receipt)
    Confirmations(u64),
}

impl Wait {
    /// Confirmation count needed to resolve, if any
    pub fn threshold(&self) -> Option<u64> {
        match self {
            Wait::Hash => None,
            Wait::Confirmations(n) => Some(*n),
        }
    }
}
