//! # txtrack
//!
//! Transaction lifecycle tracking for wallet-driven applications.
//!
//! This crate provides:
//! - An adapter turning a provider's push notifications into an event stream
//!   and a single-outcome result stream
//! - Transaction registration that keeps a shared store in sync with the
//!   provider and evicts records after a TTL
//! - A normalized transaction store with persistence and startup pruning
//! - A guarded state machine for wallet/provider connection status

#![warn(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]
#![allow(missing_docs)] // Internal implementation details

mod channel;
mod config;
mod connection;
mod error;
mod persistence;
mod registration;
mod store;
mod task;
mod types;

pub mod telemetry;
pub mod test_utils;

pub use channel::{
    EventStream, Listener, ResultStream, Subscription, TransactionHandle, TxEvent, TxResult,
};
pub use config::TrackerConfig;
pub use connection::{
    select_rule, transition, ConnectionAction, ConnectionContext, ConnectionMachine,
    ConnectionState, Guard, Rule, Target, Trigger, RULES,
};
pub use error::{Error, ErrorContext, Result, SerializedError};
pub use persistence::{JsonFileStorage, MemoryStorage, StorageBackend};
pub use registration::{RegisterOptions, Registered, TxTracker};
pub use store::{NewTx, StoreChange, StoreSnapshot, StoreStatistics, TxRecord, TxState, TxStore};
pub use task::{spawn_supervised, BackgroundTasks};
pub use types::{EventLog, ProviderError, ProviderEvent, ProviderReceipt, TxHash, TxReceipt, Wait};
