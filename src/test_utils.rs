//! Test utilities
//!
//! A scriptable in-memory [`TransactionHandle`] so consumers can drive a
//! transaction through its lifecycle deterministically.
//!
//! Only compiled when running tests or when the `test_utils` feature is
//! enabled.

#![cfg(any(test, feature = "test_utils"))]

use crate::channel::{Listener, Subscription, TransactionHandle};
use crate::types::{ProviderError, ProviderEvent, ProviderReceipt, TxHash};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Transaction handle whose notifications are emitted by hand
#[derive(Clone, Default)]
pub struct ScriptedHandle {
    listeners: Arc<Mutex<Vec<(u64, Listener)>>>,
    next_id: Arc<AtomicU64>,
}

impl ScriptedHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every current subscriber
    pub fn emit(&self, event: ProviderEvent) {
        // Snapshot so listeners may unsubscribe while being called.
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event.clone());
        }
    }

    pub fn emit_hash(&self, tx_hash: &str) {
        self.emit(ProviderEvent::TransactionHash(TxHash::from(tx_hash)));
    }

    pub fn emit_receipt(&self, receipt: ProviderReceipt) {
        self.emit(ProviderEvent::Receipt(receipt));
    }

    pub fn emit_confirmation(&self, number: u64, receipt: ProviderReceipt) {
        self.emit(ProviderEvent::Confirmation { number, receipt });
    }

    pub fn emit_error(&self, error: ProviderError) {
        self.emit(ProviderEvent::Error(error));
    }

    pub fn complete(&self) {
        self.emit(ProviderEvent::Completed);
    }

    /// Drop every listener without a terminal notification, as a crashed
    /// provider would
    pub fn forget_listeners(&self) {
        self.listeners.lock().clear();
    }

    /// Number of active subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl TransactionHandle for ScriptedHandle {
    fn subscribe(&self, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, listener));

        let listeners = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.lock().retain(|(existing, _)| *existing != id);
            }
        })
    }
}

/// Build a receipt for `tx_hash` mined in `block_number`
pub fn receipt(tx_hash: &str, block_number: u64) -> ProviderReceipt {
    ProviderReceipt {
        transaction_hash: TxHash::from(tx_hash),
        from: "0x00000000000000000000000000000000000000a1".to_string(),
        to: Some("0x00000000000000000000000000000000000000b2".to_string()),
        transaction_index: 0,
        block_hash: format!("0xblock{}", block_number),
        block_number,
        gas_used: Some(21_000),
        status: Some(true),
        events: Default::default(),
    }
}
