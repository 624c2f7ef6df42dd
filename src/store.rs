//! Transaction store
//!
//! Normalized record set keyed by transaction hash. Every mutation goes
//! through one of the verbs below; verbs targeting a missing record are
//! no-ops, so concurrent producers (event drain, TTL eviction, startup prune)
//! never race into an error.

use crate::config::TrackerConfig;
use crate::error::SerializedError;
use crate::persistence::{JsonFileStorage, MemoryStorage, StorageBackend};
use crate::task::spawn_supervised;
use crate::types::{TxHash, TxReceipt};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// On-chain state of a tracked transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxState {
    /// Hash known, not mined yet
    #[default]
    Sent,

    /// Included in a block
    Mined,

    /// Failed after the hash was known
    Failed,
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxState::Sent => write!(f, "sent"),
            TxState::Mined => write!(f, "mined"),
            TxState::Failed => write!(f, "failed"),
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One tracked transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRecord {
    #[serde(default)]
    pub tx_hash: TxHash,

    #[serde(default, deserialize_with = "null_as_default")]
    pub tx_state: TxState,

    /// Eviction time (Unix milliseconds); set at most once
    #[serde(default)]
    pub expires_at: Option<u64>,

    #[serde(default)]
    pub receipt: Option<TxReceipt>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub confirmations: u64,

    #[serde(default)]
    pub error: Option<SerializedError>,

    /// Caller supplied fields merged at creation
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl TxRecord {
    fn new(tx_hash: TxHash, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            tx_hash,
            tx_state: TxState::Sent,
            expires_at: None,
            receipt: None,
            confirmations: 0,
            error: None,
            metadata,
        }
    }

    pub fn is_expired(&self, date: u64) -> bool {
        self.expires_at.map_or(false, |expires_at| expires_at < date)
    }
}

/// Record fields that caller metadata may not shadow
const RESERVED_FIELDS: &[&str] = &[
    "txHash",
    "txState",
    "expiresAt",
    "receipt",
    "confirmations",
    "error",
];

/// Fields for [`TxStore::add`]
#[derive(Debug, Clone, Default)]
pub struct NewTx {
    pub tx_hash: TxHash,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl NewTx {
    pub fn new(tx_hash: impl Into<TxHash>) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            metadata: Default::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Notification sent after a verb changed the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Added(TxHash),
    Updated(TxHash),
    Removed(TxHash),
    /// Records dropped by `remove_expired`
    Pruned(Vec<TxHash>),
    /// State replaced by `hydrate`
    Hydrated,
}

/// Persisted layout: `{ids: [hash...], entities: {hash: record}}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default, deserialize_with = "null_as_default")]
    pub ids: Vec<TxHash>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub entities: HashMap<TxHash, TxRecord>,
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStatistics {
    pub total_count: usize,
    pub sent_count: usize,
    pub mined_count: usize,
    pub failed_count: usize,
    /// Records with a scheduled eviction
    pub expiring_count: usize,
}

struct Persistence {
    backend: Arc<dyn StorageBackend>,
    key: String,
}

/// Process-wide transaction store.
///
/// Construct once at startup with [`TxStore::from_config`] (or by hand, then
/// call [`TxStore::hydrate`]) and share it by `Arc`. Call
/// [`TxStore::shutdown`] before dropping it; changes still inside the
/// persister's debounce window are otherwise lost.
pub struct TxStore {
    state: RwLock<StoreSnapshot>,

    changes: broadcast::Sender<StoreChange>,

    persistence: Option<Persistence>,

    /// Set once the post-hydration prune ran
    pruned: AtomicBool,

    /// Current time provider (Unix milliseconds)
    current_time_fn: Box<dyn Fn() -> u64 + Send + Sync>,

    /// Running persister task, if any
    persister: Mutex<Option<JoinHandle<()>>>,

    /// Asks the persister to stop
    stop_persister: Arc<Notify>,
}

impl Default for TxStore {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TxStore {
    /// Create an empty, non-persisted store
    pub fn new(change_buffer: usize) -> Self {
        let (changes, _) = broadcast::channel(change_buffer.max(1));
        Self {
            state: RwLock::new(StoreSnapshot::default()),
            changes,
            persistence: None,
            pruned: AtomicBool::new(false),
            current_time_fn: Box::new(|| {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|elapsed| elapsed.as_millis() as u64)
                    .unwrap_or_default()
            }),
            persister: Mutex::new(None),
            stop_persister: Arc::new(Notify::new()),
        }
    }

    /// Build, hydrate and start persisting a store as described by `config`
    pub async fn from_config(config: &TrackerConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let backend: Arc<dyn StorageBackend> = match &config.storage_dir {
            Some(dir) => Arc::new(JsonFileStorage::new(dir.clone())),
            None => Arc::new(MemoryStorage::new()),
        };
        let store = Arc::new(
            Self::new(config.change_buffer).with_persistence(backend, config.storage_key.clone()),
        );

        store.hydrate().await?;
        store.spawn_persister(config.persist_debounce())?;
        Ok(store)
    }

    /// Persist snapshots to `backend` under `key`
    pub fn with_persistence(
        mut self,
        backend: Arc<dyn StorageBackend>,
        key: impl Into<String>,
    ) -> Self {
        self.persistence = Some(Persistence {
            backend,
            key: key.into(),
        });
        self
    }

    /// Set the current time function (for testing)
    pub fn with_time_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        self.current_time_fn = Box::new(f);
        self
    }

    /// Current time in Unix milliseconds, as seen by this store
    pub fn now_ms(&self) -> u64 {
        (self.current_time_fn)()
    }

    /// Receive a notification after every state change
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: StoreChange) {
        // No receivers is fine.
        let _ = self.changes.send(change);
    }

    /// Create or overwrite the record for `fields.tx_hash`.
    ///
    /// Metadata keys naming a record field are dropped.
    pub fn add(&self, fields: NewTx) -> bool {
        let tx_hash = fields.tx_hash.clone();
        let mut metadata = fields.metadata;
        metadata.retain(|key, _| {
            let reserved = RESERVED_FIELDS.contains(&key.as_str());
            if reserved {
                warn!(
                    tx_hash = %tx_hash,
                    key = %key,
                    "Dropping metadata that shadows a record field"
                );
            }
            !reserved
        });
        {
            let mut state = self.state.write();
            if !state.entities.contains_key(&tx_hash) && !state.ids.contains(&tx_hash) {
                state.ids.push(tx_hash.clone());
            }
            state
                .entities
                .insert(tx_hash.clone(), TxRecord::new(fields.tx_hash, metadata));
        }

        debug!(tx_hash = %tx_hash, "Transaction added");
        self.notify(StoreChange::Added(tx_hash));
        true
    }

    /// Remove the record for `tx_hash`
    pub fn remove(&self, tx_hash: &TxHash) -> bool {
        let removed = {
            let mut state = self.state.write();
            let removed = state.entities.remove(tx_hash).is_some();
            state.ids.retain(|id| id != tx_hash);
            removed
        };

        if removed {
            debug!(tx_hash = %tx_hash, "Transaction removed");
            self.notify(StoreChange::Removed(tx_hash.clone()));
        }
        removed
    }

    /// Remove every record with `expires_at < expiration_date`; returns the count
    pub fn remove_expired(&self, expiration_date: u64) -> usize {
        let expired: Vec<TxHash> = {
            let mut state = self.state.write();
            let expired: Vec<TxHash> = state
                .entities
                .values()
                .filter(|record| record.is_expired(expiration_date))
                .map(|record| record.tx_hash.clone())
                .collect();
            for tx_hash in &expired {
                state.entities.remove(tx_hash);
            }
            state.ids.retain(|id| !expired.contains(id));
            expired
        };

        let count = expired.len();
        if count > 0 {
            info!(count, "Removed expired transactions");
            self.notify(StoreChange::Pruned(expired));
        }
        count
    }

    /// Record the eviction time of `tx_hash`; ignored once set
    pub fn set_expiration(&self, tx_hash: &TxHash, expires_at: u64) -> bool {
        let updated = self.update(tx_hash, |record| {
            if record.expires_at.is_some() {
                return false;
            }
            record.expires_at = Some(expires_at);
            true
        });

        if updated {
            debug!(tx_hash = %tx_hash, expires_at, "Expiration set");
        }
        updated
    }

    /// Mark `tx_hash` mined with `number` confirmations
    pub fn confirm(&self, tx_hash: &TxHash, number: u64, receipt: TxReceipt) -> bool {
        let updated = self.update(tx_hash, |record| {
            // A late, lower confirmation never rolls the record back.
            if record.tx_state == TxState::Mined && number < record.confirmations {
                return false;
            }
            record.tx_state = TxState::Mined;
            record.confirmations = number;
            record.receipt = Some(receipt);
            true
        });

        if updated {
            debug!(tx_hash = %tx_hash, confirmations = number, "Transaction confirmed");
        }
        updated
    }

    /// Mark `tx_hash` failed
    pub fn set_error(&self, tx_hash: &TxHash, error: SerializedError) -> bool {
        let message = error.message.clone();
        let updated = self.update(tx_hash, |record| {
            record.tx_state = TxState::Failed;
            record.error = Some(error);
            true
        });

        if updated {
            warn!(tx_hash = %tx_hash, error = %message, "Transaction failed");
        }
        updated
    }

    fn update<F>(&self, tx_hash: &TxHash, f: F) -> bool
    where
        F: FnOnce(&mut TxRecord) -> bool,
    {
        let updated = {
            let mut state = self.state.write();
            match state.entities.get_mut(tx_hash) {
                Some(record) => f(record),
                None => {
                    debug!(tx_hash = %tx_hash, "Ignoring update for unknown transaction");
                    false
                }
            }
        };

        if updated {
            self.notify(StoreChange::Updated(tx_hash.clone()));
        }
        updated
    }

    /// All records in insertion order, skipping dangling ids
    pub fn select_all(&self) -> Vec<TxRecord> {
        let state = self.state.read();
        state
            .ids
            .iter()
            .filter_map(|id| state.entities.get(id))
            .cloned()
            .collect()
    }

    pub fn select_by_id(&self, tx_hash: &TxHash) -> Option<TxRecord> {
        self.state.read().entities.get(tx_hash).cloned()
    }

    /// Records with `expires_at < date`
    pub fn select_expired(&self, date: u64) -> Vec<TxRecord> {
        self.select_all()
            .into_iter()
            .filter(|record| record.is_expired(date))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the persisted layout
    pub fn snapshot(&self) -> StoreSnapshot {
        self.state.read().clone()
    }

    /// Get statistics about tracked transactions
    pub fn get_statistics(&self) -> StoreStatistics {
        let state = self.state.read();
        let mut stats = StoreStatistics::default();

        for record in state.entities.values() {
            match record.tx_state {
                TxState::Sent => stats.sent_count += 1,
                TxState::Mined => stats.mined_count += 1,
                TxState::Failed => stats.failed_count += 1,
            }
            if record.expires_at.is_some() {
                stats.expiring_count += 1;
            }
        }

        stats.total_count = state.entities.len();
        stats
    }

    /// Load the persisted snapshot, then drop records that expired meanwhile.
    ///
    /// The prune runs once per store, however often this is called. Returns
    /// the number of records kept.
    pub async fn hydrate(&self) -> Result<usize> {
        let Some(persistence) = &self.persistence else {
            debug!("No persistence configured, skipping hydration");
            return Ok(0);
        };

        if let Some(contents) = persistence.backend.load(&persistence.key).await? {
            let mut snapshot: StoreSnapshot = serde_json::from_str(&contents)?;
            for (tx_hash, record) in snapshot.entities.iter_mut() {
                if record.tx_hash != *tx_hash {
                    record.tx_hash = tx_hash.clone();
                }
            }
            *self.state.write() = snapshot;
            self.notify(StoreChange::Hydrated);
        }

        if !self.pruned.swap(true, Ordering::AcqRel) {
            self.remove_expired(self.now_ms());
        }

        let count = self.len();
        info!(key = %persistence.key, count, "Transaction store hydrated");
        Ok(count)
    }

    /// Write the current snapshot to the backend
    pub async fn flush(&self) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };

        let contents = serde_json::to_string(&*self.state.read())?;
        persistence.backend.save(&persistence.key, &contents).await?;
        debug!(key = %persistence.key, "Transaction store flushed");
        Ok(())
    }

    /// Flush after every burst of changes, until [`TxStore::shutdown`] or
    /// the store is dropped
    pub fn spawn_persister(self: &Arc<Self>, debounce: Duration) -> Result<()> {
        if self.persistence.is_none() {
            return Err(Error::Storage(
                "cannot start persister without a storage backend".to_string(),
            ));
        }

        let mut persister = self.persister.lock();
        if persister.is_some() {
            return Err(Error::Storage("persister already running".to_string()));
        }

        let mut changes = self.subscribe();
        let stop = self.stop_persister.clone();
        let store: Weak<Self> = Arc::downgrade(self);

        *persister = Some(spawn_supervised("tx-store-persister", async move {
            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = stop.notified() => break,
                }

                tokio::select! {
                    _ = tokio::time::sleep(debounce) => {}
                    _ = stop.notified() => break,
                }
                while let Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) =
                    changes.try_recv()
                {}

                let Some(store) = store.upgrade() else {
                    break;
                };
                if let Err(e) = store.flush().await {
                    error!(error = %e, "Failed to persist transaction store");
                }
            }
            debug!("Transaction store persister stopped");
        }));
        Ok(())
    }

    /// Stop the persister and write the final snapshot
    pub async fn shutdown(&self) -> Result<()> {
        let persister = self.persister.lock().take();
        if let Some(handle) = persister {
            self.stop_persister.notify_one();
            if let Err(e) = handle.await {
                warn!(error = %e, "Transaction store persister ended abnormally");
            }
        }

        self.flush().await?;
        info!(count = self.len(), "Transaction store shut down");
        Ok(())
    }
}
