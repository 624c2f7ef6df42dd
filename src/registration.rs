//! Transaction registration
//!
//! [`TxTracker::register_tx`] is the single entry point features use to hand
//! over a submitted transaction. It keeps the store in sync with the
//! provider and evicts the record once its TTL elapses, independent of
//! whether the caller is still around.

use crate::channel::{EventStream, ResultStream, TransactionHandle, TxEvent, TxResult};
use crate::config::TrackerConfig;
use crate::store::{NewTx, TxStore};
use crate::task::BackgroundTasks;
use crate::types::{TxHash, Wait};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Options for [`TxTracker::register_tx`]
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterOptions {
    /// When to resolve
    pub wait: Wait,

    /// Time the record stays in the store after its hash is known
    pub ttl: Duration,

    /// Fields merged into the record at creation
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            wait: Wait::Hash,
            ttl: Duration::from_millis(30_000),
            metadata: Default::default(),
        }
    }
}

impl RegisterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(mut self, wait: Wait) -> Self {
        self.wait = wait;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub tx_hash: TxHash,
}

/// Drives submitted transactions into the shared store
pub struct TxTracker {
    store: Arc<TxStore>,

    config: TrackerConfig,

    /// Event drains and TTL timers still running
    tasks: BackgroundTasks,
}

impl TxTracker {
    /// Create a tracker writing into `store`
    pub fn new(store: Arc<TxStore>, config: TrackerConfig) -> Self {
        Self {
            store,
            config,
            tasks: BackgroundTasks::new(),
        }
    }

    /// Create a tracker over a store built from `config`
    pub async fn from_config(config: TrackerConfig) -> Result<Self> {
        let store = TxStore::from_config(&config).await?;
        Ok(Self::new(store, config))
    }

    pub fn store(&self) -> &Arc<TxStore> {
        &self.store
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Options using the configured default TTL
    pub fn options(&self) -> RegisterOptions {
        RegisterOptions::new().ttl(self.config.default_ttl())
    }

    /// Number of background tasks still running
    pub fn background_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Wait until every event drain and TTL timer has finished
    pub async fn wait_idle(&self) {
        self.tasks.wait_idle().await
    }

    /// Track `tx` until the wait condition in `options` is met.
    ///
    /// Dropping the returned future releases the result subscription only;
    /// the store keeps following the transaction and the record still
    /// expires.
    pub async fn register_tx<H>(&self, tx: &H, options: RegisterOptions) -> Result<Registered>
    where
        H: TransactionHandle + ?Sized,
    {
        let RegisterOptions {
            wait,
            ttl,
            metadata,
        } = options;

        // Event stream first so the store hears about the hash no later than we do.
        let events = EventStream::open(tx, wait);
        let mut results = ResultStream::open(tx, wait);
        self.spawn_event_drain(events, metadata, ttl);

        while let Some(message) = results.next().await {
            match message {
                TxResult::Pending { tx_hash } => {
                    debug!(tx_hash = %tx_hash, wait = ?wait, "Transaction pending");
                }
                TxResult::Fulfilled { tx_hash } => {
                    info!(tx_hash = %tx_hash, wait = ?wait, "Transaction registered");
                    return Ok(Registered { tx_hash });
                }
                TxResult::Rejected { tx_hash, error } => {
                    let err = Error::from_rejection(tx_hash, error);
                    if err.is_cancellation() {
                        info!(tx_hash = ?err.tx_hash(), "Transaction cancelled by user");
                    } else {
                        warn!(tx_hash = ?err.tx_hash(), error = %err, "Transaction rejected");
                    }
                    return Err(err);
                }
            }
        }

        Err(Error::internal(
            results.tx_hash().cloned(),
            "result stream closed without an outcome",
        ))
    }

    /// Apply every event of `events` to the store, detached from the caller.
    ///
    /// The record gets its expiration as soon as it is added.
    fn spawn_event_drain(
        &self,
        mut events: EventStream,
        metadata: serde_json::Map<String, serde_json::Value>,
        ttl: Duration,
    ) {
        let store = self.store.clone();
        let tasks = self.tasks.clone();
        self.tasks.spawn("tx-event-drain", async move {
            while let Some(event) = events.next().await {
                match event {
                    TxEvent::HashKnown { tx_hash } => {
                        store.add(NewTx {
                            tx_hash: tx_hash.clone(),
                            metadata: metadata.clone(),
                        });
                        schedule_expiry(&store, &tasks, tx_hash, ttl);
                    }
                    TxEvent::Confirmation {
                        tx_hash,
                        number,
                        receipt,
                    } => {
                        store.confirm(&tx_hash, number, receipt);
                    }
                    TxEvent::Error {
                        tx_hash: Some(tx_hash),
                        error,
                    } => {
                        store.set_error(&tx_hash, error);
                    }
                    TxEvent::Error {
                        tx_hash: None,
                        error,
                    } => {
                        debug!(error = %error, "Submission failed before a hash was known");
                    }
                }
            }

            debug!(tx_hash = ?events.tx_hash(), "Event stream drained");
        });
    }
}

/// Stamp the expiration of `tx_hash` and evict the record after `ttl`.
///
/// A `ttl` past the timer's range stamps the far future and never evicts.
fn schedule_expiry(
    store: &Arc<TxStore>,
    tasks: &BackgroundTasks,
    tx_hash: TxHash,
    ttl: Duration,
) {
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    let expires_at = store.now_ms().saturating_add(ttl_ms);
    store.set_expiration(&tx_hash, expires_at);

    let Some(deadline) = tokio::time::Instant::now().checked_add(ttl) else {
        debug!(tx_hash = %tx_hash, "TTL out of timer range, record kept");
        return;
    };

    let store = store.clone();
    tasks.spawn("tx-expiry", async move {
        tokio::time::sleep_until(deadline).await;
        if store.remove(&tx_hash) {
            debug!(tx_hash = %tx_hash, "Transaction record expired");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TxState;
    use crate::test_utils::{receipt, ScriptedHandle};
    use crate::types::ProviderError;
    use tokio::task::JoinHandle;

    fn tracker() -> Arc<TxTracker> {
        Arc::new(TxTracker::new(
            Arc::new(TxStore::default()),
            TrackerConfig::default(),
        ))
    }

    fn spawn_register(
        tracker: &Arc<TxTracker>,
        handle: &ScriptedHandle,
        options: RegisterOptions,
    ) -> JoinHandle<Result<Registered>> {
        let tracker = tracker.clone();
        let handle = handle.clone();
        tokio::spawn(async move { tracker.register_tx(&handle, options).await })
    }

    async fn wait_for_subscribers(handle: &ScriptedHandle, count: usize) {
        while handle.subscriber_count() < count {
            tokio::task::yield_now().await;
        }
    }

    /// Let detached tasks process what is already queued
    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_wait_resolves_on_receipt() {
        let tracker = tracker();
        let handle = ScriptedHandle::new();
        let task = spawn_register(
            &tracker,
            &handle,
            RegisterOptions::new().wait(Wait::Confirmations(0)),
        );
        wait_for_subscribers(&handle, 2).await;

        handle.emit_hash("H1");
        // no explicit confirmation #0
        handle.emit_receipt(receipt("H1", 12));

        let registered = task.await.unwrap().unwrap();
        assert_eq!(registered.tx_hash, TxHash::from("H1"));

        settle().await;
        let record = tracker.store().select_by_id(&TxHash::from("H1")).unwrap();
        assert_eq!(record.tx_state, TxState::Mined);
        assert_eq!(record.confirmations, 0);
        assert_eq!(record.receipt.unwrap().block_number, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_hash_rejects_with_context() {
        let tracker = tracker();
        let handle = ScriptedHandle::new();
        let task = spawn_register(&tracker, &handle, RegisterOptions::new());
        wait_for_subscribers(&handle, 2).await;

        handle.emit_hash("H2");
        handle.emit_error(ProviderError::new("Insufficient funds"));

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.context().tx_hash, Some(TxHash::from("H2")));
        assert!(matches!(err, Error::MinedButFailed { .. }));
        assert_eq!(err.serialized().unwrap().message, "Insufficient funds");

        settle().await;
        let record = tracker.store().select_by_id(&TxHash::from("H2")).unwrap();
        assert_eq!(record.tx_state, TxState::Failed);
        assert!(record.expires_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_expires_after_ttl() {
        let tracker = tracker();
        let handle = ScriptedHandle::new();
        let task = spawn_register(
            &tracker,
            &handle,
            RegisterOptions::new().ttl(Duration::from_millis(1_000)),
        );
        wait_for_subscribers(&handle, 2).await;

        handle.emit_hash("H3");
        task.await.unwrap().unwrap();
        let hash = TxHash::from("H3");

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(tracker.store().select_by_id(&hash).is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert!(tracker.store().select_by_id(&hash).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_wait() {
        let tracker = tracker();
        let handle = ScriptedHandle::new();
        let mut task = spawn_register(
            &tracker,
            &handle,
            RegisterOptions::new().wait(Wait::Confirmations(2)),
        );
        wait_for_subscribers(&handle, 2).await;

        handle.emit_hash("H4");
        handle.emit_receipt(receipt("H4", 5));
        handle.emit_confirmation(1, receipt("H4", 5));
        settle().await;
        assert!(futures::poll!(&mut task).is_pending());

        handle.emit_confirmation(2, receipt("H4", 5));
        assert_eq!(task.await.unwrap().unwrap().tx_hash, TxHash::from("H4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_error_has_no_record() {
        let tracker = tracker();
        let handle = ScriptedHandle::new();
        let task = spawn_register(&tracker, &handle, RegisterOptions::new());
        wait_for_subscribers(&handle, 2).await;

        handle.emit_error(ProviderError::new("nonce too low"));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Submission { .. }));
        assert_eq!(err.tx_hash(), None);
        settle().await;
        assert!(tracker.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_cancellation() {
        let tracker = tracker();
        let handle = ScriptedHandle::new();
        let task = spawn_register(&tracker, &handle, RegisterOptions::new());
        wait_for_subscribers(&handle, 2).await;

        handle.emit_error(
            ProviderError::new("User denied transaction signature").with_code(4001),
        );

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_caller_keeps_store_in_sync() {
        let tracker = tracker();
        let handle = ScriptedHandle::new();
        let task = spawn_register(
            &tracker,
            &handle,
            RegisterOptions::new()
                .wait(Wait::Confirmations(3))
                .ttl(Duration::from_millis(5_000))
                .metadata("action", "fundDispute"),
        );
        wait_for_subscribers(&handle, 2).await;

        handle.emit_hash("H5");
        settle().await;

        // caller torn down while waiting
        task.abort();
        let _ = task.await;
        assert_eq!(handle.subscriber_count(), 1);

        handle.emit_receipt(receipt("H5", 9));
        handle.emit_confirmation(1, receipt("H5", 9));
        settle().await;

        let record = tracker.store().select_by_id(&TxHash::from("H5")).unwrap();
        assert_eq!(record.tx_state, TxState::Mined);
        assert_eq!(record.confirmations, 1);
        assert_eq!(record.metadata["action"], "fundDispute");
        assert!(record.expires_at.is_some());

        handle.complete();
        tracker.wait_idle().await;
        assert!(tracker.store().select_by_id(&TxHash::from("H5")).is_none());
        assert_eq!(tracker.background_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_expires_when_caller_dropped_before_hash() {
        let tracker = tracker();
        let handle = ScriptedHandle::new();
        let task = spawn_register(
            &tracker,
            &handle,
            RegisterOptions::new().ttl(Duration::from_millis(1_000)),
        );
        wait_for_subscribers(&handle, 2).await;

        task.abort();
        let _ = task.await;

        handle.emit_hash("H6");
        settle().await;
        let record = tracker.store().select_by_id(&TxHash::from("H6")).unwrap();
        assert!(record.expires_at.is_some());

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        settle().await;
        assert!(tracker.store().select_by_id(&TxHash::from("H6")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_keeps_record() {
        let tracker = tracker();
        let handle = ScriptedHandle::new();
        let task = spawn_register(&tracker, &handle, RegisterOptions::new().ttl(Duration::MAX));
        wait_for_subscribers(&handle, 2).await;

        handle.emit_hash("H7");
        assert_eq!(task.await.unwrap().unwrap().tx_hash, TxHash::from("H7"));

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        settle().await;
        let record = tracker.store().select_by_id(&TxHash::from("H7")).unwrap();
        assert_eq!(record.expires_at, Some(u64::MAX));

        handle.complete();
        tracker.wait_idle().await;
        assert!(tracker.store().select_by_id(&TxHash::from("H7")).is_some());
    }

    #[tokio::test]
    async fn test_tracker_from_config() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = TrackerConfig {
            default_ttl_ms: 60_000,
            storage_dir: Some(temp_dir.path().to_path_buf()),
            ..TrackerConfig::default()
        };
        let tracker = TxTracker::from_config(config).await.unwrap();
        let handle = ScriptedHandle::new();

        let registration = tracker.register_tx(&handle, tracker.options());
        tokio::pin!(registration);
        assert!(futures::poll!(&mut registration).is_pending());
        handle.emit_hash("H8");
        let registered = registration.await.unwrap();
        assert_eq!(registered.tx_hash, TxHash::from("H8"));

        while tracker.store().is_empty() {
            tokio::task::yield_now().await;
        }
        handle.complete();
        tracker.store().shutdown().await.unwrap();
        let contents = std::fs::read_to_string(temp_dir.path().join("transactions.json")).unwrap();
        assert!(contents.contains("H8"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_registrations() {
        let tracker = tracker();
        let handles: Vec<ScriptedHandle> = (0..4).map(|_| ScriptedHandle::new()).collect();
        let tasks: Vec<_> = handles
            .iter()
            .map(|handle| spawn_register(&tracker, handle, RegisterOptions::new()))
            .collect();
        for handle in &handles {
            wait_for_subscribers(handle, 2).await;
        }

        for (i, handle) in handles.iter().enumerate() {
            handle.emit_hash(&format!("0x{}", i));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        settle().await;
        assert_eq!(tracker.store().len(), 4);
        assert_eq!(tracker.store().get_statistics().expiring_count, 4);
    }

    #[test]
    fn test_options_use_configured_ttl() {
        let config = TrackerConfig {
            default_ttl_ms: 1_500,
            ..TrackerConfig::default()
        };
        let tracker = TxTracker::new(Arc::new(TxStore::default()), config);
        let options = tracker.options();
        assert_eq!(options.ttl, Duration::from_millis(1_500));
        assert_eq!(options.wait, Wait::Hash);
    }
}
