//! Transaction channel adapter
//!
//! Turns the push-based notifications of a [`TransactionHandle`] into two
//! pull-based streams: an [`EventStream`] carrying every lifecycle event and a
//! [`ResultStream`] carrying the single outcome the caller waits for.
//!
//! Each stream holds its own provider subscription, so dropping one (e.g. a
//! cancelled caller dropping the result stream) never affects the other.

use crate::error::SerializedError;
use crate::types::{ProviderEvent, ProviderReceipt, TxHash, TxReceipt, Wait};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

/// Callback registered on a transaction handle
pub type Listener = Arc<dyn Fn(ProviderEvent) + Send + Sync>;

/// Guard for a provider subscription.
///
/// Releasing is idempotent; dropping the guard releases it.
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Create a subscription released by `release`
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Release the subscription now
    pub fn unsubscribe(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    /// Whether the subscription is still active
    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// A submitted, not yet final transaction.
///
/// Every subscriber receives its own copy of each notification: first the
/// hash, then zero or more receipts/confirmations, then exactly one of
/// `Completed` or `Error`.
pub trait TransactionHandle: Send + Sync {
    /// Register `listener` for all further notifications
    fn subscribe(&self, listener: Listener) -> Subscription;
}

/// Lifecycle event produced by the event stream
#[derive(Debug, Clone, PartialEq)]
pub enum TxEvent {
    HashKnown {
        tx_hash: TxHash,
    },
    Confirmation {
        tx_hash: TxHash,
        number: u64,
        receipt: TxReceipt,
    },
    Error {
        tx_hash: Option<TxHash>,
        error: SerializedError,
    },
}

/// Message produced by the result stream
#[derive(Debug, Clone, PartialEq)]
pub enum TxResult {
    /// Hash known, still waiting for confirmations
    Pending { tx_hash: TxHash },

    /// Wait condition met
    Fulfilled { tx_hash: TxHash },

    /// The transaction failed
    Rejected {
        tx_hash: Option<TxHash>,
        error: SerializedError,
    },
}

impl TxResult {
    /// Hash carried by this message, if any
    pub fn tx_hash(&self) -> Option<&TxHash> {
        match self {
            TxResult::Pending { tx_hash } | TxResult::Fulfilled { tx_hash } => Some(tx_hash),
            TxResult::Rejected { tx_hash, .. } => tx_hash.as_ref(),
        }
    }

    /// Whether this message ends the stream
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxResult::Pending { .. })
    }
}

/// Normalized step derived from raw provider notifications
#[derive(Debug, Clone)]
enum Signal {
    HashKnown(TxHash),
    Confirmation {
        tx_hash: TxHash,
        number: u64,
        receipt: ProviderReceipt,
    },
    /// The wait condition was met
    Reached(TxHash),
    Failed {
        tx_hash: Option<TxHash>,
        error: SerializedError,
    },
    Completed,
}

/// Per-subscription view of a transaction's progress.
///
/// Filters duplicates, guarantees the hash is announced before anything that
/// references it, and reports the wait condition exactly once.
struct Progress {
    wait: Wait,
    tx_hash: Arc<OnceLock<TxHash>>,
    latest_receipt: Option<ProviderReceipt>,
    highest_confirmation: Option<u64>,
    reached: bool,
    closed: bool,
}

impl Progress {
    fn new(wait: Wait, tx_hash: Arc<OnceLock<TxHash>>) -> Self {
        Self {
            wait,
            tx_hash,
            latest_receipt: None,
            highest_confirmation: None,
            reached: false,
            closed: false,
        }
    }

    fn known_hash(&self) -> Option<TxHash> {
        self.tx_hash.get().cloned()
    }

    fn apply(&mut self, event: ProviderEvent) -> Vec<Signal> {
        let mut out = Vec::new();
        if self.closed {
            return out;
        }

        match event {
            ProviderEvent::TransactionHash(tx_hash) => self.learn_hash(tx_hash, true, &mut out),
            ProviderEvent::Receipt(receipt) => self.observe(0, receipt, &mut out),
            ProviderEvent::Confirmation { number, receipt } => {
                self.observe(number, receipt, &mut out)
            }
            ProviderEvent::Completed => {
                if !self.reached {
                    match (self.wait.threshold(), self.latest_receipt.clone()) {
                        (Some(threshold), Some(receipt)) => {
                            self.synthesize(threshold, receipt, &mut out);
                            self.reach(&mut out);
                        }
                        _ => out.push(Signal::Failed {
                            tx_hash: self.known_hash(),
                            error: SerializedError::dropped(),
                        }),
                    }
                }
                out.push(Signal::Completed);
                self.closed = true;
            }
            ProviderEvent::Error(error) => {
                // A failed transaction never satisfies the wait condition.
                if let Some(receipt) = &error.receipt {
                    self.learn_hash(receipt.transaction_hash.clone(), false, &mut out);
                }
                out.push(Signal::Failed {
                    tx_hash: self.known_hash(),
                    error: error.to_serialized(),
                });
                self.closed = true;
            }
        }

        out
    }

    fn learn_hash(&mut self, tx_hash: TxHash, may_reach: bool, out: &mut Vec<Signal>) {
        if self.tx_hash.set(tx_hash.clone()).is_err() {
            return;
        }
        out.push(Signal::HashKnown(tx_hash));
        if may_reach && self.wait == Wait::Hash {
            self.reach(out);
        }
    }

    fn observe(&mut self, number: u64, receipt: ProviderReceipt, out: &mut Vec<Signal>) {
        self.learn_hash(receipt.transaction_hash.clone(), true, out);
        self.latest_receipt = Some(receipt.clone());

        if self.highest_confirmation.map_or(true, |highest| number > highest) {
            self.emit_confirmation(number, receipt, out);
        }

        if let Some(threshold) = self.wait.threshold() {
            if number >= threshold {
                self.reach(out);
            }
        }
    }

    /// Emit the threshold confirmation the provider never sent
    fn synthesize(&mut self, threshold: u64, receipt: ProviderReceipt, out: &mut Vec<Signal>) {
        if self.highest_confirmation.map_or(true, |highest| highest < threshold) {
            debug!(threshold, "Synthesizing confirmation at threshold");
            self.emit_confirmation(threshold, receipt, out);
        }
    }

    fn emit_confirmation(&mut self, number: u64, receipt: ProviderReceipt, out: &mut Vec<Signal>) {
        let Some(tx_hash) = self.known_hash() else {
            return;
        };
        self.highest_confirmation = Some(number);
        out.push(Signal::Confirmation {
            tx_hash,
            number,
            receipt,
        });
    }

    fn reach(&mut self, out: &mut Vec<Signal>) {
        if self.reached {
            return;
        }
        if let Some(tx_hash) = self.known_hash() {
            self.reached = true;
            out.push(Signal::Reached(tx_hash));
        }
    }
}

/// Stream of every lifecycle event of one transaction
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<TxEvent>,
    subscription: Subscription,
    tx_hash: Arc<OnceLock<TxHash>>,
}

impl EventStream {
    /// Subscribe to `tx`.
    ///
    /// `wait` only decides where a missing threshold confirmation is
    /// synthesized; events keep flowing until the handle completes or errors.
    pub fn open<H>(tx: &H, wait: Wait) -> Self
    where
        H: TransactionHandle + ?Sized,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let tx_hash = Arc::new(OnceLock::new());
        let state = Mutex::new((Progress::new(wait, tx_hash.clone()), Some(sender)));

        let listener: Listener = Arc::new(move |event: ProviderEvent| {
            let mut guard = state.lock();
            let (progress, sender) = &mut *guard;
            let Some(open_sender) = sender.as_ref() else {
                trace!("Ignoring provider event on a finished event stream");
                return;
            };

            for signal in progress.apply(event) {
                let event = match signal {
                    Signal::HashKnown(tx_hash) => TxEvent::HashKnown { tx_hash },
                    Signal::Confirmation {
                        tx_hash,
                        number,
                        receipt,
                    } => TxEvent::Confirmation {
                        tx_hash,
                        number,
                        receipt: TxReceipt::from(&receipt),
                    },
                    Signal::Failed { tx_hash, error } => TxEvent::Error { tx_hash, error },
                    Signal::Reached(_) | Signal::Completed => continue,
                };
                if open_sender.send(event).is_err() {
                    break;
                }
            }

            // Dropping the sender ends the stream once buffered events are read.
            if progress.closed {
                *sender = None;
            }
        });

        let subscription = tx.subscribe(listener);
        Self {
            receiver,
            subscription,
            tx_hash,
        }
    }

    /// Next event, or `None` once the stream has terminated
    pub async fn next(&mut self) -> Option<TxEvent> {
        match self.receiver.recv().await {
            Some(event) => {
                if matches!(event, TxEvent::Error { .. }) {
                    self.subscription.unsubscribe();
                }
                Some(event)
            }
            None => {
                self.subscription.unsubscribe();
                None
            }
        }
    }

    /// Hash of the transaction, once known
    pub fn tx_hash(&self) -> Option<&TxHash> {
        self.tx_hash.get()
    }
}

struct ResultState {
    progress: Progress,
    queue: VecDeque<TxResult>,
    /// The caller took the terminal message
    finished: bool,
    /// The handle dropped our listener
    detached: bool,
}

impl ResultState {
    fn push(&mut self, message: TxResult) {
        match message {
            TxResult::Rejected { .. } => {
                // A failure seen before the caller took the success replaces it.
                if let Some(position) = self
                    .queue
                    .iter()
                    .position(|queued| matches!(queued, TxResult::Fulfilled { .. }))
                {
                    warn!(
                        tx_hash = ?message.tx_hash(),
                        "Failure superseded an outcome the caller had not consumed yet"
                    );
                    self.queue.truncate(position);
                }
                if !self.queue.iter().any(TxResult::is_terminal) {
                    self.queue.push_back(message);
                }
            }
            _ => self.queue.push_back(message),
        }
    }
}

struct ResultShared {
    state: Mutex<ResultState>,
    ready: Notify,
}

/// Owned by the listener; marks the stream detached when the handle drops it.
struct DetachGuard(Arc<ResultShared>);

impl Drop for DetachGuard {
    fn drop(&mut self) {
        self.0.state.lock().detached = true;
        self.0.ready.notify_one();
    }
}

/// Stream carrying the single outcome of one transaction
pub struct ResultStream {
    shared: Arc<ResultShared>,
    subscription: Subscription,
    tx_hash: Arc<OnceLock<TxHash>>,
}

impl ResultStream {
    /// Subscribe to `tx` and resolve according to `wait`
    pub fn open<H>(tx: &H, wait: Wait) -> Self
    where
        H: TransactionHandle + ?Sized,
    {
        let tx_hash = Arc::new(OnceLock::new());
        let shared = Arc::new(ResultShared {
            state: Mutex::new(ResultState {
                progress: Progress::new(wait, tx_hash.clone()),
                queue: VecDeque::new(),
                finished: false,
                detached: false,
            }),
            ready: Notify::new(),
        });

        let guard = DetachGuard(shared.clone());
        let listener: Listener = Arc::new(move |event: ProviderEvent| {
            let shared = &guard.0;
            let mut state = shared.state.lock();
            if state.finished {
                trace!("Ignoring provider event on a finished result stream");
                return;
            }

            for signal in state.progress.apply(event) {
                match signal {
                    Signal::HashKnown(tx_hash) if wait != Wait::Hash => {
                        state.push(TxResult::Pending { tx_hash })
                    }
                    Signal::Reached(tx_hash) => state.push(TxResult::Fulfilled { tx_hash }),
                    Signal::Failed { tx_hash, error } => {
                        state.push(TxResult::Rejected { tx_hash, error })
                    }
                    _ => {}
                }
            }

            drop(state);
            shared.ready.notify_one();
        });

        let subscription = tx.subscribe(listener);
        Self {
            shared,
            subscription,
            tx_hash,
        }
    }

    /// Next message, or `None` after the terminal one was delivered.
    ///
    /// A handle that goes away without a terminal notification yields a
    /// `Rejected` message carrying a dropped-transaction error.
    pub async fn next(&mut self) -> Option<TxResult> {
        loop {
            let message = {
                let mut state = self.shared.state.lock();
                if state.finished {
                    return None;
                }
                match state.queue.pop_front() {
                    Some(message) => {
                        state.finished = message.is_terminal();
                        Some(message)
                    }
                    None if state.detached => {
                        state.finished = true;
                        let tx_hash = self.tx_hash.get().cloned();
                        warn!(
                            tx_hash = ?tx_hash,
                            "Transaction handle went away without a terminal notification"
                        );
                        Some(TxResult::Rejected {
                            tx_hash,
                            error: SerializedError::dropped(),
                        })
                    }
                    None => None,
                }
            };

            match message {
                Some(message) => {
                    // Lock released first: releasing drops the listener, which locks the state.
                    if message.is_terminal() {
                        self.subscription.unsubscribe();
                    }
                    return Some(message);
                }
                None => self.shared.ready.notified().await,
            }
        }
    }

    /// Hash of the transaction, once known
    pub fn tx_hash(&self) -> Option<&TxHash> {
        self.tx_hash.get()
    }
}
