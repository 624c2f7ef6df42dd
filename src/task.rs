//! Supervised background tasks
//!
//! Fire-and-forget work (event draining, TTL eviction, persistence) runs
//! detached from the caller. Panics are caught and logged instead of being
//! lost with the join handle.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::error;

/// Spawn `future` detached, logging a panic instead of propagating it
pub fn spawn_supervised<F>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(future).catch_unwind().await {
            error!(
                task = name,
                panic = %panic_message(panic.as_ref()),
                "Background task panicked"
            );
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[derive(Default)]
struct Inflight {
    count: AtomicUsize,
    idle: Notify,
}

struct InflightGuard(Arc<Inflight>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Set of detached tasks that can be counted and awaited as a whole.
///
/// Tasks are never cancelled through this set.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    inflight: Arc<Inflight>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a supervised task tracked by this set
    pub fn spawn<F>(&self, name: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inflight.count.fetch_add(1, Ordering::AcqRel);
        let guard = InflightGuard(self.inflight.clone());
        spawn_supervised(name, async move {
            let _guard = guard;
            future.await;
        })
    }

    /// Number of tasks still running
    pub fn len(&self) -> usize {
        self.inflight.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every tracked task has finished
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inflight.idle.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_panic_is_contained() {
        let handle = spawn_supervised("panicking", async {
            panic!("boom");
        });
        // The wrapper swallows the panic, so the join succeeds.
        assert!(handle.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("short", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        tasks.spawn("long", async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        tasks.spawn("panicking", async {
            panic!("boom");
        });
        assert_eq!(tasks.len(), 3);

        tasks.wait_idle().await;
        assert!(tasks.is_empty());
    }
}
