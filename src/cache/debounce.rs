//! Keyed debouncing: run an action once per key after a quiet period.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

struct Pending {
    id: u64,
    cancel: CancellationToken,
}

/// Coalesces bursts of requests per key into one delayed action.
///
/// Each `schedule` call cancels the pending action for the same key, so the
/// action only fires `delay` after the most recent call.
#[derive(Clone, Default)]
pub struct Debouncer {
    pending: Arc<DashMap<String, Pending>>,
    next_id: Arc<AtomicU64>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` for `key`, replacing anything already pending for it.
    pub fn schedule<F>(&self, key: &str, delay: Duration, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        if let Some(previous) = self.pending.insert(
            key.to_owned(),
            Pending {
                id,
                cancel: cancel.clone(),
            },
        ) {
            previous.cancel.cancel();
            trace!(key, "debounce window extended");
        }

        let pending = self.pending.clone();
        let key = key.to_owned();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // A newer schedule may have replaced us between the timer firing and here.
                    if pending.remove_if(&key, |_, p| p.id == id).is_some() {
                        trace!(key, "debounced action firing");
                        action();
                    }
                }
            }
        });
    }

    /// Drop the pending action for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &str) -> bool {
        match self.pending.remove(key) {
            Some((_, p)) => {
                p.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        self.pending.retain(|_, p| {
            p.cancel.cancel();
            false
        });
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }
}
