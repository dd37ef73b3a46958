//! Single-flight request coalescing.
//!
//! Concurrent loads of the same key collapse into one execution: the first
//! caller runs the supplied future, everyone else waits on a watch channel
//! and receives the same result. The record is dropped once the result has
//! been broadcast, so later callers start a fresh flight. Results are never
//! cached here.

use crate::error::{Error, Result};
use crate::types::ByteView;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

type CallResult = std::result::Result<ByteView, Arc<Error>>;

enum Flight {
    Leader(watch::Sender<Option<CallResult>>),
    Waiter(watch::Receiver<Option<CallResult>>),
}

/// De-duplicates concurrent executions per key.
#[derive(Default)]
pub struct FlightGroup {
    calls: Mutex<HashMap<String, watch::Receiver<Option<CallResult>>>>,
}

/// Removes the in-flight record when the executing call finishes or is
/// cancelled, so an aborted flight never wedges its key.
struct FlightGuard<'a> {
    group: &'a FlightGroup,
    key: &'a str,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.group.calls.lock().remove(self.key);
    }
}

impl FlightGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` unless a call for `key` is already in flight, in which case
    /// wait for that call's result instead.
    ///
    /// The future executes without holding the group lock. The executing
    /// caller gets its own result back unchanged; only waiters observe the
    /// executor's error through [`Error::Shared`].
    pub async fn do_call<F, Fut>(&self, key: &str, f: F) -> Result<ByteView>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ByteView>>,
    {
        let flight = {
            let mut calls = self.calls.lock();
            if calls.contains_key(key) {
                Flight::Waiter(calls[key].clone())
            } else {
                let (tx, rx) = watch::channel(None);
                calls.insert(key.to_string(), rx);
                Flight::Leader(tx)
            }
        };

        let tx = match flight {
            Flight::Waiter(rx) => return Self::wait(rx).await,
            Flight::Leader(tx) => tx,
        };

        let _guard = FlightGuard { group: self, key };
        let result = f().await;
        // Waiters get one shared copy of the outcome, broadcast before the
        // guard removes the record; the leader returns its own result
        // untouched.
        let broadcast: CallResult = match &result {
            Ok(value) => Ok(value.clone()),
            Err(err) => Err(Arc::new(err.clone())),
        };
        let _ = tx.send(Some(broadcast));
        result
    }

    async fn wait(mut rx: watch::Receiver<Option<CallResult>>) -> Result<ByteView> {
        loop {
            if let Some(result) = rx.borrow_and_update().as_ref() {
                return result.clone().map_err(Error::Shared);
            }
            if rx.changed().await.is_err() {
                // The executor was dropped before broadcasting.
                if let Some(result) = rx.borrow().as_ref() {
                    return result.clone().map_err(Error::Shared);
                }
                return Err(Error::Internal("in-flight call abandoned".into()));
            }
        }
    }
}

impl std::fmt::Debug for FlightGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightGroup")
            .field("in_flight", &self.calls.lock().len())
            .finish()
    }
}
