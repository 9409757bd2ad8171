//! Test utilities for preference state
//!
//! This module provides [`FaultyStore`], an in-memory [`DataStore`] that can
//! be told to fail reads or writes, and counts how often it is subscribed to.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use storage::{DataStore, KvError, KvStore, Preferences, SnapshotStream, Transform};
use tokio::sync::broadcast;

/// Kind of failure to inject into live subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// A transient read failure of the storage medium
    Io,
    /// An error that doesn't come from the medium
    Logic,
}

impl InjectedFailure {
    fn into_error(self) -> KvError {
        match self {
            InjectedFailure::Io => {
                KvError::Io(std::io::Error::other("injected read failure"))
            }
            InjectedFailure::Logic => KvError::InvalidKey("injected logic failure".to_string()),
        }
    }
}

/// In-memory store with fault injection
pub struct FaultyStore {
    inner: KvStore,
    faults: broadcast::Sender<InjectedFailure>,
    failing_writes: AtomicUsize,
    subscriptions: AtomicUsize,
}

impl FaultyStore {
    /// Create an empty store
    ///
    /// # Panics
    ///
    /// Panics if the temporary database can't be created.
    pub fn new() -> Self {
        let inner = KvStore::in_memory().expect("temporary sled database");
        let (faults, _) = broadcast::channel(16);

        Self {
            inner,
            faults,
            failing_writes: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
        }
    }

    /// Make every live subscription yield one error
    pub fn inject_read_failure(&self, failure: InjectedFailure) {
        let _ = self.faults.send(failure);
    }

    /// Fail the next `count` writes with an IO error
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of times [`DataStore::data`] has been called
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Read the stored snapshot directly
    pub fn snapshot(&self) -> storage::kv::Result<Preferences> {
        self.inner.snapshot()
    }

    fn take_write_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for FaultyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataStore for FaultyStore {
    fn data(&self) -> SnapshotStream {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);

        let injected = stream::unfold(self.faults.subscribe(), |mut faults| async move {
            loop {
                match faults.recv().await {
                    Ok(failure) => {
                        return Some((Err::<Preferences, _>(failure.into_error()), faults))
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        stream::select(self.inner.data(), injected).boxed()
    }

    async fn update_data(&self, transform: Transform) -> storage::kv::Result<Preferences> {
        if self.take_write_failure() {
            return Err(KvError::Io(std::io::Error::other("injected write failure")));
        }
        self.inner.update_data(transform).await
    }
}
