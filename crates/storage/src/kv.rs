//! Durable key-value store for preferences
//!
//! This module provides the [`DataStore`] abstraction consumed by the
//! preference repository, and [`KvStore`], its implementation on top of sled.
//! Every write is a read-modify-write of the whole snapshot, committed as a
//! single atomic batch and flushed before subscribers are notified.

use crate::preferences::{MutablePreferences, Preferences};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use sled::{Batch, Db, IVec, Tree};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{watch, Mutex};

/// Default sled tree holding the preferences
pub const DEFAULT_TREE_NAME: &str = "layout_preferences";

/// Key-value store error types
#[derive(Debug, Error)]
pub enum KvError {
    /// Sled database error
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored data could not be interpreted
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Invalid key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// The store has been closed
    #[error("Store is closed")]
    Closed,
}

impl KvError {
    /// Whether this error comes from the storage medium
    ///
    /// Medium failures (unreadable or corrupted data) are recoverable by
    /// falling back to defaults. Everything else points at a bug in the
    /// caller and must not be masked.
    pub fn is_io(&self) -> bool {
        match self {
            KvError::Io(_) | KvError::Serialization(_) | KvError::Corruption(_) => true,
            KvError::Database(err) => {
                matches!(err, sled::Error::Io(_) | sled::Error::Corruption { .. })
            }
            KvError::InvalidKey(_) | KvError::Closed => false,
        }
    }
}

/// Result type for key-value operations
pub type Result<T> = std::result::Result<T, KvError>;

/// Stream of snapshots produced by [`DataStore::data`]
pub type SnapshotStream = BoxStream<'static, Result<Preferences>>;

/// Snapshot transform applied by [`DataStore::update_data`]
pub type Transform = Box<dyn FnOnce(Preferences) -> Preferences + Send>;

/// Transactional store of preference snapshots
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Observe the stored preferences
    ///
    /// Each call starts an independent subscription. It reads the persisted
    /// snapshot when first polled, then yields a new snapshot after every
    /// committed write. Read failures are yielded as `Err` items and the
    /// subscription keeps going.
    fn data(&self) -> SnapshotStream;

    /// Atomically replace the stored snapshot with `transform(latest)`
    ///
    /// Writes are serialized; the transform always sees the latest committed
    /// snapshot. Returns the snapshot that was committed.
    async fn update_data(&self, transform: Transform) -> Result<Preferences>;
}

/// Convenience helpers for any [`DataStore`]
#[async_trait]
pub trait DataStoreExt: DataStore {
    /// Edit the stored preferences in place
    async fn edit<F>(&self, f: F) -> Result<Preferences>
    where
        F: FnOnce(&mut MutablePreferences) + Send + 'static;
}

#[async_trait]
impl<S: DataStore + ?Sized> DataStoreExt for S {
    async fn edit<F>(&self, f: F) -> Result<Preferences>
    where
        F: FnOnce(&mut MutablePreferences) + Send + 'static,
    {
        self.update_data(Box::new(move |current| {
            let mut prefs = current.to_mutable();
            f(&mut prefs);
            prefs.freeze()
        }))
        .await
    }
}

/// Key-value store configuration
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Database path
    pub path: String,
    /// Name of the tree holding the preferences
    pub tree_name: String,
    /// Cache capacity in bytes
    pub cache_capacity: u64,
    /// Enable compression
    pub use_compression: bool,
    /// Background flush interval in milliseconds (None disables it)
    ///
    /// Writes made through [`DataStore::update_data`] are always flushed
    /// before they complete.
    pub flush_every_ms: Option<u64>,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            path: "emoji_release_kv.db".to_string(),
            tree_name: DEFAULT_TREE_NAME.to_string(),
            cache_capacity: 1024 * 1024, // 1MB
            use_compression: true,
            flush_every_ms: Some(500),
        }
    }
}

impl KvConfig {
    /// Create a new configuration with a custom path
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), ..Default::default() }
    }

    /// Set the tree name
    pub fn tree_name(mut self, name: impl Into<String>) -> Self {
        self.tree_name = name.into();
        self
    }

    /// Set cache capacity in bytes
    pub fn cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Enable or disable compression
    pub fn use_compression(mut self, enabled: bool) -> Self {
        self.use_compression = enabled;
        self
    }

    /// Set flush interval in milliseconds
    pub fn flush_every_ms(mut self, ms: Option<u64>) -> Self {
        self.flush_every_ms = ms;
        self
    }
}

/// Sled-backed preference store
///
/// Create one per process at startup and share it behind an `Arc`; call
/// [`KvStore::close`] at shutdown.
pub struct KvStore {
    // Keeps the database open for as long as the store lives.
    _db: Db,
    tree: Tree,
    write_lock: Mutex<()>,
    committed: watch::Sender<Preferences>,
    closed: AtomicBool,
}

impl KvStore {
    /// Open (or create) a store with configuration
    pub fn open(config: KvConfig) -> Result<Self> {
        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_capacity)
            .use_compression(config.use_compression)
            .flush_every_ms(config.flush_every_ms)
            .open()?;

        tracing::debug!(path = %config.path, tree = %config.tree_name, "opened preference store");
        Self::from_db(db, &config.tree_name)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, DEFAULT_TREE_NAME)
    }

    fn from_db(db: Db, tree_name: &str) -> Result<Self> {
        let tree = db.open_tree(tree_name)?;
        let (committed, _) = watch::channel(Preferences::empty());

        Ok(Self {
            _db: db,
            tree,
            write_lock: Mutex::new(()),
            committed,
            closed: AtomicBool::new(false),
        })
    }

    /// Read the persisted snapshot directly
    pub fn snapshot(&self) -> Result<Preferences> {
        self.ensure_open()?;
        read_snapshot(&self.tree)
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        let tree = self.tree.clone();
        blocking(move || {
            tree.flush()?;
            Ok(())
        })
        .await
    }

    /// Close the store
    ///
    /// Waits for the write in progress, if any, flushes, and rejects every
    /// later read or write with [`KvError::Closed`].
    pub async fn close(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        self.flush().await?;
        tracing::debug!("closed preference store");
        Ok(())
    }

    /// Check if the store has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(KvError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DataStore for KvStore {
    fn data(&self) -> SnapshotStream {
        if self.is_closed() {
            return stream::once(async { Err(KvError::Closed) }).boxed();
        }

        let cursor = SnapshotCursor {
            tree: self.tree.clone(),
            changes: self.committed.subscribe(),
            last: None,
            started: false,
        };

        stream::unfold(cursor, |mut cursor| async move {
            loop {
                let next = if cursor.started {
                    cursor.changes.changed().await.ok()?;
                    Ok(cursor.changes.borrow_and_update().clone())
                } else {
                    cursor.started = true;
                    let tree = cursor.tree.clone();
                    blocking(move || read_snapshot(&tree)).await
                };

                match next {
                    Ok(snapshot) if cursor.last.as_ref() == Some(&snapshot) => continue,
                    Ok(snapshot) => {
                        cursor.last = Some(snapshot.clone());
                        return Some((Ok(snapshot), cursor));
                    }
                    Err(err) => return Some((Err(err), cursor)),
                }
            }
        })
        .boxed()
    }

    async fn update_data(&self, transform: Transform) -> Result<Preferences> {
        let _guard = self.write_lock.lock().await;
        self.ensure_open()?;

        let tree = self.tree.clone();
        let (updated, changed) = blocking(move || {
            let stored = read_repairable(&tree)?;
            let updated = transform(stored.snapshot.clone());
            if updated == stored.snapshot {
                return Ok((updated, false));
            }

            // Unreadable entries go unless the new snapshot rewrites them
            let mut batch = Batch::default();
            for key in stored.unreadable {
                batch.remove(key);
            }
            write_diff(&mut batch, &stored.snapshot, &updated)?;
            tree.apply_batch(batch)?;
            tree.flush()?;
            Ok((updated, true))
        })
        .await?;

        if changed {
            self.committed.send_replace(updated.clone());
            tracing::debug!(keys = updated.len(), "committed preference snapshot");
        }
        Ok(updated)
    }
}

/// Per-subscriber position in the snapshot sequence
struct SnapshotCursor {
    tree: Tree,
    changes: watch::Receiver<Preferences>,
    last: Option<Preferences>,
    started: bool,
}

/// Snapshot read for a write, with the entries that failed to decode
struct StoredSnapshot {
    snapshot: Preferences,
    unreadable: Vec<IVec>,
}

fn read_snapshot(tree: &Tree) -> Result<Preferences> {
    let mut entries = BTreeMap::new();

    for item in tree.iter() {
        let (key, value) = item?;
        let (name, value) = decode_entry(&key, &value)?;
        entries.insert(name, value);
    }

    Ok(Preferences::from_entries(entries))
}

/// Read the snapshot, treating undecodable entries as absent
///
/// The skipped keys are returned so the next commit can remove them.
fn read_repairable(tree: &Tree) -> Result<StoredSnapshot> {
    let mut entries = BTreeMap::new();
    let mut unreadable = Vec::new();

    for item in tree.iter() {
        let (key, value) = item?;
        match decode_entry(&key, &value) {
            Ok((name, value)) => {
                entries.insert(name, value);
            }
            Err(err) => {
                tracing::warn!(
                    key = %String::from_utf8_lossy(&key),
                    error = %err,
                    "discarding unreadable preference"
                );
                unreadable.push(key);
            }
        }
    }

    Ok(StoredSnapshot { snapshot: Preferences::from_entries(entries), unreadable })
}

fn decode_entry(key: &[u8], value: &[u8]) -> Result<(String, Value)> {
    let name = String::from_utf8(key.to_vec())
        .map_err(|_| KvError::Corruption(format!("non UTF-8 key of {} bytes", key.len())))?;
    let value = serde_json::from_slice(value)?;
    Ok((name, value))
}

/// Run blocking sled work off the async executor
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| KvError::Io(std::io::Error::other(err)))?
}

/// Add the operations turning `current` into `updated` to `batch`
fn write_diff(batch: &mut Batch, current: &Preferences, updated: &Preferences) -> Result<()> {
    for (name, _) in current.iter() {
        if updated.value(name).is_none() {
            batch.remove(name.as_bytes());
        }
    }

    for (name, value) in updated.iter() {
        if name.is_empty() {
            return Err(KvError::InvalidKey("empty preference name".to_string()));
        }
        if current.value(name) != Some(value) {
            batch.insert(name.as_bytes(), serde_json::to_vec(value)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::{bool_key, PreferenceKey};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const IS_LINEAR_LAYOUT: PreferenceKey<bool> = bool_key("is_linear_layout");
    const IS_DARK_THEME: PreferenceKey<bool> = bool_key("is_dark_theme");
    const COUNTER: PreferenceKey<i64> = PreferenceKey::new("counter");

    #[tokio::test]
    async fn test_empty_store_yields_empty_snapshot() {
        let kv = KvStore::in_memory().unwrap();
        let mut data = kv.data();

        let first = data.next().await.unwrap().unwrap();
        assert!(first.is_empty());
    }

    #[tokio::test]
    async fn test_edit_commits_and_notifies() {
        let kv = KvStore::in_memory().unwrap();
        let mut data = kv.data();
        assert!(data.next().await.unwrap().unwrap().is_empty());

        let committed = kv.edit(|prefs| {
            prefs.set(&IS_DARK_THEME, true);
        })
        .await
        .unwrap();
        assert_eq!(committed.get(&IS_DARK_THEME), Some(true));

        let next = data.next().await.unwrap().unwrap();
        assert_eq!(next, committed);
        assert_eq!(kv.snapshot().unwrap(), committed);
    }

    #[tokio::test]
    async fn test_edit_leaves_other_keys_untouched() {
        let kv = KvStore::in_memory().unwrap();

        kv.edit(|prefs| {
            prefs.set(&IS_LINEAR_LAYOUT, false);
        })
        .await
        .unwrap();
        kv.edit(|prefs| {
            prefs.set(&IS_DARK_THEME, true);
        })
        .await
        .unwrap();

        let snapshot = kv.snapshot().unwrap();
        assert_eq!(snapshot.get(&IS_LINEAR_LAYOUT), Some(false));
        assert_eq!(snapshot.get(&IS_DARK_THEME), Some(true));
    }

    #[tokio::test]
    async fn test_removed_keys_are_deleted() {
        let kv = KvStore::in_memory().unwrap();

        kv.edit(|prefs| {
            prefs.set(&IS_LINEAR_LAYOUT, false).set(&IS_DARK_THEME, true);
        })
        .await
        .unwrap();
        kv.edit(|prefs| {
            prefs.remove(&IS_LINEAR_LAYOUT);
        })
        .await
        .unwrap();

        let snapshot = kv.snapshot().unwrap();
        assert!(!snapshot.contains(&IS_LINEAR_LAYOUT));
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_transform_is_not_published() {
        let kv = KvStore::in_memory().unwrap();
        kv.edit(|prefs| {
            prefs.set(&IS_DARK_THEME, true);
        })
        .await
        .unwrap();

        let mut data = kv.data();
        data.next().await.unwrap().unwrap();

        kv.edit(|prefs| {
            prefs.set(&IS_DARK_THEME, true);
        })
        .await
        .unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(50), data.next()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_independent_subscribers() {
        let kv = KvStore::in_memory().unwrap();
        let mut first = kv.data();
        let mut second = kv.data();

        assert!(first.next().await.unwrap().unwrap().is_empty());

        kv.edit(|prefs| {
            prefs.set(&IS_LINEAR_LAYOUT, false);
        })
        .await
        .unwrap();

        // The second subscriber starts late and only sees the latest snapshot
        let late = second.next().await.unwrap().unwrap();
        assert_eq!(late.get(&IS_LINEAR_LAYOUT), Some(false));

        let updated = first.next().await.unwrap().unwrap();
        assert_eq!(updated, late);
    }

    #[tokio::test]
    async fn test_concurrent_writes_are_serialized() {
        let kv = Arc::new(KvStore::in_memory().unwrap());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let kv = Arc::clone(&kv);
            handles.push(tokio::spawn(async move {
                kv.edit(|prefs| {
                    let count = prefs.get(&COUNTER).unwrap_or(0);
                    prefs.set(&COUNTER, count + 1);
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(kv.snapshot().unwrap().get(&COUNTER), Some(20));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("prefs.db");
        let config = KvConfig::new(path.to_string_lossy()).flush_every_ms(None);

        {
            let kv = KvStore::open(config.clone()).unwrap();
            kv.edit(|prefs| {
                prefs.set(&IS_LINEAR_LAYOUT, false);
            })
            .await
            .unwrap();
            kv.close().await.unwrap();
        }

        let kv = KvStore::open(config).unwrap();
        let mut data = kv.data();
        let restored = data.next().await.unwrap().unwrap();
        assert_eq!(restored.get(&IS_LINEAR_LAYOUT), Some(false));
        assert!(!restored.contains(&IS_DARK_THEME));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_access() {
        let kv = KvStore::in_memory().unwrap();
        kv.close().await.unwrap();

        assert!(kv.is_closed());
        assert!(matches!(kv.snapshot(), Err(KvError::Closed)));

        let write = kv.edit(|prefs| {
            prefs.set(&IS_DARK_THEME, true);
        })
        .await;
        assert!(matches!(write, Err(KvError::Closed)));

        let mut data = kv.data();
        assert!(matches!(data.next().await, Some(Err(KvError::Closed))));
        assert!(data.next().await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_value_does_not_block_other_keys() {
        let kv = KvStore::in_memory().unwrap();
        kv.tree.insert(IS_LINEAR_LAYOUT.name(), &b"\xffgarbage"[..]).unwrap();

        let mut data = kv.data();
        let first = data.next().await.unwrap();
        assert!(matches!(&first, Err(err) if err.is_io()));

        let committed = kv.edit(|prefs| {
            prefs.set(&IS_DARK_THEME, true);
        })
        .await
        .unwrap();
        assert_eq!(committed.get(&IS_DARK_THEME), Some(true));
        assert!(!committed.contains(&IS_LINEAR_LAYOUT));

        let observed = data.next().await.unwrap().unwrap();
        assert_eq!(observed, committed);

        // The unreadable entry was removed by the commit
        assert_eq!(kv.snapshot().unwrap(), committed);
    }

    #[tokio::test]
    async fn test_corrupt_value_can_be_overwritten() {
        let kv = KvStore::in_memory().unwrap();
        kv.tree.insert(IS_LINEAR_LAYOUT.name(), &b"{not json"[..]).unwrap();

        kv.edit(|prefs| {
            prefs.set(&IS_LINEAR_LAYOUT, false);
        })
        .await
        .unwrap();

        let snapshot = kv.snapshot().unwrap();
        assert_eq!(snapshot.get(&IS_LINEAR_LAYOUT), Some(false));
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_write_returns_stored_snapshot() {
        let kv = KvStore::in_memory().unwrap();
        kv.tree.insert(IS_DARK_THEME.name(), &b"true"[..]).unwrap();

        let current = kv.update_data(Box::new(|prefs| prefs)).await.unwrap();
        assert_eq!(current.get(&IS_DARK_THEME), Some(true));
    }

    #[test]
    fn test_error_classification() {
        let io = KvError::Io(std::io::Error::other("disk unplugged"));
        assert!(io.is_io());
        assert!(KvError::Corruption("bad page".to_string()).is_io());
        assert!(KvError::Database(sled::Error::Io(std::io::Error::other("eio"))).is_io());

        assert!(!KvError::Closed.is_io());
        assert!(!KvError::InvalidKey(String::new()).is_io());
        assert!(!KvError::Database(sled::Error::Unsupported("nope".to_string())).is_io());
    }

    #[test]
    fn test_config_builder() {
        let config = KvConfig::new("test.db")
            .tree_name("prefs")
            .cache_capacity(32 * 1024)
            .use_compression(false)
            .flush_every_ms(Some(1000));

        assert_eq!(config.path, "test.db");
        assert_eq!(config.tree_name, "prefs");
        assert_eq!(config.cache_capacity, 32 * 1024);
        assert!(!config.use_compression);
        assert_eq!(config.flush_every_ms, Some(1000));
    }

    #[test]
    fn test_default_config() {
        let config = KvConfig::default();
        assert_eq!(config.tree_name, DEFAULT_TREE_NAME);
        assert!(config.use_compression);
    }
}
