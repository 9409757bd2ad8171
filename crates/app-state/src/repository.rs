//! User preference repository
//!
//! This module provides typed access to the layout and theme preferences held
//! in a [`DataStore`], with safe defaults when the store can't be read.

use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use storage::{bool_key, DataStore, DataStoreExt, KvError, PreferenceKey, Preferences};
use thiserror::Error;

/// Whether the emoji list is shown as a single column
pub const IS_LINEAR_LAYOUT: PreferenceKey<bool> = bool_key("is_linear_layout");

/// Whether the dark theme is selected
pub const IS_DARK_THEME: PreferenceKey<bool> = bool_key("is_dark_theme");

/// Layout used when nothing has been stored
pub const DEFAULT_LINEAR_LAYOUT: bool = true;

/// Theme used when nothing has been stored
pub const DEFAULT_DARK_THEME: bool = false;

/// Repository errors
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] KvError),
}

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Stream of preference values
pub type PreferenceStream<T> = BoxStream<'static, Result<T>>;

/// Typed facade over the preference store
///
/// # Example
///
/// ```no_run
/// use app_state::repository::UserPreferencesRepository;
/// use futures_util::StreamExt;
/// use std::sync::Arc;
/// use storage::KvStore;
///
/// #[tokio::main]
/// async fn main() {
///     let store = Arc::new(KvStore::in_memory().unwrap());
///     let repository = UserPreferencesRepository::new(store);
///
///     repository.save_theme_preference(true).await.unwrap();
///
///     let mut dark = repository.is_dark_theme();
///     assert!(dark.next().await.unwrap().unwrap());
/// }
/// ```
pub struct UserPreferencesRepository {
    store: Arc<dyn DataStore>,
}

impl UserPreferencesRepository {
    /// Create a repository over a store
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// Observe the stored snapshot
    ///
    /// Medium failures are logged and replaced by the empty snapshot, so
    /// observers see the defaults and the stream keeps going. Any other
    /// error is yielded once and ends the stream.
    pub fn preferences(&self) -> PreferenceStream<Preferences> {
        stream::unfold(Some(self.store.data()), |upstream| async move {
            let mut upstream = upstream?;
            match upstream.next().await? {
                Ok(prefs) => Some((Ok(prefs), Some(upstream))),
                Err(err) if err.is_io() => {
                    tracing::error!(error = %err, "Error reading preferences");
                    Some((Ok(Preferences::empty()), Some(upstream)))
                }
                Err(err) => Some((Err(RepositoryError::from(err)), None)),
            }
        })
        .boxed()
    }

    /// Observe the layout preference (`true` when linear)
    pub fn is_linear_layout(&self) -> PreferenceStream<bool> {
        self.preference(IS_LINEAR_LAYOUT, DEFAULT_LINEAR_LAYOUT)
    }

    /// Observe the theme preference (`true` when dark)
    pub fn is_dark_theme(&self) -> PreferenceStream<bool> {
        self.preference(IS_DARK_THEME, DEFAULT_DARK_THEME)
    }

    /// Persist the layout preference
    pub async fn save_layout_preference(&self, is_linear_layout: bool) -> Result<()> {
        self.save(IS_LINEAR_LAYOUT, is_linear_layout).await
    }

    /// Persist the theme preference
    pub async fn save_theme_preference(&self, is_dark_theme: bool) -> Result<()> {
        self.save(IS_DARK_THEME, is_dark_theme).await
    }

    fn preference(&self, key: PreferenceKey<bool>, default: bool) -> PreferenceStream<bool> {
        self.preferences()
            .map(move |item| item.map(|prefs| prefs.get(&key).unwrap_or(default)))
            .boxed()
    }

    async fn save(&self, key: PreferenceKey<bool>, value: bool) -> Result<()> {
        self.store
            .edit(move |prefs| {
                prefs.set(&key, value);
            })
            .await?;
        tracing::debug!(key = %key, value, "saved preference");
        Ok(())
    }
}
