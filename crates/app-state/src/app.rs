//! Application container
//!
//! [`EmojiReleaseApplication`] is the single place where the preference store
//! is created at startup and closed at shutdown. It owns the repository and
//! hands out view models that share it.

use crate::repository::UserPreferencesRepository;
use crate::view_model::{EmojiScreenViewModel, ViewModelConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storage::{DataStore, KvConfig, KvError, KvStore, DEFAULT_TREE_NAME};
use thiserror::Error;

/// Application errors
#[derive(Debug, Error)]
pub enum AppError {
    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] KvError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Longest time [`EmojiReleaseApplication::shutdown`] waits for the store to be released
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Result type for application operations
pub type Result<T> = std::result::Result<T, AppError>;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding the preference database
    pub data_dir: PathBuf,
    /// Name of the preference store
    pub store_name: String,
    /// View model configuration
    pub view_model: ViewModelConfig,
    /// Log filter directive for the binary's subscriber
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            store_name: DEFAULT_TREE_NAME.to_string(),
            view_model: ViewModelConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Create a configuration storing data in `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), ..Default::default() }
    }

    /// Set the store name
    pub fn store_name(mut self, name: impl Into<String>) -> Self {
        self.store_name = name.into();
        self
    }

    /// Set the view model configuration
    pub fn view_model(mut self, config: ViewModelConfig) -> Self {
        self.view_model = config;
        self
    }

    /// Set the log filter directive
    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Path of the preference database
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.db", self.store_name))
    }

    fn kv_config(&self) -> KvConfig {
        KvConfig::new(self.store_path().to_string_lossy()).tree_name(self.store_name.clone())
    }
}

/// Long-lived application container
///
/// # Example
///
/// ```no_run
/// use app_state::app::{AppConfig, EmojiReleaseApplication};
///
/// #[tokio::main]
/// async fn main() {
///     let app = EmojiReleaseApplication::start(AppConfig::new("/tmp/emoji")).unwrap();
///     let view_model = app.view_model();
///
///     view_model.toggle_theme(true);
///     view_model.flush_writes().await;
///
///     drop(view_model);
///     app.shutdown().await.unwrap();
/// }
/// ```
pub struct EmojiReleaseApplication {
    store: Arc<KvStore>,
    repository: Arc<UserPreferencesRepository>,
    config: AppConfig,
}

impl EmojiReleaseApplication {
    /// Open the preference store and build the repository
    pub fn start(config: AppConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = KvStore::open(config.kv_config())?;

        tracing::info!(path = %config.store_path().display(), "application started");
        Ok(Self::with_store(Arc::new(store), config))
    }

    /// Start with an in-memory store (for testing)
    pub fn in_memory(config: AppConfig) -> Result<Self> {
        let store = KvStore::in_memory()?;
        Ok(Self::with_store(Arc::new(store), config))
    }

    fn with_store(store: Arc<KvStore>, config: AppConfig) -> Self {
        let data_store: Arc<dyn DataStore> = store.clone();
        let repository = Arc::new(UserPreferencesRepository::new(data_store));
        Self { store, repository, config }
    }

    /// The shared preference repository
    pub fn repository(&self) -> Arc<UserPreferencesRepository> {
        Arc::clone(&self.repository)
    }

    /// The preference store
    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    /// The configuration the application was started with
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Create a view model for a new presentation session
    pub fn view_model(&self) -> EmojiScreenViewModel {
        EmojiScreenViewModel::with_config(self.repository(), self.config.view_model.clone())
    }

    /// Close the preference store
    ///
    /// Writes requested after this point fail and are logged. Once every
    /// dropped view model has wound down its tasks, the database is released
    /// before this returns, so the same path can be opened again. Handles
    /// still held elsewhere are waited on for at most [`RELEASE_TIMEOUT`].
    pub async fn shutdown(self) -> Result<()> {
        let Self { store, repository, .. } = self;
        store.close().await?;
        drop(repository);

        let released = tokio::time::timeout(RELEASE_TIMEOUT, async {
            while Arc::strong_count(&store) > 1 {
                tokio::time::sleep(RELEASE_POLL_INTERVAL).await;
            }
        })
        .await;
        if released.is_err() {
            tracing::warn!(
                handles = Arc::strong_count(&store) - 1,
                "preference store still in use after shutdown"
            );
        }

        drop(store);
        tracing::info!("application shut down");
        Ok(())
    }
}
