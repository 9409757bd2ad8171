//! Emoji screen view model
//!
//! This module combines the layout and theme preferences into a single
//! [`EmojiReleaseUiState`] and forwards the user's choices to the repository.
//! The state always reflects what the store holds: setters never touch it
//! directly, the new value arrives through the observation path once the
//! write has been committed.

use crate::repository::{PreferenceStream, RepositoryError, Result, UserPreferencesRepository};
use crate::shared_state::{SharedState, SharingPolicy, StateSubscription, DEFAULT_STOP_TIMEOUT};
use futures_util::stream::{self, BoxStream, StreamExt};
use futures_util::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Icon shown on the layout toggle button
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutIcon {
    /// Switches to the grid layout
    Grid,
    /// Switches to the linear layout
    Linear,
}

impl LayoutIcon {
    /// Text glyph for the icon
    pub fn glyph(&self) -> &'static str {
        match self {
            LayoutIcon::Grid => "▦",
            LayoutIcon::Linear => "☰",
        }
    }
}

/// UI state of the emoji screen
///
/// The toggle icon and description are derived from `is_linear_layout`;
/// the theme has no influence on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmojiReleaseUiState {
    /// Whether the list is shown as a single column
    pub is_linear_layout: bool,
    /// Whether the dark theme is selected
    pub is_dark_theme: bool,
}

impl Default for EmojiReleaseUiState {
    fn default() -> Self {
        Self { is_linear_layout: true, is_dark_theme: false }
    }
}

impl EmojiReleaseUiState {
    /// Create a UI state
    pub fn new(is_linear_layout: bool, is_dark_theme: bool) -> Self {
        Self { is_linear_layout, is_dark_theme }
    }

    /// Icon for the layout toggle: the layout a tap switches to
    pub fn toggle_icon(&self) -> LayoutIcon {
        if self.is_linear_layout {
            LayoutIcon::Grid
        } else {
            LayoutIcon::Linear
        }
    }

    /// Accessibility description for the layout toggle
    pub fn toggle_content_description(&self) -> &'static str {
        if self.is_linear_layout {
            "Grid layout toggle"
        } else {
            "Linear layout toggle"
        }
    }
}

/// Retry policy for preference writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts per write (at least one)
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further retry
    pub initial_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1, // Log and drop
            initial_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryConfig {
    /// Retry up to `max_attempts` attempts in total
    pub fn with_attempts(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self { max_attempts, initial_backoff }
    }
}

/// View model configuration
#[derive(Debug, Clone)]
pub struct ViewModelConfig {
    /// Grace window before the preference subscriptions are torn down
    pub stop_timeout: Duration,
    /// Write retry policy
    pub write_retry: RetryConfig,
}

impl Default for ViewModelConfig {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            write_retry: RetryConfig::default(),
        }
    }
}

impl ViewModelConfig {
    /// Set the grace window
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Set the write retry policy
    pub fn write_retry(mut self, retry: RetryConfig) -> Self {
        self.write_retry = retry;
        self
    }

    fn sharing_policy(&self) -> SharingPolicy {
        SharingPolicy::while_subscribed(self.stop_timeout)
    }
}

enum WriteRequest {
    Layout(bool),
    Theme(bool),
    Flush(oneshot::Sender<()>),
}

/// View model for the emoji screen
///
/// Must be created within a tokio runtime; it spawns the task that performs
/// preference writes in the order they were requested. Writes that were
/// requested before the view model is dropped still complete.
///
/// # Example
///
/// ```no_run
/// use app_state::repository::UserPreferencesRepository;
/// use app_state::view_model::{EmojiReleaseUiState, EmojiScreenViewModel};
/// use std::sync::Arc;
/// use storage::KvStore;
///
/// #[tokio::main]
/// async fn main() {
///     let store = Arc::new(KvStore::in_memory().unwrap());
///     let repository = Arc::new(UserPreferencesRepository::new(store));
///     let view_model = EmojiScreenViewModel::new(repository);
///
///     let mut ui_state = view_model.subscribe();
///     view_model.toggle_theme(true);
///
///     let state = ui_state.wait_for(|s| s.is_dark_theme).await.unwrap();
///     assert_eq!(state, EmojiReleaseUiState::new(true, true));
/// }
/// ```
pub struct EmojiScreenViewModel {
    ui_state: SharedState<EmojiReleaseUiState, RepositoryError>,
    writes: mpsc::UnboundedSender<WriteRequest>,
}

impl EmojiScreenViewModel {
    /// Create a view model with the default configuration
    pub fn new(repository: Arc<UserPreferencesRepository>) -> Self {
        Self::with_config(repository, ViewModelConfig::default())
    }

    /// Create a view model with configuration
    pub fn with_config(repository: Arc<UserPreferencesRepository>, config: ViewModelConfig) -> Self {
        let source = Arc::clone(&repository);
        let ui_state = SharedState::new(
            EmojiReleaseUiState::default(),
            config.sharing_policy(),
            move || combine_ui_state(source.is_linear_layout(), source.is_dark_theme()),
        );

        let (writes, requests) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(repository, requests, config.write_retry));

        Self { ui_state, writes }
    }

    /// The shared UI state
    pub fn ui_state(&self) -> &SharedState<EmojiReleaseUiState, RepositoryError> {
        &self.ui_state
    }

    /// Start observing the UI state
    pub fn subscribe(&self) -> StateSubscription<EmojiReleaseUiState> {
        self.ui_state.subscribe()
    }

    /// Select the linear (`true`) or grid (`false`) layout
    pub fn select_layout(&self, is_linear_layout: bool) {
        self.enqueue(WriteRequest::Layout(is_linear_layout));
    }

    /// Select the dark (`true`) or light (`false`) theme
    pub fn toggle_theme(&self, is_dark_theme: bool) {
        self.enqueue(WriteRequest::Theme(is_dark_theme));
    }

    /// Wait until every write requested so far has finished
    ///
    /// Finished means committed, or failed and logged.
    pub async fn flush_writes(&self) {
        let (done, finished) = oneshot::channel();
        if self.writes.send(WriteRequest::Flush(done)).is_ok() {
            let _ = finished.await;
        }
    }

    fn enqueue(&self, request: WriteRequest) {
        if self.writes.send(request).is_err() {
            tracing::error!("preference writer has stopped, dropping write");
        }
    }
}

/// Combine the latest layout and theme values into UI states
///
/// Nothing is emitted until both preferences have produced a value. Updates
/// that are already available are applied together, so a snapshot touching
/// both preferences yields one state. An error from either side is forwarded
/// and ends the stream.
fn combine_ui_state(
    layout: PreferenceStream<bool>,
    theme: PreferenceStream<bool>,
) -> BoxStream<'static, Result<EmojiReleaseUiState>> {
    enum Update {
        Layout(bool),
        Theme(bool),
    }

    let updates = stream::select(
        layout.map(|item| item.map(Update::Layout)),
        theme.map(|item| item.map(Update::Theme)),
    );

    let latest: (Option<bool>, Option<bool>) = (None, None);
    stream::unfold(Some((updates, latest)), |state| async move {
        let (mut updates, mut latest) = state?;
        loop {
            let mut next = Some(updates.next().await?);
            while let Some(update) = next {
                match update {
                    Ok(Update::Layout(value)) => latest.0 = Some(value),
                    Ok(Update::Theme(value)) => latest.1 = Some(value),
                    Err(err) => return Some((Err(err), None)),
                }
                next = updates.next().now_or_never().flatten();
            }

            if let (Some(is_linear_layout), Some(is_dark_theme)) = latest {
                let ui_state = EmojiReleaseUiState::new(is_linear_layout, is_dark_theme);
                return Some((Ok(ui_state), Some((updates, latest))));
            }
        }
    })
    .boxed()
}

async fn run_writer(
    repository: Arc<UserPreferencesRepository>,
    mut requests: mpsc::UnboundedReceiver<WriteRequest>,
    retry: RetryConfig,
) {
    while let Some(request) = requests.recv().await {
        match request {
            WriteRequest::Layout(value) => {
                write_with_retry(retry, "is_linear_layout", || {
                    repository.save_layout_preference(value)
                })
                .await;
            }
            WriteRequest::Theme(value) => {
                write_with_retry(retry, "is_dark_theme", || repository.save_theme_preference(value))
                    .await;
            }
            WriteRequest::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    tracing::debug!("preference writer stopped");
}

async fn write_with_retry<F, Fut>(retry: RetryConfig, preference: &'static str, mut write: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let attempts = retry.max_attempts.max(1);
    let mut backoff = retry.initial_backoff;

    for attempt in 1..=attempts {
        match write().await {
            Ok(()) => return,
            Err(err) if attempt < attempts => {
                tracing::warn!(preference, attempt, error = %err, "Preference write failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(err) => {
                tracing::error!(preference, attempts, error = %err, "Failed to save preference");
            }
        }
    }
}
