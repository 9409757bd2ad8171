//! Shared observable state
//!
//! This module provides [`SharedState`], a latest-value cell fed by an
//! upstream stream. Any number of observers can watch it. Under
//! [`SharingPolicy::WhileSubscribed`] the upstream is only collected while
//! someone is watching, plus a grace window after the last observer leaves,
//! so short unsubscribe/resubscribe churn doesn't restart it.

use futures_util::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Default grace window before an unobserved upstream is stopped (5 seconds)
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// When the upstream is collected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingPolicy {
    /// Start at construction and never stop
    Eagerly,
    /// Collect while observed; stop `stop_timeout` after the last observer leaves
    WhileSubscribed {
        /// Grace window after the last observer leaves
        stop_timeout: Duration,
    },
}

impl SharingPolicy {
    /// Collect while observed, with the given grace window
    pub fn while_subscribed(stop_timeout: Duration) -> Self {
        SharingPolicy::WhileSubscribed { stop_timeout }
    }
}

impl Default for SharingPolicy {
    fn default() -> Self {
        SharingPolicy::while_subscribed(DEFAULT_STOP_TIMEOUT)
    }
}

/// Collection status of a [`SharedState`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharingStatus {
    /// Upstream is not being collected
    Idle,
    /// Upstream is being collected
    Active,
    /// Upstream ended normally
    Completed,
    /// Upstream failed; the last good value is kept
    Failed(String),
}

type UpstreamFactory<T, E> = Box<dyn Fn() -> BoxStream<'static, Result<T, E>> + Send + Sync>;

/// Latest value and collection status, shared with the collector task
struct Feed<T> {
    value: watch::Sender<T>,
    // (run id, status); a collector only reports for its own run
    status: Mutex<(u64, SharingStatus)>,
}

#[derive(Default)]
struct Control {
    subscribers: usize,
    collector: Option<JoinHandle<()>>,
    teardown: Option<JoinHandle<()>>,
    generation: u64,
    upstream_starts: u64,
}

struct Inner<T, E> {
    feed: Arc<Feed<T>>,
    upstream: UpstreamFactory<T, E>,
    policy: SharingPolicy,
    control: Mutex<Control>,
}

/// Observable state fed by an upstream stream
///
/// Subscribing and the [`SharingPolicy::Eagerly`] constructor spawn tasks
/// and must be called from within a tokio runtime.
///
/// # Example
///
/// ```no_run
/// use app_state::shared_state::{SharedState, SharingPolicy};
/// use futures_util::stream::{self, StreamExt};
///
/// #[tokio::main]
/// async fn main() {
///     let state = SharedState::new(0, SharingPolicy::default(), || {
///         stream::iter(vec![Ok::<_, String>(1), Ok(2)]).boxed()
///     });
///
///     let mut subscription = state.subscribe();
///     let value = subscription.wait_for(|v| *v == 2).await;
///     assert_eq!(value, Some(2));
/// }
/// ```
pub struct SharedState<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> SharedState<T, E>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    E: fmt::Display + Send + 'static,
{
    /// Create a state holding `initial` until the upstream produces a value
    pub fn new<F>(initial: T, policy: SharingPolicy, upstream: F) -> Self
    where
        F: Fn() -> BoxStream<'static, Result<T, E>> + Send + Sync + 'static,
    {
        let (value, _) = watch::channel(initial);
        let inner = Arc::new(Inner {
            feed: Arc::new(Feed { value, status: Mutex::new((0, SharingStatus::Idle)) }),
            upstream: Box::new(upstream),
            policy,
            control: Mutex::new(Control::default()),
        });

        if policy == SharingPolicy::Eagerly {
            let mut control = inner.control.lock();
            inner.start_collector(&mut control);
        }

        Self { inner }
    }

    /// Current value
    pub fn value(&self) -> T {
        self.inner.feed.value.borrow().clone()
    }

    /// Start observing
    ///
    /// The returned subscription detaches when dropped.
    pub fn subscribe(&self) -> StateSubscription<T> {
        let receiver = self.inner.feed.value.subscribe();
        self.inner.attach();

        let owner: Arc<dyn Observed> = self.inner.clone();
        StateSubscription { receiver, owner }
    }

    /// Current collection status
    pub fn status(&self) -> SharingStatus {
        self.inner.feed.status.lock().1.clone()
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.control.lock().subscribers
    }

    /// Number of times the upstream has been started
    pub fn upstream_starts(&self) -> u64 {
        self.inner.control.lock().upstream_starts
    }

    /// Whether the upstream is currently being collected
    pub fn is_collecting(&self) -> bool {
        self.inner
            .control
            .lock()
            .collector
            .as_ref()
            .is_some_and(|collector| !collector.is_finished())
    }

    /// The sharing policy
    pub fn policy(&self) -> SharingPolicy {
        self.inner.policy
    }
}

impl<T, E> Inner<T, E>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    E: fmt::Display + Send + 'static,
{
    fn attach(&self) {
        let mut control = self.control.lock();
        control.subscribers += 1;
        if control.subscribers > 1 {
            return;
        }

        // First observer: cancel a pending teardown
        control.generation += 1;
        if let Some(teardown) = control.teardown.take() {
            teardown.abort();
        }

        if let SharingPolicy::WhileSubscribed { .. } = self.policy {
            let running = control
                .collector
                .as_ref()
                .is_some_and(|collector| !collector.is_finished());
            if !running {
                self.start_collector(&mut control);
            }
        }
    }

    fn detach(self: &Arc<Self>) {
        let mut control = self.control.lock();
        control.subscribers = control.subscribers.saturating_sub(1);
        if control.subscribers > 0 {
            return;
        }

        let SharingPolicy::WhileSubscribed { stop_timeout } = self.policy else {
            return;
        };

        control.generation += 1;
        let generation = control.generation;

        if stop_timeout.is_zero() {
            self.stop_collector(&mut control);
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.stop_collector(&mut control);
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        control.teardown = Some(runtime.spawn(async move {
            tokio::time::sleep(stop_timeout).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut control = inner.control.lock();
            if control.generation == generation && control.subscribers == 0 {
                control.teardown = None;
                inner.stop_collector(&mut control);
            }
        }));
    }

    fn start_collector(&self, control: &mut Control) {
        control.upstream_starts += 1;
        let run = control.upstream_starts;
        *self.feed.status.lock() = (run, SharingStatus::Active);

        let upstream = (self.upstream)();
        let feed = Arc::clone(&self.feed);
        control.collector = Some(tokio::spawn(collect(upstream, feed, run)));

        tracing::debug!(run, "started upstream collection");
    }

    fn stop_collector(&self, control: &mut Control) {
        if let Some(collector) = control.collector.take() {
            collector.abort();
            tracing::debug!(run = control.upstream_starts, "stopped upstream collection");
        }

        let mut status = self.feed.status.lock();
        if status.1 == SharingStatus::Active {
            status.1 = SharingStatus::Idle;
        }
    }
}

impl<T, E> Drop for Inner<T, E> {
    fn drop(&mut self) {
        let control = self.control.get_mut();
        if let Some(collector) = control.collector.take() {
            collector.abort();
        }
        if let Some(teardown) = control.teardown.take() {
            teardown.abort();
        }
    }
}

async fn collect<T, E>(mut upstream: BoxStream<'static, Result<T, E>>, feed: Arc<Feed<T>>, run: u64)
where
    T: PartialEq,
    E: fmt::Display,
{
    let outcome = loop {
        match upstream.next().await {
            Some(Ok(value)) => {
                feed.value.send_if_modified(|current| {
                    if *current == value {
                        false
                    } else {
                        *current = value;
                        true
                    }
                });
            }
            Some(Err(err)) => {
                tracing::error!(run, error = %err, "upstream state collection failed");
                break SharingStatus::Failed(err.to_string());
            }
            None => break SharingStatus::Completed,
        }
    };

    let mut status = feed.status.lock();
    if status.0 == run {
        status.1 = outcome;
    }
}

/// Something a subscription keeps alive and releases on drop
trait Observed: Send + Sync {
    fn release(self: Arc<Self>);
}

impl<T, E> Observed for Inner<T, E>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    E: fmt::Display + Send + 'static,
{
    fn release(self: Arc<Self>) {
        self.detach();
    }
}

/// A live observation of a [`SharedState`]
///
/// Dropping it detaches the observer.
pub struct StateSubscription<T> {
    receiver: watch::Receiver<T>,
    owner: Arc<dyn Observed>,
}

impl<T: Clone> StateSubscription<T> {
    /// Current value
    pub fn current(&self) -> T {
        self.receiver.borrow().clone()
    }

    /// Wait for the next change and return the new value
    pub async fn changed(&mut self) -> Option<T> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Wait until the value satisfies `predicate` and return it
    pub async fn wait_for(&mut self, predicate: impl FnMut(&T) -> bool) -> Option<T> {
        self.receiver
            .wait_for(predicate)
            .await
            .ok()
            .map(|value| value.clone())
    }
}

impl<T> Drop for StateSubscription<T> {
    fn drop(&mut self) {
        Arc::clone(&self.owner).release();
    }
}

impl<T: fmt::Debug> fmt::Debug for StateSubscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSubscription")
            .field("current", &*self.receiver.borrow())
            .finish()
    }
}
