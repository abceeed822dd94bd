//! # Notification Dispatch
//!
//! Single delivery context for state notifications.
//!
//! Components that change observable state (connection status, resolved
//! identity) may do so from any task. Listeners, however, always run on one
//! [`Dispatcher`] task, one at a time, in the order the changes happened.
//!
//! ## Usage
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use wearable_telemetry::dispatch::{Dispatcher, Observable};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let dispatcher = Dispatcher::spawn();
//! let status = Observable::new("status", dispatcher.clone());
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&seen);
//! let _subscription = status.subscribe(move |value: &String| sink.lock().unwrap().push(value.clone()));
//!
//! status.set("Connecting".to_string());
//! status.set("Connected".to_string());
//! dispatcher.flush().await;
//!
//! assert_eq!(*seen.lock().unwrap(), vec!["Connecting", "Connected"]);
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send>;

/// Handle to the single notification task.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    jobs: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    /// Start the dispatcher task on the current tokio runtime.
    ///
    /// The task ends once every handle has been dropped.
    pub fn spawn() -> Self {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = queue.recv().await {
                job();
            }
            debug!("Dispatcher stopped");
        });
        Self { jobs }
    }

    /// Queue `job` behind everything posted so far.
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.jobs.send(Box::new(job)).is_err() {
            warn!("Dispatcher is closed; notification dropped");
        }
    }

    /// Wait until every job posted before this call has run.
    pub async fn flush(&self) {
        let (done, finished) = oneshot::channel();
        self.post(move || {
            let _ = done.send(());
        });
        let _ = finished.await;
    }
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registered<T> {
    id: u64,
    active: Arc<AtomicBool>,
    listener: Listener<T>,
}

struct ObservableInner<T> {
    name: &'static str,
    dispatcher: Dispatcher,
    value: watch::Sender<Option<T>>,
    listeners: Mutex<Vec<Registered<T>>>,
    next_id: AtomicU64,
}

/// A value whose changes are pushed to listeners through a [`Dispatcher`].
pub struct Observable<T> {
    inner: Arc<ObservableInner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an observable with no value yet.
    pub fn new(name: &'static str, dispatcher: Dispatcher) -> Self {
        let (value, _) = watch::channel(None);
        Self {
            inner: Arc::new(ObservableInner {
                name,
                dispatcher,
                value,
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Publish a new value to every current listener.
    pub fn set(&self, value: T) {
        // Held while posting so concurrent setters are delivered in lock order
        let listeners = self.listeners();
        self.inner.value.send_replace(Some(value.clone()));

        let targets: Vec<_> = listeners
            .iter()
            .map(|r| (Arc::clone(&r.active), Arc::clone(&r.listener)))
            .collect();
        self.inner.dispatcher.post(move || {
            for (active, listener) in targets {
                if active.load(Ordering::Acquire) {
                    listener(&value);
                }
            }
        });
    }

    /// Latest value, if one was ever set.
    pub fn get(&self) -> Option<T> {
        self.inner.value.borrow().clone()
    }

    /// Receiver for awaiting changes from async code.
    pub fn watch(&self) -> watch::Receiver<Option<T>> {
        self.inner.value.subscribe()
    }

    /// Register `listener`.
    ///
    /// If a value is already set, the listener first receives it. Dropping
    /// the returned [`Subscription`] unregisters the listener.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let listener: Listener<T> = Arc::new(listener);

        if let Some(current) = self.get() {
            let active = Arc::clone(&active);
            let listener = Arc::clone(&listener);
            self.inner.dispatcher.post(move || {
                if active.load(Ordering::Acquire) {
                    listener(&current);
                }
            });
        }

        listeners.push(Registered {
            id,
            active: Arc::clone(&active),
            listener,
        });
        debug!("Listener {} subscribed to {}", id, self.inner.name);

        let inner: Weak<ObservableInner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            active,
            detach: Some(Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    let mut listeners = inner
                        .listeners
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    listeners.retain(|r| r.id != id);
                }
            })),
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Registered<T>>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keeps a listener registered; unsubscribes on drop.
pub struct Subscription {
    active: Arc<AtomicBool>,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Explicitly unregister. Equivalent to dropping.
    pub fn unsubscribe(self) {}
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Deliveries already queued check this flag and are skipped
        self.active.store(false, Ordering::Release);
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}
