//! Single-value reactive streams over async computations.
//!
//! A [`Single`] wraps a factory of futures. Every subscription spawns a fresh
//! future on a Tokio runtime and reports its outcome exactly once, on the
//! stream's [`DeliveryContext`]. Disposing the [`Subscription`] before the
//! outcome is delivered aborts the spawned task and silences the observer.
//! A computation that panics terminates its subscription without a
//! notification.

use std::{
    any::Any,
    fmt,
    future::Future,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, OnceLock, mpsc},
    thread,
};

use tokio::{runtime::Handle, task::AbortHandle};

use crate::adapter::{RestFuture, lock_unpoisoned};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where terminal notifications run.
///
/// A threaded context owns one dedicated thread that runs notifications in
/// the order they were queued, so a subscriber never sees two callbacks at
/// once. An inline context runs them on whichever task produced the outcome.
#[derive(Clone)]
pub struct DeliveryContext {
    queue: Option<mpsc::Sender<Job>>,
    name: Arc<str>,
}

impl DeliveryContext {
    /// Starts a dedicated delivery thread called `name`.
    ///
    /// The thread exits once every clone of the context has been dropped. A
    /// panicking notification is logged and does not take the thread down.
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name: String = name.into();
        let (tx, rx) = mpsc::channel::<Job>();
        let context = name.clone();
        thread::Builder::new().name(name.clone()).spawn(move || {
            for job in rx {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    tracing::warn!(
                        context = %context,
                        panic = %panic_message(payload.as_ref()),
                        "single observer panicked"
                    );
                }
            }
        })?;
        Ok(Self {
            queue: Some(tx),
            name: name.into(),
        })
    }

    pub fn inline() -> Self {
        Self {
            queue: None,
            name: "inline".into(),
        }
    }

    /// Process-wide delivery thread used when no context is configured.
    pub fn shared() -> Self {
        static SHARED: OnceLock<DeliveryContext> = OnceLock::new();
        SHARED
            .get_or_init(|| {
                Self::spawn("single-delivery").unwrap_or_else(|err| {
                    tracing::warn!(error = %err, "delivery thread unavailable, delivering inline");
                    Self::inline()
                })
            })
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_inline(&self) -> bool {
        self.queue.is_none()
    }

    pub(crate) fn deliver(&self, job: Job) {
        let Some(queue) = &self.queue else {
            job();
            return;
        };
        if let Err(mpsc::SendError(job)) = queue.send(job) {
            tracing::warn!(context = %self.name, "delivery thread is gone, delivering inline");
            job();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

impl fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryContext")
            .field("name", &self.name)
            .field("inline", &self.is_inline())
            .finish()
    }
}

type Source<T, E> = Arc<dyn Fn() -> RestFuture<Result<T, E>> + Send + Sync>;
type Observer<T, E> = Box<dyn FnOnce(Result<T, E>) + Send + 'static>;

/// A cold stream that yields exactly one success or one failure per subscription.
pub struct Single<T, E> {
    source: Source<T, E>,
    delivery: DeliveryContext,
}

impl<T, E> Clone for Single<T, E> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            delivery: self.delivery.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Single<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Single")
            .field("delivery", &self.delivery)
            .finish_non_exhaustive()
    }
}

impl<T, E> Single<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Wraps `f`; each subscription calls it once and awaits the returned future.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            source: Arc::new(move || -> RestFuture<Result<T, E>> { Box::pin(f()) }),
            delivery: DeliveryContext::shared(),
        }
    }

    pub fn observe_on(mut self, delivery: DeliveryContext) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn delivery(&self) -> &DeliveryContext {
        &self.delivery
    }

    pub fn map<U, G>(self, g: G) -> Single<U, E>
    where
        U: Send + 'static,
        G: Fn(T) -> U + Send + Sync + 'static,
    {
        let source = self.source;
        let g = Arc::new(g);
        Single {
            source: Arc::new(move || -> RestFuture<Result<U, E>> {
                let pending = source();
                let g = Arc::clone(&g);
                Box::pin(async move { pending.await.map(|value| g(value)) })
            }),
            delivery: self.delivery,
        }
    }

    /// Subscribes on the runtime of the calling task.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime, like `tokio::spawn`.
    pub fn subscribe<O>(&self, observer: O) -> Subscription
    where
        O: FnOnce(Result<T, E>) + Send + 'static,
    {
        self.subscribe_on(&Handle::current(), observer)
    }

    pub fn subscribe_on<O>(&self, runtime: &Handle, observer: O) -> Subscription
    where
        O: FnOnce(Result<T, E>) + Send + 'static,
    {
        let slot = Arc::new(ObserverSlot::<T, E>::new(Box::new(observer)));
        let pending = (self.source)();
        let delivery = self.delivery.clone();
        let worker_slot = Arc::clone(&slot);

        let task = runtime.spawn(async move {
            let guard = ReleaseUnlessCompleted {
                slot: Arc::clone(&worker_slot) as Arc<dyn Terminal>,
                completed: false,
            };
            let outcome = pending.await;
            guard.complete();
            delivery.deliver(Box::new(move || worker_slot.deliver(outcome)));
        });
        tracing::trace!(context = %self.delivery.name(), "single subscribed");

        Subscription {
            slot,
            task: task.abort_handle(),
            detached: false,
        }
    }
}

struct ObserverSlot<T, E> {
    observer: Mutex<Option<Observer<T, E>>>,
}

impl<T, E> ObserverSlot<T, E> {
    fn new(observer: Observer<T, E>) -> Self {
        Self {
            observer: Mutex::new(Some(observer)),
        }
    }

    fn deliver(&self, outcome: Result<T, E>) {
        let observer = lock_unpoisoned(&self.observer).take();
        match observer {
            Some(observer) => observer(outcome),
            None => tracing::trace!("single outcome dropped, subscriber already detached"),
        }
    }
}

/// Type-erased view of an observer slot, so [`Subscription`] is not generic.
trait Terminal: Send + Sync {
    /// Takes the observer away; true only for the call that actually took it.
    fn release(&self) -> bool;

    fn is_terminated(&self) -> bool;
}

impl<T, E> Terminal for ObserverSlot<T, E>
where
    T: Send,
    E: Send,
{
    fn release(&self) -> bool {
        lock_unpoisoned(&self.observer).take().is_some()
    }

    fn is_terminated(&self) -> bool {
        lock_unpoisoned(&self.observer).is_none()
    }
}

/// Terminates the subscription without a notification when the computation
/// never produces an outcome, e.g. because it panicked. There is no `E` to
/// build from a panic payload, so the observer is dropped instead of left
/// waiting forever.
struct ReleaseUnlessCompleted {
    slot: Arc<dyn Terminal>,
    completed: bool,
}

impl ReleaseUnlessCompleted {
    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for ReleaseUnlessCompleted {
    fn drop(&mut self) {
        // After dispose the slot is already empty and release is a no-op.
        if !self.completed && self.slot.release() {
            tracing::warn!("single computation ended without an outcome, subscriber released");
        }
    }
}

/// Handle to a running [`Single`] subscription.
///
/// Dropping it disposes the subscription; call [`Subscription::detach`] to let
/// the work finish unobserved by this handle.
#[must_use = "dropping a Subscription disposes it"]
pub struct Subscription {
    slot: Arc<dyn Terminal>,
    task: AbortHandle,
    detached: bool,
}

impl Subscription {
    /// Detaches the observer and cancels the underlying work.
    ///
    /// Returns false when the subscription had already delivered or been
    /// disposed, in which case nothing is cancelled.
    pub fn dispose(&self) -> bool {
        if !self.slot.release() {
            return false;
        }
        tracing::debug!("single disposed before completion, aborting work");
        self.task.abort();
        true
    }

    /// True once the outcome was delivered or the subscription was disposed.
    pub fn is_terminated(&self) -> bool {
        self.slot.is_terminated()
    }

    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.detached {
            self.dispose();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("terminated", &self.is_terminated())
            .field("detached", &self.detached)
            .finish()
    }
}
