// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{
    collections::{HashMap, VecDeque},
    fmt::{self, Display},
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;
use crate::prelude::{debug, error, warn};

type SyncFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;
type SyncFn<T> = Box<dyn Fn(String, T) -> SyncFuture + Send + Sync>;

struct State<T> {
    order: VecDeque<String>,
    pending: HashMap<String, T>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    available: Notify,
    sync: SyncFn<T>,
    worker_started: AtomicBool,
    worker_done: watch::Sender<bool>,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deduplicating work queue drained by a single worker.
///
/// Every task carries a name and a payload. While a task is pending, enqueuing
/// another task under the same name keeps the pending task's position and
/// replaces its payload with the newer one. Tasks are handed to the `sync`
/// function in FIFO order; its failures are logged and retrying is left to
/// the function itself through [`TaskQueue::requeue`] / [`TaskQueue::requeue_after`].
pub struct TaskQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("TaskQueue")
            .field("pending", &state.order)
            .field("shutting_down", &state.shutting_down)
            .finish_non_exhaustive()
    }
}

/// Non-owning handle to a [`TaskQueue`], handed to `sync` functions built with
/// [`TaskQueue::new_cyclic`] so they can requeue work.
pub struct WeakTaskQueue<T> {
    inner: Weak<Inner<T>>,
}

impl<T> Clone for WeakTaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T> WeakTaskQueue<T> {
    /// The queue, if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<TaskQueue<T>> {
        self.inner.upgrade().map(|inner| TaskQueue { inner })
    }
}

impl<T: Send + 'static> TaskQueue<T> {
    /// Create a queue whose worker calls `sync(name, payload)` for every task.
    pub fn new<F, Fut>(sync: F) -> Self
    where
        F: Fn(String, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self::new_cyclic(move |_| sync)
    }

    /// Create a queue whose `sync` function holds a [`WeakTaskQueue`] back to it.
    pub fn new_cyclic<M, F, Fut>(make_sync: M) -> Self
    where
        M: FnOnce(WeakTaskQueue<T>) -> F,
        F: Fn(String, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let inner = Arc::new_cyclic(|weak| {
            let sync = make_sync(WeakTaskQueue {
                inner: Weak::clone(weak),
            });
            let (worker_done, _) = watch::channel(false);
            Inner {
                state: Mutex::new(State {
                    order: VecDeque::new(),
                    pending: HashMap::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                sync: Box::new(move |name, payload| -> SyncFuture {
                    Box::pin(sync(name, payload))
                }),
                worker_started: AtomicBool::new(false),
                worker_done,
            }
        });
        Self { inner }
    }

    /// A non-owning handle to this queue.
    #[must_use]
    pub fn downgrade(&self) -> WeakTaskQueue<T> {
        WeakTaskQueue {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Add a task. Ignored once [`TaskQueue::shutdown`] has been called.
    pub fn enqueue(&self, name: impl Into<String>, payload: T) {
        let name = name.into();
        let mut state = self.inner.lock();
        if state.shutting_down {
            debug!(task = %name, "task queue is shutting down; dropping task");
            return;
        }
        debug!(task = %name, "enqueueing task");
        if state.pending.insert(name.clone(), payload).is_none() {
            state.order.push_back(name);
        }
        drop(state);
        self.inner.available.notify_one();
    }

    /// Put a failed task back on the queue immediately.
    pub fn requeue(&self, name: impl Into<String>, payload: T, err: &dyn Display) {
        let name = name.into();
        warn!(task = %name, error = %err, "requeuing task");
        self.enqueue(name, payload);
    }

    /// Put a failed task back on the queue once `after` has elapsed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn requeue_after(
        &self,
        name: impl Into<String>,
        payload: T,
        err: &dyn Display,
        after: Duration,
    ) {
        let name = name.into();
        warn!(task = %name, error = %err, after = ?after, "requeuing task after delay");
        let queue = self.downgrade();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(queue) = queue.upgrade() {
                queue.enqueue(name, payload);
            }
        });
    }

    /// Number of pending tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    /// Whether no task is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the single worker until the queue is shut down or `stop` fires.
    ///
    /// If the worker panics it is restarted after `period`. `stop` is only
    /// observed while the queue is idle, so a running `sync` call always
    /// completes. Only the first call runs a worker; later calls return at once.
    pub async fn run(&self, period: Duration, stop: CancellationToken) {
        if self.inner.worker_started.swap(true, Ordering::SeqCst) {
            warn!("task queue worker is already running or the queue is shut down");
            return;
        }
        let _done = WorkerDone(&self.inner.worker_done);

        loop {
            let queue = self.clone();
            let token = stop.clone();
            match tokio::spawn(async move { queue.worker(&token).await }).await {
                Ok(()) => break,
                Err(err) => {
                    error!(error = %err, period = ?period, "task queue worker failed; restarting");
                    tokio::select! {
                        () = stop.cancelled() => break,
                        () = tokio::time::sleep(period) => {}
                    }
                }
            }
        }
    }

    /// Close the queue and wait for the worker to drain the remaining tasks and exit.
    ///
    /// If no worker was ever started, pending tasks are discarded and the
    /// queue can no longer be run.
    pub async fn shutdown(&self) {
        self.inner.lock().shutting_down = true;
        self.inner.available.notify_one();

        if !self.inner.worker_started.swap(true, Ordering::SeqCst) {
            let mut state = self.inner.lock();
            debug!(dropped = state.order.len(), "task queue shut down before a worker ran");
            state.order.clear();
            state.pending.clear();
            return;
        }
        let mut done = self.inner.worker_done.subscribe();
        // The sender lives as long as the queue, so this cannot fail.
        let _ = done.wait_for(|done| *done).await;
    }

    async fn worker(&self, stop: &CancellationToken) {
        loop {
            let next = {
                let mut state = self.inner.lock();
                match state.order.pop_front() {
                    Some(name) => state.pending.remove(&name).map(|payload| (name, payload)),
                    None if state.shutting_down => return,
                    None => None,
                }
            };

            if let Some((name, payload)) = next {
                debug!(task = %name, "dequeueing task");
                if let Err(err) = (self.inner.sync)(name.clone(), payload).await {
                    error!(task = %name, error = %err, "error running task callback");
                }
                continue;
            }

            tokio::select! {
                () = self.inner.available.notified() => {}
                () = stop.cancelled() => return,
            }
        }
    }
}

struct WorkerDone<'a>(&'a watch::Sender<bool>);

impl Drop for WorkerDone<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}
