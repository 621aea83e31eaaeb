use futures::{future::BoxFuture, FutureExt};
use ng_gateway_sdk::{DriverError, DriverResult};
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::{runtime::Handle, sync::oneshot};

pub type TaskFactory = Box<dyn FnOnce() -> BoxFuture<'static, DriverResult<()>> + Send>;
pub type FailureHandler = Arc<dyn Fn(DriverError) + Send + Sync>;

/// Runs at most one task at a time for its owner.
///
/// Tasks submitted while another one runs are buffered; when the running task
/// completes the most recently submitted buffered task starts next. A failed
/// task is reported to the failure handler and never stops the queue.
pub struct SerialTaskQueue {
    state: Arc<Mutex<QueueState>>,
    runtime: Handle,
}

struct QueueState {
    pending: Vec<TaskFactory>,
    running: bool,
    shut_down: bool,
    failure_handler: Option<FailureHandler>,
}

#[inline]
fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl SerialTaskQueue {
    /// Must be called from within a tokio runtime.
    pub fn new(failure_handler: Option<FailureHandler>) -> Self {
        Self::with_handle(Handle::current(), failure_handler)
    }

    pub fn with_handle(runtime: Handle, failure_handler: Option<FailureHandler>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                pending: Vec::new(),
                running: false,
                shut_down: false,
                failure_handler,
            })),
            runtime,
        }
    }

    /// Enqueue a task. Returns `false` when the queue has been shut down.
    pub fn submit<F, Fut>(&self, task: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DriverResult<()>> + Send + 'static,
    {
        let factory: TaskFactory = Box::new(move || task().boxed());
        let start_now = {
            let mut state = lock(&self.state);
            if state.shut_down {
                tracing::debug!("task rejected, queue is shut down");
                return false;
            }
            if state.running {
                state.pending.push(factory);
                None
            } else {
                state.running = true;
                Some(factory)
            }
        };
        if let Some(factory) = start_now {
            self.runtime.spawn(drive(Arc::clone(&self.state), factory));
        }
        true
    }

    /// Drop every buffered task and run `final_task` as the last task of this queue.
    ///
    /// The failure handler is no longer invoked and further submissions are
    /// rejected. The returned future resolves with the final task's result.
    pub fn shutdown<F, Fut>(&self, final_task: F) -> BoxFuture<'static, DriverResult<()>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DriverResult<()>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let factory: TaskFactory = Box::new(move || {
            async move {
                let result = final_task().await;
                let _ = tx.send(result);
                Ok(())
            }
            .boxed()
        });
        let start_now = {
            let mut state = lock(&self.state);
            if state.shut_down {
                tracing::debug!("queue already shut down");
                return futures::future::ready(Ok(())).boxed();
            }
            state.shut_down = true;
            state.failure_handler = None;
            let dropped = state.pending.len();
            state.pending.clear();
            if dropped > 0 {
                tracing::debug!(dropped, "dropped pending tasks on shutdown");
            }
            if state.running {
                state.pending.push(factory);
                None
            } else {
                state.running = true;
                Some(factory)
            }
        };
        if let Some(factory) = start_now {
            self.runtime.spawn(drive(Arc::clone(&self.state), factory));
        }
        async move {
            rx.await.unwrap_or_else(|_| {
                Err(DriverError::TaskFailure(
                    "final task did not complete".to_string(),
                ))
            })
        }
        .boxed()
    }

    #[inline]
    pub fn is_shut_down(&self) -> bool {
        lock(&self.state).shut_down
    }

    /// True when no task is running or buffered.
    #[inline]
    pub fn is_idle(&self) -> bool {
        let state = lock(&self.state);
        !state.running && state.pending.is_empty()
    }
}

async fn drive(state: Arc<Mutex<QueueState>>, mut factory: TaskFactory) {
    loop {
        let result = match AssertUnwindSafe(factory()).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(DriverError::TaskFailure("queued task panicked".to_string())),
        };
        if let Err(e) = result {
            let handler = {
                let state = lock(&state);
                if state.shut_down {
                    None
                } else {
                    state.failure_handler.clone()
                }
            };
            match handler {
                Some(handler) => {
                    tracing::warn!(error = %e, "queued task failed");
                    handler(e);
                }
                None => tracing::debug!(error = %e, "queued task failed after shutdown"),
            }
        }
        factory = {
            let mut state = lock(&state);
            match state.pending.pop() {
                Some(next) => next,
                None => {
                    state.running = false;
                    return;
                }
            }
        };
    }
}
