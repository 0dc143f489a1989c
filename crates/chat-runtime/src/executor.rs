use std::{
    cell::Cell,
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
};

use chat_core::Cancellable;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static ON_FOREGROUND: Cell<bool> = const { Cell::new(false) };
}

/// The two execution contexts of the runtime.
///
/// Foreground jobs run one at a time, in post order, on a single drain task;
/// listener callbacks are delivered there. Background work (network calls,
/// retries, long waits) is spawned freely on the tokio runtime.
#[derive(Clone, Debug)]
pub struct Executors {
    foreground: mpsc::UnboundedSender<Job>,
    background: Handle,
}

impl Executors {
    /// Start the foreground drain task on `handle`.
    pub fn start(handle: Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                ON_FOREGROUND.with(|flag| flag.set(true));
                let outcome = catch_unwind(AssertUnwindSafe(job));
                ON_FOREGROUND.with(|flag| flag.set(false));
                if outcome.is_err() {
                    warn!("foreground job panicked; continuing");
                }
            }
        });
        Self {
            foreground: tx,
            background: handle,
        }
    }

    /// Whether the caller is a job running on a foreground context.
    pub fn on_foreground() -> bool {
        ON_FOREGROUND.with(Cell::get)
    }

    /// Start on the runtime of the calling task.
    pub fn current() -> Self {
        Self::start(Handle::current())
    }

    /// Queue `job` on the foreground context.
    pub fn post_foreground(&self, job: impl FnOnce() + Send + 'static) {
        if self.foreground.send(Box::new(job)).is_err() {
            warn!("foreground context stopped; dropping job");
        }
    }

    /// Run `future` on the background context.
    pub fn spawn_background<F>(&self, future: F) -> Cancellable
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Cancellable::from_task(self.background.spawn(future))
    }

    /// Run a blocking call (remote service, transport connect) off the
    /// async workers.
    pub fn run_blocking<T, F>(&self, call: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.background.spawn_blocking(call)
    }

    /// Resolves once every job posted before this call has run.
    pub async fn foreground_idle(&self) {
        let (tx, rx) = oneshot::channel();
        self.post_foreground(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}
