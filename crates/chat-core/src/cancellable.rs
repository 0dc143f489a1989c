use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::warn;

type CancelAction = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    cancelled: AtomicBool,
    action: Mutex<Option<CancelAction>>,
}

/// Handle for one subscription, timer or background task.
///
/// `cancel` runs the cleanup at most once no matter how many clones call it
/// or from which thread. A panicking cleanup is contained and logged.
#[derive(Clone)]
pub struct Cancellable {
    inner: Arc<Inner>,
}

impl Cancellable {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                action: Mutex::new(Some(Box::new(action))),
            }),
        }
    }

    /// Handle with nothing to clean up.
    pub fn noop() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                action: Mutex::new(None),
            }),
        }
    }

    /// Abort a spawned task on cancel.
    pub fn from_task<T: Send + 'static>(task: tokio::task::JoinHandle<T>) -> Self {
        Self::new(move || task.abort())
    }

    /// Cancel every member. Members that are already cancelled are skipped.
    pub fn compound(members: impl IntoIterator<Item = Cancellable>) -> Self {
        let members: Vec<Cancellable> = members.into_iter().collect();
        Self::new(move || {
            for member in members {
                member.cancel();
            }
        })
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let action = self
            .inner
            .action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(action) = action
            && catch_unwind(AssertUnwindSafe(action)).is_err()
        {
            warn!("cancellation cleanup panicked; ignoring");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellable")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
