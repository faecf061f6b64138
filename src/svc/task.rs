//! Task objects, handles and execution context.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::Wake;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use super::counter_tracker::TaskCounterTracker;
use super::task_service::ServiceShared;

const FINISHED_BIT: u32 = 1 << 0;
const WAITERS_BIT: u32 = 1 << 1;
// Pending units (the body itself plus one per live continuation) occupy
// the remaining bits
const PENDING_ONE: u32 = 1 << 2;
const PENDING_MASK: u32 = !(FINISHED_BIT | WAITERS_BIT);

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Shared control block of one task.
///
/// The control word tracks the finished flag, a waiter flag, and the
/// pending-unit count. A task is finished only when every pending unit is
/// gone: its own body has returned and every continuation spawned from it
/// has itself finished.
pub struct TaskHeader {
    word: AtomicU32,
    counter: AtomicU64,
    parent: Option<Arc<TaskHeader>>,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

impl TaskHeader {
    /// `parent` links a continuation to the task it was spawned from and
    /// extends the parent's pending count.
    pub(crate) fn new(parent: Option<Arc<TaskHeader>>) -> Self {
        if let Some(parent) = &parent {
            parent.word.fetch_add(PENDING_ONE, Ordering::Relaxed);
        }

        Self {
            word: AtomicU32::new(PENDING_ONE),
            counter: AtomicU64::new(0),
            parent,
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        }
    }

    pub(crate) fn set_counter(&self, counter: u64) {
        self.counter.store(counter, Ordering::Relaxed);
    }

    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    pub fn finished(&self) -> bool {
        self.word.load(Ordering::Acquire) & FINISHED_BIT != 0
    }

    pub fn wait(&self) {
        if self.finished() {
            return;
        }

        let mut guard = self.wait_lock.lock();
        self.word.fetch_or(WAITERS_BIT, Ordering::Release);

        while self.word.load(Ordering::Acquire) & FINISHED_BIT == 0 {
            self.wait_cv.wait(&mut guard);
        }
    }

    fn finish(&self, tracker: &TaskCounterTracker) {
        let need_wake = self.word.fetch_or(FINISHED_BIT, Ordering::Release) & WAITERS_BIT != 0;

        // Mark the counter complete before waking: dependants observe the
        // task as formally complete the moment a waiter resumes
        tracker.complete_counter(self.counter());

        if need_wake {
            // The handle can be shared, wake every waiter
            let _guard = self.wait_lock.lock();
            self.wait_cv.notify_all();
        }

        if let Some(parent) = &self.parent {
            parent.release_pending(tracker);
        }
    }

    /// Releases one pending unit; finishing the last unit completes the
    /// task and propagates to the parent chain.
    pub(crate) fn release_pending(&self, tracker: &TaskCounterTracker) {
        let old = self.word.fetch_sub(PENDING_ONE, Ordering::AcqRel);
        debug_assert_ne!(old & PENDING_MASK, 0);

        if old & PENDING_MASK == PENDING_ONE {
            self.finish(tracker);
        }
    }
}

/// Shared refcounted reference to a task.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) header: Arc<TaskHeader>,
}

impl TaskHandle {
    /// Non-blocking completion query
    pub fn finished(&self) -> bool {
        self.header.finished()
    }

    /// Blocks until the task and all its continuations have finished
    pub fn wait(&self) {
        self.header.wait();
    }

    /// Completion counter assigned at submission
    pub fn counter(&self) -> u64 {
        self.header.counter()
    }
}

/// The executable payload of a task.
pub(crate) enum TaskExec {
    Call(Box<dyn FnOnce(&mut TaskContext) + Send + 'static>),
    Async(Arc<AsyncTask>),
    /// Empty task used purely as a dependency join point
    SyncPoint,
}

/// A task travelling through the queue set towards execution.
pub(crate) struct PendingTask {
    pub(crate) header: Arc<TaskHeader>,
    pub(crate) wait_counters: SmallVec<[u64; 8]>,
    pub(crate) exec: TaskExec,
}

pub(crate) enum AsyncState {
    /// A `PendingTask` referencing this future is queued for execution
    Queued(BoxFuture),
    /// A worker is currently polling; `notified` records wakes that
    /// arrived during the poll
    Polling { notified: bool },
    /// Parked until a waker fires
    Idle(BoxFuture),
    Done,
}

/// Control block of a suspended-future task. Doubles as its own waker:
/// waking a parked future re-submits it to the task service.
pub(crate) struct AsyncTask {
    pub(crate) shared: Weak<ServiceShared>,
    pub(crate) header: Arc<TaskHeader>,
    pub(crate) state: Mutex<AsyncState>,
}

impl Wake for AsyncTask {
    fn wake(self: Arc<Self>) {
        let resubmit = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, AsyncState::Done) {
                AsyncState::Idle(future) => {
                    *state = AsyncState::Queued(future);
                    true
                }
                AsyncState::Polling { .. } => {
                    *state = AsyncState::Polling { notified: true };
                    false
                }
                other => {
                    // Queued or Done: the wake is already accounted for
                    *state = other;
                    false
                }
            }
        };

        if resubmit {
            if let Some(shared) = self.shared.upgrade() {
                shared.resubmit_async(self.clone());
            }
        }
    }
}

/// Execution context handed to every running task body.
pub struct TaskContext {
    pub(crate) shared: Arc<ServiceShared>,
    pub(crate) header: Arc<TaskHeader>,
}

impl TaskContext {
    /// Counter of the currently executing task
    pub fn task_counter(&self) -> u64 {
        self.header.counter()
    }
}
