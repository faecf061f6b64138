//! Task submission interface.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::task::{AsyncState, AsyncTask, PendingTask, TaskContext, TaskExec, TaskHandle, TaskHeader};
use super::task_service::{ServiceShared, TaskService};

// Past this many wait counters the set is eagerly trimmed against the
// tracker before allocation
const TRIM_THRESHOLD: usize = 32;
// Hard cap, far above anything a sane workload produces
const MAX_WAIT_COUNTERS: usize = 1 << 15;

/// Collects wait counters and submits tasks.
///
/// A builder constructed from a [`TaskContext`] makes every submitted
/// task a *continuation* of the currently executing one: the outer task
/// does not finish until the continuation (and its own continuations)
/// finish.
///
/// Wait counters accumulate until the next `enqueue_*` call and apply to
/// that task only.
pub struct TaskBuilder {
    shared: Arc<ServiceShared>,
    wait_counters: SmallVec<[u64; 8]>,
    parent: Option<Arc<TaskHeader>>,
    last_task_counter: u64,
}

impl TaskBuilder {
    pub fn new(service: &TaskService) -> Self {
        Self {
            shared: service.shared().clone(),
            wait_counters: SmallVec::new(),
            parent: None,
            last_task_counter: 0,
        }
    }

    /// Tasks submitted through this builder become continuations of the
    /// task executing `ctx`.
    pub fn from_context(ctx: &TaskContext) -> Self {
        Self {
            shared: ctx.shared.clone(),
            wait_counters: SmallVec::new(),
            parent: Some(ctx.header.clone()),
            last_task_counter: 0,
        }
    }

    /// The next task will not start until this counter completes
    pub fn add_wait(&mut self, counter: u64) {
        self.wait_counters.push(counter);
    }

    pub fn add_wait_many(&mut self, counters: &[u64]) {
        self.wait_counters.extend_from_slice(counters);
    }

    /// Counter of the most recently enqueued task
    pub fn last_task_counter(&self) -> u64 {
        self.last_task_counter
    }

    pub fn enqueue_task<F>(&mut self, body: F)
    where
        F: FnOnce(&mut TaskContext) + Send + 'static,
    {
        let task = self.make_pending(|_| TaskExec::Call(Box::new(body)));
        self.last_task_counter = self.shared.enqueue(task);
    }

    pub fn enqueue_task_with_handle<F>(&mut self, body: F) -> TaskHandle
    where
        F: FnOnce(&mut TaskContext) + Send + 'static,
    {
        let task = self.make_pending(|_| TaskExec::Call(Box::new(body)));
        let handle = TaskHandle {
            header: task.header.clone(),
        };
        self.last_task_counter = self.shared.enqueue(task);
        handle
    }

    /// Submits a suspendable task. The task finishes only when the
    /// future returns, not when it first suspends.
    pub fn enqueue_async<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = self.make_async_pending(future);
        self.last_task_counter = self.shared.enqueue(task);
    }

    pub fn enqueue_async_with_handle<F>(&mut self, future: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = self.make_async_pending(future);
        let handle = TaskHandle {
            header: task.header.clone(),
        };
        self.last_task_counter = self.shared.enqueue(task);
        handle
    }

    /// Submits an empty task, useful purely as a join point for the
    /// accumulated wait counters.
    pub fn enqueue_sync_point(&mut self) -> TaskHandle {
        let task = self.make_pending(|_| TaskExec::SyncPoint);
        let handle = TaskHandle {
            header: task.header.clone(),
        };
        self.last_task_counter = self.shared.enqueue(task);
        handle
    }

    fn take_wait_counters(&mut self) -> SmallVec<[u64; 8]> {
        // Zero counters are trivially complete
        self.wait_counters.retain(|&mut c| c != 0);

        if self.wait_counters.len() > TRIM_THRESHOLD {
            let remaining = self
                .shared
                .tracker
                .trim_complete_counters(&mut self.wait_counters);
            self.wait_counters.truncate(remaining);
        }

        assert!(
            self.wait_counters.len() <= MAX_WAIT_COUNTERS,
            "too many wait counters on one task"
        );

        std::mem::take(&mut self.wait_counters)
    }

    fn make_pending<F>(&mut self, make_exec: F) -> PendingTask
    where
        F: FnOnce(&Arc<TaskHeader>) -> TaskExec,
    {
        let wait_counters = self.take_wait_counters();
        let header = Arc::new(TaskHeader::new(self.parent.clone()));
        let exec = make_exec(&header);

        PendingTask {
            header,
            wait_counters,
            exec,
        }
    }

    fn make_async_pending<F>(&mut self, future: F) -> PendingTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shared = Arc::downgrade(&self.shared);
        self.make_pending(move |header| {
            TaskExec::Async(Arc::new(AsyncTask {
                shared,
                header: header.clone(),
                state: Mutex::new(AsyncState::Queued(Box::pin(future))),
            }))
        })
    }
}
