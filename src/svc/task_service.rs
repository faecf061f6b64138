//! Worker thread pool executing tasks with dependency tracking.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::counter_tracker::TaskCounterTracker;
use super::task::{AsyncState, AsyncTask, PendingTask, TaskContext, TaskExec};
use super::task_queue::TaskQueueSet;
use crate::core::Uid;
use crate::util::hash::xxh64_fixed;

// Two major threads are expected outside the pool: sim and render
const THREAD_COUNT_OFFSET: usize = 2;
const MIN_THREAD_COUNT: usize = 2;

// Periodically revisit the local waiting queue during long runs of
// independent tasks so older waiting tasks don't starve
const INDEPENDENT_RUN_LIMIT: usize = 50;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskServiceConfig {
    /// Worker thread count; 0 selects a machine-dependent default
    pub num_threads: usize,
}

impl Default for TaskServiceConfig {
    fn default() -> Self {
        Self { num_threads: 0 }
    }
}

fn patch_config(mut cfg: TaskServiceConfig) -> TaskServiceConfig {
    if cfg.num_threads == 0 {
        let hint = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_THREAD_COUNT + THREAD_COUNT_OFFSET);
        cfg.num_threads = hint.saturating_sub(THREAD_COUNT_OFFSET).max(MIN_THREAD_COUNT);
    }
    cfg
}

/// State shared between the public service handle, worker threads and
/// async-task wakers.
pub(crate) struct ServiceShared {
    pub(crate) tracker: TaskCounterTracker,
    pub(crate) queues: TaskQueueSet,
}

impl ServiceShared {
    /// Assigns a fresh counter and pushes the task onto a queue selected
    /// by hashing the counter with the header address.
    pub(crate) fn enqueue(&self, task: PendingTask) -> u64 {
        let counter = self.tracker.allocate_counter();
        task.header.set_counter(counter);

        let queue = self.select_queue(counter, Arc::as_ptr(&task.header) as usize);
        self.queues.push_task(queue, task);
        counter
    }

    /// Re-queues a woken future under its existing counter
    pub(crate) fn resubmit_async(&self, task: Arc<AsyncTask>) {
        let counter = task.header.counter();
        let queue = self.select_queue(counter, Arc::as_ptr(&task.header) as usize);

        let pending = PendingTask {
            header: task.header.clone(),
            wait_counters: SmallVec::new(),
            exec: TaskExec::Async(task),
        };
        self.queues.push_task(queue, pending);
    }

    fn select_queue(&self, counter: u64, header_addr: usize) -> usize {
        (xxh64_fixed(counter ^ header_addr as u64) % self.queues.num_queues() as u64) as usize
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

fn execute_task(shared: &Arc<ServiceShared>, task: PendingTask) {
    debug_assert!(task.wait_counters.is_empty());

    match task.exec {
        TaskExec::Call(body) => {
            let mut ctx = TaskContext {
                shared: shared.clone(),
                header: task.header.clone(),
            };

            // A panicking body is contained and logged; the task still
            // completes so dependants are not blocked forever
            if let Err(payload) = catch_unwind(AssertUnwindSafe(move || body(&mut ctx))) {
                log::error!(
                    "task {} body panicked: {}",
                    task.header.counter(),
                    panic_message(payload.as_ref())
                );
            }

            task.header.release_pending(&shared.tracker);
        }
        TaskExec::SyncPoint => {
            task.header.release_pending(&shared.tracker);
        }
        TaskExec::Async(async_task) => {
            execute_async_task(shared, async_task);
        }
    }
}

fn execute_async_task(shared: &Arc<ServiceShared>, async_task: Arc<AsyncTask>) {
    let mut future = {
        let mut state = async_task.state.lock();
        match std::mem::replace(&mut *state, AsyncState::Polling { notified: false }) {
            AsyncState::Queued(future) => future,
            other => {
                // Spurious execution, nothing to poll
                *state = other;
                return;
            }
        }
    };

    let waker = Waker::from(async_task.clone());
    let mut cx = Context::from_waker(&waker);

    let poll = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

    match poll {
        Err(payload) => {
            log::error!(
                "task {} future panicked: {}",
                async_task.header.counter(),
                panic_message(payload.as_ref())
            );
            *async_task.state.lock() = AsyncState::Done;
            async_task.header.release_pending(&shared.tracker);
        }
        Ok(Poll::Ready(())) => {
            *async_task.state.lock() = AsyncState::Done;
            async_task.header.release_pending(&shared.tracker);
        }
        Ok(Poll::Pending) => {
            let resubmit = {
                let mut state = async_task.state.lock();
                let notified = matches!(*state, AsyncState::Polling { notified: true });
                if notified {
                    *state = AsyncState::Queued(future);
                } else {
                    *state = AsyncState::Idle(future);
                }
                notified
            };

            if resubmit {
                // A wake arrived while polling, go around again
                shared.resubmit_async(async_task);
            }
        }
    }
}

/// Updates wait status of all locally parked tasks and executes the ones
/// that became ready, preserving the order of the rest.
fn try_drain_local(shared: &Arc<ServiceShared>, waiting: &mut Vec<PendingTask>) {
    let drained = std::mem::take(waiting);

    for mut task in drained {
        let remaining = shared.tracker.trim_complete_counters(&mut task.wait_counters);
        task.wait_counters.truncate(remaining);

        if remaining == 0 {
            execute_task(shared, task);
        } else {
            waiting.push(task);
        }
    }
}

fn worker_thread(shared: Arc<ServiceShared>, my_queue: usize) {
    // Waiting tasks are parked locally to not clog the bounded ring.
    // Earlier waiting tasks may be dependencies of later ones, so drains
    // go in FIFO order.
    let mut local_waiting: Vec<PendingTask> = Vec::new();
    let mut executed_independent = 0usize;

    let mut next_task = shared.queues.pop_task_or_wait(my_queue);

    // A null pop means the stop flag was raised
    while let Some(task) = next_task {
        if !task.wait_counters.is_empty() {
            local_waiting.push(task);
            try_drain_local(&shared, &mut local_waiting);
        } else {
            execute_task(&shared, task);

            executed_independent += 1;
            if !local_waiting.is_empty() && executed_independent > INDEPENDENT_RUN_LIMIT {
                try_drain_local(&shared, &mut local_waiting);
                executed_independent = 0;
            }
        }

        if local_waiting.is_empty() {
            next_task = shared.queues.pop_task_or_wait(my_queue);
            continue;
        }

        // Can't sleep while holding waiting tasks: they might be what
        // other threads (or queued tasks) are waiting on. Alternate
        // between draining and non-blocking pops until one side is done.
        next_task = shared.queues.try_pop_task(my_queue);
        while next_task.is_none() && !local_waiting.is_empty() {
            if shared.queues.stop_requested() {
                // Dependencies may never complete now, drop the leftovers
                local_waiting.clear();
                break;
            }

            try_drain_local(&shared, &mut local_waiting);
            std::thread::yield_now();
            next_task = shared.queues.try_pop_task(my_queue);
        }

        if next_task.is_none() && local_waiting.is_empty() {
            next_task = shared.queues.pop_task_or_wait(my_queue);
        }
    }
}

/// Multi-producer task scheduler with dependency tracking and
/// continuation semantics. See [`TaskBuilder`](super::TaskBuilder) for
/// the submission interface.
pub struct TaskService {
    shared: Arc<ServiceShared>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskService {
    pub const SERVICE_UID: Uid = Uid::parse("9c1e8f02-6b41ad77-c58e02d1-7ab0f334");

    pub fn new(cfg: TaskServiceConfig) -> Self {
        let cfg = patch_config(cfg);

        let shared = Arc::new(ServiceShared {
            tracker: TaskCounterTracker::new(),
            queues: TaskQueueSet::new(cfg.num_threads),
        });

        log::info!("Starting task service with {} threads", cfg.num_threads);

        let mut workers = Vec::with_capacity(cfg.num_threads);
        for i in 0..cfg.num_threads {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("task-worker-{i}"))
                .spawn(move || worker_thread(shared, i))
                .expect("failed to spawn task worker thread");
            workers.push(handle);
        }

        Self { shared, workers }
    }

    /// Drops already-completed counters from the set; returns how many
    /// remain at the front of the slice.
    pub fn eliminate_completed_wait_counters(&self, counters: &mut [u64]) -> usize {
        self.shared.tracker.trim_complete_counters(counters)
    }

    pub fn is_counter_complete(&self, counter: u64) -> bool {
        self.shared.tracker.is_counter_complete(counter)
    }

    pub(crate) fn shared(&self) -> &Arc<ServiceShared> {
        &self.shared
    }
}

impl super::service_locator::NamedService for TaskService {
    const SERVICE_UID: Uid = TaskService::SERVICE_UID;
}

impl Drop for TaskService {
    fn drop(&mut self) {
        log::info!("Stopping task service");
        self.shared.queues.request_stop_all();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
