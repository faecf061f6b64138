//! Per-worker bounded task queues with a shared stop signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Select, Sender, TrySendError};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::task::PendingTask;

/// Ring capacity of every per-worker queue
pub const QUEUE_CAPACITY: usize = 256;

const OVERFLOW_WARN_INTERVAL: Duration = Duration::from_secs(5);
const OVERFLOW_STALL: Duration = Duration::from_micros(100);

static LAST_OVERFLOW_WARN: Lazy<Mutex<Option<Instant>>> = Lazy::new(|| Mutex::new(None));

fn on_queue_overflow(queue: usize) {
    {
        let mut last = LAST_OVERFLOW_WARN.lock();
        let now = Instant::now();

        let should_warn = match *last {
            None => true,
            Some(at) => now.duration_since(at) > OVERFLOW_WARN_INTERVAL,
        };

        if should_warn {
            *last = Some(now);
            log::warn!(
                "task queue #{queue} is overflown! Check ring buffer sizes and load distribution."
            );
            log::warn!("This means worker threads are overwhelmed, and performance will be severely harmed.");
        }
    }

    // Throttle task generation and give workers time to catch up
    std::thread::sleep(OVERFLOW_STALL);
}

/// One bounded MPMC queue per worker thread, plus a process-wide stop
/// signal that is observed by all consumers and is final.
///
/// A pushed task is received by exactly one consumer; no duplication, no
/// loss. A producer hitting a full queue stalls (with a rate-limited
/// warning) until space frees up.
pub struct TaskQueueSet {
    senders: Vec<Sender<PendingTask>>,
    receivers: Vec<Receiver<PendingTask>>,
    stop_requested: AtomicBool,
    // Dropping this sender disconnects `stop_rx`, waking all sleepers
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
}

impl TaskQueueSet {
    pub fn new(num_queues: usize) -> Self {
        let mut senders = Vec::with_capacity(num_queues);
        let mut receivers = Vec::with_capacity(num_queues);

        for _ in 0..num_queues {
            let (tx, rx) = bounded(QUEUE_CAPACITY);
            senders.push(tx);
            receivers.push(rx);
        }

        let (stop_tx, stop_rx) = bounded(0);

        Self {
            senders,
            receivers,
            stop_requested: AtomicBool::new(false),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
        }
    }

    pub fn num_queues(&self) -> usize {
        self.senders.len()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Blocks until the task is enqueued. Stalls with a warning while the
    /// target queue is at capacity.
    pub fn push_task(&self, queue: usize, mut task: PendingTask) {
        loop {
            match self.senders[queue].try_send(task) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    task = returned;
                    on_queue_overflow(queue);
                }
                Err(TrySendError::Disconnected(_)) => {
                    // Queue set is being torn down, drop the task
                    return;
                }
            }
        }
    }

    /// Non-blocking pop; `None` when the queue is empty or stopped
    pub fn try_pop_task(&self, queue: usize) -> Option<PendingTask> {
        if self.stop_requested() {
            return None;
        }
        self.receivers[queue].try_recv().ok()
    }

    /// Blocking pop; `None` only when a stop was requested
    pub fn pop_task_or_wait(&self, queue: usize) -> Option<PendingTask> {
        if self.stop_requested() {
            return None;
        }

        let task_rx = &self.receivers[queue];
        let mut select = Select::new();
        let task_idx = select.recv(task_rx);
        let stop_idx = select.recv(&self.stop_rx);

        loop {
            let op = select.select();
            match op.index() {
                i if i == task_idx => {
                    let task = op.recv(task_rx).ok();
                    if self.stop_requested() {
                        // Stop raced the receive; stop is final, the task
                        // is dropped like any other queued leftover
                        return None;
                    }
                    if task.is_some() {
                        return task;
                    }
                }
                i if i == stop_idx => {
                    // Only disconnects (= stop request), nothing is sent
                    let _ = op.recv(&self.stop_rx);
                    return None;
                }
                _ => unreachable!(),
            }
        }
    }

    /// Raises the stop flag on every queue and wakes all waiting
    /// consumers. Irreversible.
    pub fn request_stop_all(&self) {
        self.stop_requested.store(true, Ordering::Release);
        // Disconnect the stop channel to wake everyone
        self.stop_tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::task::{TaskExec, TaskHeader};
    use std::sync::Arc;

    fn dummy_task() -> PendingTask {
        PendingTask {
            header: Arc::new(TaskHeader::new(None)),
            wait_counters: Default::default(),
            exec: TaskExec::SyncPoint,
        }
    }

    #[test]
    fn test_push_pop_single() {
        let set = TaskQueueSet::new(2);
        assert!(set.try_pop_task(0).is_none());

        set.push_task(0, dummy_task());
        assert!(set.try_pop_task(1).is_none());
        assert!(set.try_pop_task(0).is_some());
        assert!(set.try_pop_task(0).is_none());
    }

    #[test]
    fn test_exactly_once_delivery() {
        let set = Arc::new(TaskQueueSet::new(1));

        for _ in 0..100 {
            set.push_task(0, dummy_task());
        }

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let set = set.clone();
            consumers.push(std::thread::spawn(move || {
                let mut popped = 0usize;
                while set.try_pop_task(0).is_some() {
                    popped += 1;
                }
                popped
            }));
        }

        let total: usize = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_stop_wakes_waiters() {
        let set = Arc::new(TaskQueueSet::new(1));

        let waiter = {
            let set = set.clone();
            std::thread::spawn(move || set.pop_task_or_wait(0))
        };

        std::thread::sleep(Duration::from_millis(50));
        set.request_stop_all();

        assert!(waiter.join().unwrap().is_none());
        // Stop is final
        set.push_task(0, dummy_task());
        assert!(set.pop_task_or_wait(0).is_none());
        assert!(set.try_pop_task(0).is_none());
    }

    #[test]
    fn test_pop_or_wait_receives_late_push() {
        let set = Arc::new(TaskQueueSet::new(1));

        let waiter = {
            let set = set.clone();
            std::thread::spawn(move || set.pop_task_or_wait(0))
        };

        std::thread::sleep(Duration::from_millis(20));
        set.push_task(0, dummy_task());
        assert!(waiter.join().unwrap().is_some());
    }
}
