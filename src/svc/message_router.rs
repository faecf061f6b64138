//! UID-addressed message routing.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use super::error::SvcError;
use crate::core::{Uid, UidRegistry};

// Many shards keep routing lock contention negligible
const NUM_SHARDS: usize = 512;

/// Outcome of a request as observed through its handle or completion
/// message.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RequestStatus {
    Pending = 0,
    /// Handler ran and returned success
    Complete = 1,
    /// Handler ran and returned an error
    Failed = 2,
    /// No handler was registered, or the destination does not exist
    Dropped = 3,
}

const STATUS_MASK: u32 = 0b11;
const WAITER_BIT: u32 = 1 << 8;

/// State shared between a request's sender-side handle and the in-flight
/// message. Holds the payload, the completion status word and the
/// captured handler error.
pub(crate) struct RequestShared {
    status: AtomicU32,
    pub(crate) error: Mutex<Option<anyhow::Error>>,
    pub(crate) payload: Mutex<Box<dyn Any + Send>>,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

impl RequestShared {
    pub(crate) fn new(payload: Box<dyn Any + Send>) -> Self {
        Self {
            status: AtomicU32::new(RequestStatus::Pending as u32),
            error: Mutex::new(None),
            payload: Mutex::new(payload),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        }
    }

    pub(crate) fn status(&self) -> RequestStatus {
        match self.status.load(Ordering::Acquire) & STATUS_MASK {
            0 => RequestStatus::Pending,
            1 => RequestStatus::Complete,
            2 => RequestStatus::Failed,
            _ => RequestStatus::Dropped,
        }
    }

    pub(crate) fn set_status(&self, status: RequestStatus) {
        let old = self.status.fetch_or(status as u32, Ordering::Release);
        debug_assert_eq!(old & STATUS_MASK, 0, "request completed twice");

        if old & WAITER_BIT != 0 {
            let _guard = self.wait_lock.lock();
            self.wait_cv.notify_all();
        }
    }

    pub(crate) fn wait(&self) -> RequestStatus {
        let status = self.status();
        if status != RequestStatus::Pending {
            return status;
        }

        let mut guard = self.wait_lock.lock();
        self.status.fetch_or(WAITER_BIT, Ordering::Release);

        loop {
            let status = self.status();
            if status != RequestStatus::Pending {
                return status;
            }
            self.wait_cv.wait(&mut guard);
        }
    }
}

pub(crate) enum Payload {
    /// Owned payload of a fire-and-forget message
    Owned(Box<dyn Any + Send>),
    /// Payload shared with the sender-side request handle
    Request(Arc<RequestShared>),
}

pub(crate) enum EnvelopeKind {
    Unicast,
    Request { wants_completion: bool },
    Completion,
}

pub(crate) struct Envelope {
    pub(crate) from: Uid,
    pub(crate) msg_uid: Uid,
    pub(crate) kind: EnvelopeKind,
    pub(crate) payload: Payload,
}

/// FIFO inbound queue of one agent.
pub(crate) struct InboundQueue {
    inner: Mutex<VecDeque<Envelope>>,
    cv: Condvar,
}

impl InboundQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, env: Envelope) {
        self.inner.lock().push_back(env);
        self.cv.notify_one();
    }

    /// Pops up to `max` oldest messages into `out`
    pub(crate) fn pop_batch(&self, out: &mut Vec<Envelope>, max: usize) {
        let mut inner = self.inner.lock();
        for _ in 0..max {
            match inner.pop_front() {
                Some(env) => out.push(env),
                None => break,
            }
        }
    }

    /// Blocks until the queue is non-empty; with a timeout of zero the
    /// call returns immediately.
    pub(crate) fn wait(&self, timeout: Option<Duration>) {
        let mut inner = self.inner.lock();
        if !inner.is_empty() {
            return;
        }

        match timeout {
            None => self.cv.wait(&mut inner),
            Some(timeout) => {
                self.cv.wait_for(&mut inner, timeout);
            }
        }
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().clear();
    }
}

struct RoutingShard {
    // Sorted by UID: slow insertions, cache-friendly lookups
    routes: RwLock<Vec<(Uid, Arc<InboundQueue>)>>,
}

impl RoutingShard {
    fn find_route(&self, id: Uid) -> Option<Arc<InboundQueue>> {
        let routes = self.routes.read();
        let index = routes.binary_search_by_key(&id, |route| route.0).ok()?;
        Some(routes[index].1.clone())
    }

    fn add_route(&self, id: Uid, queue: Arc<InboundQueue>) -> bool {
        let mut routes = self.routes.write();
        match routes.binary_search_by_key(&id, |route| route.0) {
            Ok(_) => false,
            Err(index) => {
                routes.insert(index, (id, queue));
                true
            }
        }
    }

    fn remove_route(&self, id: Uid) -> Option<Arc<InboundQueue>> {
        let mut routes = self.routes.write();
        let index = routes.binary_search_by_key(&id, |route| route.0).ok()?;
        Some(routes.remove(index).1)
    }
}

/// Routes agent UIDs to their inbound queues.
pub(crate) struct MessageRouter {
    shards: Vec<RoutingShard>,
    // Queues not assigned to any agent, available for reuse
    free_queues: Mutex<Vec<Arc<InboundQueue>>>,
}

impl MessageRouter {
    pub(crate) fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS)
                .map(|_| RoutingShard {
                    routes: RwLock::new(Vec::new()),
                })
                .collect(),
            free_queues: Mutex::new(Vec::new()),
        }
    }

    fn shard(&self, id: Uid) -> &RoutingShard {
        &self.shards[(id.v1 % NUM_SHARDS as u64) as usize]
    }

    /// Creates (or recycles) an inbound queue and routes `id` to it
    pub(crate) fn register_agent(&self, id: Uid) -> Result<Arc<InboundQueue>, SvcError> {
        let queue = {
            let mut free = self.free_queues.lock();
            free.pop().unwrap_or_else(|| Arc::new(InboundQueue::new()))
        };

        if !self.shard(id).add_route(id, queue.clone()) {
            self.free_queues.lock().push(queue);
            log::error!(
                "messaging agent {} is already registered!",
                UidRegistry::lookup(id)
            );
            return Err(SvcError::AlreadyRegistered(id));
        }

        Ok(queue)
    }

    pub(crate) fn unregister_agent(&self, id: Uid) {
        if let Some(queue) = self.shard(id).remove_route(id) {
            queue.clear();
            self.free_queues.lock().push(queue);
        }
    }

    /// Delivers `env` to the agent routed at `to`; undeliverable
    /// messages are destroyed (requests complete as `Dropped`).
    pub(crate) fn send(&self, to: Uid, env: Envelope) {
        match self.shard(to).find_route(to) {
            Some(queue) => queue.push(env),
            None => self.drop_undeliverable(env),
        }
    }

    fn drop_undeliverable(&self, env: Envelope) {
        if let EnvelopeKind::Request { wants_completion } = env.kind {
            if let Payload::Request(shared) = env.payload {
                self.finish_request(env.from, env.msg_uid, shared, wants_completion,
                    RequestStatus::Dropped);
            }
        }
        // Unicast and completion payloads are destroyed by the drop
    }

    /// Marks the request complete with `status`, waking any handle
    /// waiter, and routes a completion message back to the sender when
    /// one was asked for.
    pub(crate) fn finish_request(
        &self,
        reply_to: Uid,
        msg_uid: Uid,
        shared: Arc<RequestShared>,
        wants_completion: bool,
        status: RequestStatus,
    ) {
        shared.set_status(status);

        if wants_completion {
            self.send(
                reply_to,
                Envelope {
                    from: reply_to,
                    msg_uid,
                    kind: EnvelopeKind::Completion,
                    payload: Payload::Request(shared),
                },
            );
        }
    }
}
