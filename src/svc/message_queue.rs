//! Per-agent message queues with typed handlers.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{MappedMutexGuard, MutexGuard};
use thiserror::Error;

use super::error::SvcError;
use super::message_router::{
    Envelope, EnvelopeKind, InboundQueue, MessageRouter, Payload, RequestShared,
};
pub use super::message_router::RequestStatus;
use crate::core::Uid;

// Messages are popped in small batches to take the queue lock less often
const POP_BATCH_SIZE: usize = 8;

/// A typed message with a process-wide identity.
pub trait Message: Send + 'static {
    const MESSAGE_UID: Uid;
}

/// Captured failure of a request handler.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct RequestError(pub String);

/// Delivery metadata passed to message handlers.
pub struct MessageInfo {
    sender: Uid,
}

impl MessageInfo {
    pub fn sender_uid(&self) -> Uid {
        self.sender
    }
}

/// Passed to completion handlers when a request finishes.
pub struct RequestCompletionInfo {
    shared: Arc<RequestShared>,
}

impl RequestCompletionInfo {
    pub fn status(&self) -> RequestStatus {
        self.shared.status()
    }

    /// Propagates the handler failure captured in the request, if any.
    /// The error is moved out; a second call returns `Ok`.
    pub fn rethrow_if_failed(&self) -> Result<(), RequestError> {
        match self.shared.error.lock().take() {
            Some(error) => Err(RequestError(error.to_string())),
            None => Ok(()),
        }
    }
}

/// Sender-side handle of an in-flight request.
pub struct RequestHandle<M: Message> {
    shared: Arc<RequestShared>,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Message> RequestHandle<M> {
    pub fn status(&self) -> RequestStatus {
        self.shared.status()
    }

    /// Blocks until the request leaves the `Pending` state
    pub fn wait(&self) -> RequestStatus {
        self.shared.wait()
    }

    pub fn rethrow_if_failed(&self) -> Result<(), RequestError> {
        match self.shared.error.lock().take() {
            Some(error) => Err(RequestError(error.to_string())),
            None => Ok(()),
        }
    }

    /// Access to the (possibly handler-modified) payload
    pub fn payload(&self) -> MappedMutexGuard<'_, M> {
        MutexGuard::map(self.shared.payload.lock(), |payload| {
            payload.downcast_mut::<M>().expect("request payload type mismatch")
        })
    }
}

/// Pure sending endpoint. Unlike [`MessageQueue`] it has no inbound
/// queue, so it can be cloned freely and used from task workers.
#[derive(Clone)]
pub struct MessageSender {
    router: Arc<MessageRouter>,
    my_uid: Uid,
}

impl std::fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender").field("my_uid", &self.my_uid).finish()
    }
}

impl MessageSender {
    pub fn uid(&self) -> Uid {
        self.my_uid
    }

    /// Fire-and-forget send; silently dropped if `to` is not registered
    pub fn send<M: Message>(&self, to: Uid, msg: M) {
        self.router.send(
            to,
            Envelope {
                from: self.my_uid,
                msg_uid: M::MESSAGE_UID,
                kind: EnvelopeKind::Unicast,
                payload: Payload::Owned(Box::new(msg)),
            },
        );
    }
}

type HandlerFn = Box<dyn FnMut(&mut dyn Any, &MessageInfo) -> anyhow::Result<()> + Send>;
type CompletionFn = Box<dyn FnMut(&mut dyn Any, &RequestCompletionInfo) + Send>;

/// Inbound queue plus handler registry of one messaging agent.
///
/// All handler invocations happen inside `poll_messages` /
/// `wait_messages` on the calling thread, serially and in FIFO order.
pub struct MessageQueue {
    sender: MessageSender,
    queue: Arc<InboundQueue>,
    // Sorted by message UID: slow insertions, fast lookups
    handlers: Vec<(Uid, HandlerFn)>,
    completion_handlers: Vec<(Uid, CompletionFn)>,
}

impl MessageQueue {
    fn find<T>(list: &mut [(Uid, T)], uid: Uid) -> Option<&mut T> {
        let index = list.binary_search_by_key(&uid, |entry| entry.0).ok()?;
        Some(&mut list[index].1)
    }

    fn insert<T>(list: &mut Vec<(Uid, T)>, uid: Uid, value: T) {
        match list.binary_search_by_key(&uid, |entry| entry.0) {
            Ok(index) => list[index].1 = value,
            Err(index) => list.insert(index, (uid, value)),
        }
    }

    /// Registers (or replaces) the handler for `M`. For requests the
    /// handler's `Err` is captured into the request and reported as
    /// `Failed`; for plain messages it is logged.
    pub fn register_handler<M, F>(&mut self, mut handler: F)
    where
        M: Message,
        F: FnMut(&mut M, &MessageInfo) -> anyhow::Result<()> + Send + 'static,
    {
        let wrapped: HandlerFn = Box::new(move |payload, info| {
            let msg = payload.downcast_mut::<M>().expect("message payload type mismatch");
            handler(msg, info)
        });
        Self::insert(&mut self.handlers, M::MESSAGE_UID, wrapped);
    }

    pub fn unregister_handler<M: Message>(&mut self) {
        if let Ok(index) = self.handlers.binary_search_by_key(&M::MESSAGE_UID, |e| e.0) {
            self.handlers.remove(index);
        }
    }

    /// Registers the handler receiving completion notifications of
    /// requests previously sent with `request_with_completion::<M>`.
    pub fn register_completion_handler<M, F>(&mut self, mut handler: F)
    where
        M: Message,
        F: FnMut(&mut M, &RequestCompletionInfo) + Send + 'static,
    {
        let wrapped: CompletionFn = Box::new(move |payload, info| {
            let msg = payload.downcast_mut::<M>().expect("message payload type mismatch");
            handler(msg, info)
        });
        Self::insert(&mut self.completion_handlers, M::MESSAGE_UID, wrapped);
    }

    pub fn unregister_completion_handler<M: Message>(&mut self) {
        if let Ok(index) = self
            .completion_handlers
            .binary_search_by_key(&M::MESSAGE_UID, |e| e.0)
        {
            self.completion_handlers.remove(index);
        }
    }

    pub fn send<M: Message>(&self, to: Uid, msg: M) {
        self.sender.send(to, msg);
    }

    pub fn sender(&self) -> &MessageSender {
        &self.sender
    }

    /// Sends a request and returns a handle tracking its completion.
    /// Requests to unrouted UIDs complete as `Dropped` with the payload
    /// untouched.
    pub fn request_with_handle<M: Message>(&self, to: Uid, msg: M) -> RequestHandle<M> {
        let shared = Arc::new(RequestShared::new(Box::new(msg)));

        self.sender.router.send(
            to,
            Envelope {
                from: self.sender.my_uid,
                msg_uid: M::MESSAGE_UID,
                kind: EnvelopeKind::Request {
                    wants_completion: false,
                },
                payload: Payload::Request(shared.clone()),
            },
        );

        RequestHandle {
            shared,
            _marker: PhantomData,
        }
    }

    /// Sends a request whose completion is delivered back to this agent
    /// as a message handled by the registered completion handler.
    pub fn request_with_completion<M: Message>(&self, to: Uid, msg: M) {
        let shared = Arc::new(RequestShared::new(Box::new(msg)));

        self.sender.router.send(
            to,
            Envelope {
                from: self.sender.my_uid,
                msg_uid: M::MESSAGE_UID,
                kind: EnvelopeKind::Request {
                    wants_completion: true,
                },
                payload: Payload::Request(shared),
            },
        );
    }

    /// Drains and dispatches all queued messages
    pub fn poll_messages(&mut self) {
        let mut batch = Vec::with_capacity(POP_BATCH_SIZE);

        loop {
            batch.clear();
            self.queue.pop_batch(&mut batch, POP_BATCH_SIZE);
            if batch.is_empty() {
                return;
            }

            for env in batch.drain(..) {
                self.dispatch(env);
            }
        }
    }

    /// Blocks until at least one message arrives, then drains the queue
    pub fn wait_messages(&mut self) {
        self.queue.wait(None);
        self.poll_messages();
    }

    /// Like `wait_messages` but gives up after `timeout`
    pub fn wait_messages_timeout(&mut self, timeout: Duration) {
        self.queue.wait(Some(timeout));
        self.poll_messages();
    }

    fn dispatch(&mut self, env: Envelope) {
        match env.kind {
            EnvelopeKind::Completion => {
                let Payload::Request(shared) = env.payload else {
                    return;
                };

                if let Some(handler) = Self::find(&mut self.completion_handlers, env.msg_uid) {
                    let info = RequestCompletionInfo {
                        shared: shared.clone(),
                    };
                    let mut payload = shared.payload.lock();
                    handler(payload.as_mut(), &info);
                }
            }
            EnvelopeKind::Request { wants_completion } => {
                let Payload::Request(shared) = env.payload else {
                    return;
                };

                let info = MessageInfo { sender: env.from };
                let status = match Self::find(&mut self.handlers, env.msg_uid) {
                    Some(handler) => {
                        let result = {
                            let mut payload = shared.payload.lock();
                            handler(payload.as_mut(), &info)
                        };
                        match result {
                            Ok(()) => RequestStatus::Complete,
                            Err(error) => {
                                *shared.error.lock() = Some(error);
                                RequestStatus::Failed
                            }
                        }
                    }
                    None => RequestStatus::Dropped,
                };

                self.sender.router.finish_request(
                    env.from,
                    env.msg_uid,
                    shared,
                    wants_completion,
                    status,
                );
            }
            EnvelopeKind::Unicast => {
                let Payload::Owned(mut payload) = env.payload else {
                    return;
                };

                let info = MessageInfo { sender: env.from };
                if let Some(handler) = Self::find(&mut self.handlers, env.msg_uid) {
                    if let Err(error) = handler(payload.as_mut(), &info) {
                        log::warn!("message handler for {} failed: {error}", env.msg_uid);
                    }
                }
            }
        }
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        self.sender.router.unregister_agent(self.sender.my_uid);
    }
}

/// Entry point of the messaging system: registers agents and creates
/// standalone senders.
pub struct MessagingService {
    router: Arc<MessageRouter>,
}

impl Default for MessagingService {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagingService {
    pub const SERVICE_UID: Uid = Uid::parse("b6f1c0de-55e70a21-9a834c6f-d2e9b118");

    pub fn new() -> Self {
        Self {
            router: Arc::new(MessageRouter::new()),
        }
    }

    /// Registers an agent and returns its queue endpoint. Fails with
    /// [`SvcError::AlreadyRegistered`] on a UID collision.
    pub fn register_agent(&self, id: Uid) -> Result<MessageQueue, SvcError> {
        let queue = self.router.register_agent(id)?;
        Ok(MessageQueue {
            sender: MessageSender {
                router: self.router.clone(),
                my_uid: id,
            },
            queue,
            handlers: Vec::new(),
            completion_handlers: Vec::new(),
        })
    }

    /// Creates a queue-less sending endpoint
    pub fn create_sender(&self, id: Uid) -> MessageSender {
        MessageSender {
            router: self.router.clone(),
            my_uid: id,
        }
    }
}

impl super::service_locator::NamedService for MessagingService {
    const SERVICE_UID: Uid = MessagingService::SERVICE_UID;
}
