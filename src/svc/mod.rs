//! Service infrastructure: task scheduling, messaging, service registry.
pub mod counter_tracker;
pub mod error;
pub mod message_queue;
pub mod message_router;
pub mod service_locator;
pub mod task;
pub mod task_builder;
pub mod task_queue;
pub mod task_service;

// Selective re-exports
pub use counter_tracker::TaskCounterTracker;
pub use error::SvcError;
pub use message_queue::{
    Message, MessageInfo, MessageQueue, MessageSender, MessagingService, RequestCompletionInfo,
    RequestError, RequestHandle, RequestStatus,
};
pub use service_locator::{NamedService, ServiceLocator};
pub use task::{TaskContext, TaskHandle};
pub use task_builder::TaskBuilder;
pub use task_service::{TaskService, TaskServiceConfig};
