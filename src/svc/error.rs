use thiserror::Error;

use crate::core::Uid;

/// Service-layer error taxonomy.
#[derive(Error, Debug)]
pub enum SvcError {
    #[error("UID {0} is already registered")]
    AlreadyRegistered(Uid),
    #[error("no factory registered for service {0}")]
    UnresolvedDependency(Uid),
    #[error("circular dependency detected while creating service {0}")]
    CircularDependency(Uid),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
