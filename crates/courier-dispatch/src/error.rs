//! Dispatch error types

use courier_common::MessageType;
use thiserror::Error;

/// Errors surfaced by the dispatch layer, either at submission time or
/// through a [`crate::dispatcher::ResponseHandle`].
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The selected pool rejected the request; carries that pool's
    /// occupancy snapshot captured at rejection time.
    #[error("request rejected, pool busy: {statistics}")]
    Overloaded { statistics: String },

    /// No handler is registered for the request's message type.
    #[error("no handler registered for message type {0:?}")]
    HandlerNotFound(MessageType),

    /// The handler task failed or was cancelled before producing a response.
    #[error("invocation task failed before producing a response")]
    TaskFailed,

    /// An admission gate refused the request before pool selection.
    #[error("request refused at admission: {0}")]
    AdmissionRejected(String),

    /// The selected pool was retired between lookup and submission.
    #[error("pool {0} is stopped")]
    PoolStopped(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
