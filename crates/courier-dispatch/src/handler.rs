//! Handler and policy traits
//!
//! The seams between the dispatch layer and the application: invocation
//! handlers resolved per message type, the slow-request classifier that
//! steers work onto the isolation pool, and the optional admission gate
//! consulted before pool selection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use courier_common::{InvocationRequest, InvocationResponse, MessageType, ProviderContext};

use crate::error::DispatchError;

/// Executes one invocation inside a worker pool task.
#[async_trait]
pub trait InvocationHandler: Send + Sync {
    async fn handle(&self, context: Arc<ProviderContext>) -> anyhow::Result<InvocationResponse>;
}

/// Maps a message type to the handler that processes it.
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, message_type: MessageType) -> Option<Arc<dyn InvocationHandler>>;
}

/// Decides whether a request should run on the slow-request isolation pool.
pub trait SlowRequestClassifier: Send + Sync {
    fn is_slow(&self, request: &InvocationRequest) -> bool;
}

/// Pre-selection veto point. Returning an error fails the submission before
/// any pool is consulted.
pub trait AdmissionGate: Send + Sync {
    fn check(&self, request: &InvocationRequest) -> Result<(), DispatchError>;
}

/// Fixed handler table built at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageType, Arc<dyn InvocationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        message_type: MessageType,
        handler: Arc<dyn InvocationHandler>,
    ) -> Self {
        self.handlers.insert(message_type, handler);
        self
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, message_type: MessageType) -> Option<Arc<dyn InvocationHandler>> {
        self.handlers.get(&message_type).map(Arc::clone)
    }
}

/// Classifier that never routes to the slow pool.
pub struct NeverSlow;

impl SlowRequestClassifier for NeverSlow {
    fn is_slow(&self, _request: &InvocationRequest) -> bool {
        false
    }
}
