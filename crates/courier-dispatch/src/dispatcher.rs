//! RequestDispatcher - Submission path from decoded request to worker pool
//!
//! Owns the in-flight context table and ties together admission, handler
//! resolution, pool selection, and response delivery. `submit` is
//! synchronous and non-blocking; the caller gets back a [`ResponseHandle`]
//! that resolves when the handler finishes.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use courier_common::{InvocationRequest, InvocationResponse, ProviderContext, TimePhase};

use crate::error::{DispatchError, Result};
use crate::handler::{AdmissionGate, HandlerResolver, SlowRequestClassifier};
use crate::pool::SubmitError;
use crate::registry::PoolRegistry;

/// Resolves to the handler's response, or to the error that ended the
/// invocation.
#[derive(Debug)]
pub struct ResponseHandle {
    sequence: u64,
    rx: oneshot::Receiver<Result<InvocationResponse>>,
}

impl ResponseHandle {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Waits for the invocation to finish. A handler that failed or was
    /// cancelled before replying surfaces as [`DispatchError::TaskFailed`].
    pub async fn response(self) -> Result<InvocationResponse> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::TaskFailed),
        }
    }
}

pub struct RequestDispatcher {
    registry: Arc<PoolRegistry>,
    contexts: Arc<DashMap<u64, Arc<ProviderContext>>>,
    resolver: Arc<dyn HandlerResolver>,
    classifier: Arc<dyn SlowRequestClassifier>,
    gate: Option<Arc<dyn AdmissionGate>>,
}

impl RequestDispatcher {
    pub fn new(
        registry: Arc<PoolRegistry>,
        resolver: Arc<dyn HandlerResolver>,
        classifier: Arc<dyn SlowRequestClassifier>,
    ) -> Self {
        Self {
            registry,
            contexts: Arc::new(DashMap::new()),
            resolver,
            classifier,
            gate: None,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Number of invocations currently tracked (queued or executing).
    pub fn in_flight(&self) -> usize {
        self.contexts.len()
    }

    pub fn context(&self, sequence: u64) -> Option<Arc<ProviderContext>> {
        self.contexts.get(&sequence).map(|entry| Arc::clone(entry.value()))
    }

    /// Admit, route, and hand the invocation to its worker pool. Fails fast
    /// with [`DispatchError::HandlerNotFound`] when no handler covers the
    /// message type, and with [`DispatchError::Overloaded`] carrying the
    /// rejecting pool's snapshot when that pool refuses it.
    pub fn submit(&self, context: Arc<ProviderContext>) -> Result<ResponseHandle> {
        let request = context.request();
        let sequence = request.sequence;

        if let Some(gate) = &self.gate {
            gate.check(request)?;
        }

        let handler = self
            .resolver
            .resolve(request.message_type)
            .ok_or(DispatchError::HandlerNotFound(request.message_type))?;

        let pool = self.registry.select_pool(request, self.classifier.as_ref());
        context.mark(TimePhase::Dispatch);

        let (tx, rx) = oneshot::channel();
        self.contexts.insert(sequence, Arc::clone(&context));

        let contexts = Arc::clone(&self.contexts);
        let pool_name = pool.name().to_string();
        let task_context = Arc::clone(&context);
        let submitted = pool.try_submit(async move {
            task_context.assign_worker(&pool_name);
            task_context.mark(TimePhase::Execute);
            let result = handler.handle(Arc::clone(&task_context)).await;
            task_context.mark(TimePhase::Complete);
            contexts.remove(&task_context.request().sequence);
            match result {
                Ok(response) => {
                    // Receiver may have been dropped; nothing left to do.
                    let _ = tx.send(Ok(response));
                }
                Err(err) => {
                    error!(
                        sequence,
                        service = %task_context.request().service_name,
                        method = %task_context.request().method_name,
                        error = %err,
                        "invocation handler failed"
                    );
                }
            }
        });

        if let Err(err) = submitted {
            self.contexts.remove(&sequence);
            warn!(
                sequence,
                pool = %pool.name(),
                error = %err,
                "pool rejected request"
            );
            return Err(match err {
                SubmitError::QueueFull(_) => DispatchError::Overloaded {
                    // Snapshot of the rejecting pool only.
                    statistics: pool.snapshot().to_string(),
                },
                SubmitError::Stopped(name) => DispatchError::PoolStopped(name),
            });
        }

        debug!(sequence, pool = %pool.name(), "request dispatched");
        Ok(ResponseHandle { sequence, rx })
    }

    /// Whether a timed-out request should be cancelled instead of executed:
    /// true when the pool it routes to is running at or beyond the cancel
    /// ratio of its maximum size. Advisory; rejects nothing itself.
    pub fn need_cancel(&self, request: &InvocationRequest) -> bool {
        let pool = self.registry.select_pool(request, self.classifier.as_ref());
        let threshold = pool.max_size() as f32 * self.registry.cancel_ratio();
        pool.active() as f32 >= threshold
    }

    /// Occupancy report across every live pool.
    pub fn report(&self) -> String {
        self.registry.report()
    }
}
