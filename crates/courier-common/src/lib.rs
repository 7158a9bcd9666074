use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

pub mod logging;

// ============================================================================
// Invocation Types
// ============================================================================

/// Message type of a decoded invocation, used to resolve the handler
/// responsible for producing the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Service,
    Heartbeat,
    HealthCheck,
}

/// A decoded inbound remote call. Immutable once received from the codec.
///
/// `sequence` is unique per in-flight request on a connection and is the key
/// under which the dispatcher tracks the request's execution context.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub sequence: u64,
    pub service_name: String,
    pub method_name: String,
    pub message_type: MessageType,
    pub timeout: Duration,
}

impl InvocationRequest {
    pub fn new(
        sequence: u64,
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        message_type: MessageType,
        timeout: Duration,
    ) -> Self {
        Self {
            sequence,
            service_name: service_name.into(),
            method_name: method_name.into(),
            message_type,
            timeout,
        }
    }

    /// Key of the method-tier pool registry slot for this request.
    pub fn method_key(&self) -> String {
        format!("{}#{}", self.service_name, self.method_name)
    }
}

/// Response produced by an invocation handler. The payload is opaque to the
/// dispatch layer; the transport/codec owns its meaning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub sequence: u64,
    pub payload: serde_json::Value,
}

impl InvocationResponse {
    pub fn new(sequence: u64, payload: serde_json::Value) -> Self {
        Self { sequence, payload }
    }
}

// ============================================================================
// Provider Context
// ============================================================================

/// Processing phase markers recorded on the request timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePhase {
    Receive,
    Dispatch,
    Execute,
    Complete,
}

/// A timestamped phase marker.
#[derive(Debug, Clone, Copy)]
pub struct TimePoint {
    pub phase: TimePhase,
    pub at: Instant,
}

/// Per-request execution context. Owns the request for its lifetime and
/// collects a timeline of phase markers plus the name of the worker thread
/// the task ended up on.
///
/// Shared as `Arc<ProviderContext>`: the dispatcher keeps one clone in its
/// in-flight map for diagnostics and hands another to the executing task.
#[derive(Debug)]
pub struct ProviderContext {
    request: InvocationRequest,
    timeline: parking_lot::Mutex<Vec<TimePoint>>,
    worker: OnceLock<String>,
}

impl ProviderContext {
    pub fn new(request: InvocationRequest) -> Self {
        let ctx = Self {
            request,
            timeline: parking_lot::Mutex::new(Vec::new()),
            worker: OnceLock::new(),
        };
        ctx.mark(TimePhase::Receive);
        ctx
    }

    pub fn request(&self) -> &InvocationRequest {
        &self.request
    }

    /// Append a phase marker to the timeline.
    pub fn mark(&self, phase: TimePhase) {
        self.timeline.lock().push(TimePoint {
            phase,
            at: Instant::now(),
        });
    }

    pub fn timeline(&self) -> Vec<TimePoint> {
        self.timeline.lock().clone()
    }

    /// Record the executing worker once the task is picked up. First write
    /// wins; later calls are ignored.
    pub fn assign_worker(&self, name: impl Into<String>) {
        let _ = self.worker.set(name.into());
    }

    pub fn worker(&self) -> Option<&str> {
        self.worker.get().map(String::as_str)
    }
}

// ============================================================================
// Pool Sizing & Snapshot Types
// ============================================================================

/// Sizing parameters a worker pool is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub name: String,
    pub core_size: usize,
    pub max_size: usize,
    pub queue_capacity: usize,
}

impl PoolSpec {
    pub fn new(name: impl Into<String>, core_size: usize, max_size: usize, queue_capacity: usize) -> Self {
        Self {
            name: name.into(),
            core_size,
            max_size,
            queue_capacity,
        }
    }
}

/// Point-in-time occupancy counters of one worker pool. Individually
/// consistent; a multi-pool report composed from snapshots is only
/// eventually consistent, which is fine for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub name: String,
    pub pool_size: usize,
    pub active: usize,
    pub core_size: usize,
    pub max_size: usize,
    pub largest: usize,
    pub submitted: u64,
    pub completed: u64,
    pub queue_size: usize,
    pub queue_capacity: usize,
}

impl std::fmt::Display for PoolSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pool size:{}(active:{},core:{},max:{},largest:{}),task count:{}(completed:{}),queue size:{}",
            self.pool_size,
            self.active,
            self.core_size,
            self.max_size,
            self.largest,
            self.submitted,
            self.completed,
            self.queue_size,
        )
    }
}

// ============================================================================
// Execution Strategy
// ============================================================================

/// Process-wide pool granularity policy, fixed at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStrategy {
    /// One shared pool for every service in the process.
    Shared,
    /// One pool per listening server (protocol/port).
    Server,
    /// Standalone pools per registered service method.
    Method,
}

impl ExecutionStrategy {
    /// Parse the configured strategy string; anything unrecognized falls
    /// back to `Shared`.
    pub fn parse(value: &str) -> Self {
        match value {
            "server" => ExecutionStrategy::Server,
            "method" => ExecutionStrategy::Method,
            "shared" => ExecutionStrategy::Shared,
            other => {
                tracing::warn!(strategy = %other, "unknown pool strategy, using shared");
                ExecutionStrategy::Shared
            }
        }
    }
}

// ============================================================================
// Service Registration Config
// ============================================================================

/// Per-method capacity override supplied at service registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodConfig {
    pub actives: u32,
}

/// Registration-time description of a provided service: which pool isolation
/// it wants and how large its standalone pools should be.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub url: String,
    /// When false the service opts out of the shared pool and gets
    /// standalone pools regardless of the global strategy.
    pub use_shared_pool: bool,
    /// Service-level concurrent-call capacity; 0 means unspecified.
    pub actives: u32,
    /// Methods the service actually publishes.
    pub method_names: HashSet<String>,
    /// Explicit per-method capacity overrides. Method pools are only built
    /// for methods present in both `method_names` and this map.
    pub method_overrides: HashMap<String, MethodConfig>,
}

impl ServiceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            use_shared_pool: true,
            actives: 0,
            method_names: HashSet::new(),
            method_overrides: HashMap::new(),
        }
    }

    pub fn with_actives(mut self, actives: u32) -> Self {
        self.actives = actives;
        self
    }

    pub fn standalone(mut self) -> Self {
        self.use_shared_pool = false;
        self
    }

    pub fn with_method(mut self, name: impl Into<String>, override_config: Option<MethodConfig>) -> Self {
        let name = name.into();
        if let Some(config) = override_config {
            self.method_overrides.insert(name.clone(), config);
        }
        self.method_names.insert(name);
        self
    }
}

// ============================================================================
// Server Config
// ============================================================================

/// Listening-server description; source of the general pool's initial sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub protocol: String,
    pub port: u16,
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    pub work_queue_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: "tcp".to_string(),
            port: 4040,
            core_pool_size: 30,
            max_pool_size: 300,
            work_queue_size: 500,
        }
    }
}
