//! Courier Dispatch - Server-side request dispatch
//!
//! The provider-side execution layer: requests decoded off the wire are
//! admitted, routed to a worker pool by method, service, slow-request, or
//! general precedence, and executed on handler tasks while configuration
//! updates resize pools in place.
//!
//! Core components:
//! - `RequestDispatcher`: submission path, context tracking, cancel checks
//! - `WorkerPool`: bounded task pool with fail-fast admission
//! - `PoolRegistry`: tiered pool storage and routing tunables
//! - `ReconfigAgent`: live pool resizing driven by configuration updates
//! - `ServiceLifecycle`: pool provisioning on service publish/retract
//! - `ProviderServer`: transport-facing front

pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod pool;
pub mod reconfig;
pub mod registry;
pub mod server;
pub mod stats;

pub use dispatcher::{RequestDispatcher, ResponseHandle};
pub use error::{DispatchError, Result};
pub use handler::{
    AdmissionGate, HandlerRegistry, HandlerResolver, InvocationHandler, NeverSlow,
    SlowRequestClassifier,
};
pub use lifecycle::ServiceLifecycle;
pub use pool::{retire, SubmitError, WorkerPool};
pub use reconfig::{sized_spec, ReconfigAgent, SharedPoolKeys};
pub use registry::PoolRegistry;
pub use server::{ProviderServer, Transport};
pub use stats::spawn_stats_reporter;
