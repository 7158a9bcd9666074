//! RequestDispatcher tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use courier_common::{
    InvocationRequest, InvocationResponse, MessageType, ProviderContext, ServerConfig,
};
use courier_config::MemoryConfigProvider;
use courier_dispatch::{
    AdmissionGate, DispatchError, HandlerRegistry, InvocationHandler, NeverSlow, PoolRegistry,
    RequestDispatcher, SlowRequestClassifier,
};

struct EchoHandler;

#[async_trait]
impl InvocationHandler for EchoHandler {
    async fn handle(&self, context: Arc<ProviderContext>) -> anyhow::Result<InvocationResponse> {
        Ok(InvocationResponse::new(
            context.request().sequence,
            json!({"method": context.request().method_name}),
        ))
    }
}

/// Parks on the gate until a permit is released, then echoes.
struct GatedHandler {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl InvocationHandler for GatedHandler {
    async fn handle(&self, context: Arc<ProviderContext>) -> anyhow::Result<InvocationResponse> {
        self.gate.acquire().await.expect("gate open").forget();
        Ok(InvocationResponse::new(context.request().sequence, json!("done")))
    }
}

struct FailingHandler;

#[async_trait]
impl InvocationHandler for FailingHandler {
    async fn handle(&self, _context: Arc<ProviderContext>) -> anyhow::Result<InvocationResponse> {
        anyhow::bail!("backend unavailable")
    }
}

struct AlwaysSlow;

impl SlowRequestClassifier for AlwaysSlow {
    fn is_slow(&self, _request: &InvocationRequest) -> bool {
        true
    }
}

struct DenyAll;

impl AdmissionGate for DenyAll {
    fn check(&self, request: &InvocationRequest) -> Result<(), DispatchError> {
        Err(DispatchError::AdmissionRejected(format!(
            "{} not admitted",
            request.service_name
        )))
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

fn context(sequence: u64, service: &str, method: &str) -> Arc<ProviderContext> {
    Arc::new(ProviderContext::new(InvocationRequest::new(
        sequence,
        service,
        method,
        MessageType::Service,
        Duration::from_secs(1),
    )))
}

fn registry_with(server_config: ServerConfig) -> Arc<PoolRegistry> {
    courier_common::logging::init_logging();
    PoolRegistry::from_config(&server_config, &MemoryConfigProvider::new())
}

fn dispatcher_with(
    registry: Arc<PoolRegistry>,
    handler: Arc<dyn InvocationHandler>,
) -> RequestDispatcher {
    let resolver = HandlerRegistry::new().register(MessageType::Service, handler);
    RequestDispatcher::new(registry, Arc::new(resolver), Arc::new(NeverSlow))
}

#[tokio::test]
async fn dispatch_resolves_to_handler_response() {
    let dispatcher = dispatcher_with(registry_with(ServerConfig::default()), Arc::new(EchoHandler));

    let handle = dispatcher.submit(context(7, "svc", "ping")).unwrap();
    assert_eq!(handle.sequence(), 7);

    let response = handle.response().await.unwrap();
    assert_eq!(response.sequence, 7);
    assert_eq!(response.payload, json!({"method": "ping"}));

    assert!(wait_until(|| dispatcher.in_flight() == 0, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn unknown_message_type_fails_fast() {
    let registry = registry_with(ServerConfig::default());
    let resolver = HandlerRegistry::new(); // nothing registered
    let dispatcher = RequestDispatcher::new(registry, Arc::new(resolver), Arc::new(NeverSlow));

    let err = dispatcher.submit(context(1, "svc", "ping")).unwrap_err();
    assert!(matches!(err, DispatchError::HandlerNotFound(MessageType::Service)));
    assert_eq!(dispatcher.in_flight(), 0);
}

#[tokio::test]
async fn handler_failure_surfaces_as_task_failed_and_cleans_up() {
    let dispatcher =
        dispatcher_with(registry_with(ServerConfig::default()), Arc::new(FailingHandler));

    let handle = dispatcher.submit(context(3, "svc", "boom")).unwrap();
    let err = tokio::time::timeout(Duration::from_secs(2), handle.response())
        .await
        .expect("handle resolves")
        .unwrap_err();
    assert!(matches!(err, DispatchError::TaskFailed));

    // One failure never poisons the pool or leaks its context.
    assert!(wait_until(|| dispatcher.in_flight() == 0, Duration::from_secs(2)).await);
    let handle = dispatcher.submit(context(4, "svc", "boom")).unwrap();
    assert!(handle.response().await.is_err());
}

#[tokio::test]
async fn overload_rejection_carries_pool_report() {
    let server_config = ServerConfig {
        max_pool_size: 1,
        work_queue_size: 0,
        ..ServerConfig::default()
    };
    let gate = Arc::new(Semaphore::new(0));
    let dispatcher = dispatcher_with(
        registry_with(server_config),
        Arc::new(GatedHandler { gate: Arc::clone(&gate) }),
    );

    let first = dispatcher.submit(context(1, "svc", "m")).unwrap();
    assert!(
        wait_until(
            || dispatcher.registry().shared_pool().active() == 1,
            Duration::from_secs(2)
        )
        .await
    );

    let err = dispatcher.submit(context(2, "svc", "m")).unwrap_err();
    match err {
        DispatchError::Overloaded { statistics } => {
            // The snapshot covers the rejecting pool, not every pool.
            assert!(statistics.starts_with("pool size:1(active:1,core:30,max:1,largest:1)"));
            assert!(!statistics.contains("[slow="));
        }
        other => panic!("expected Overloaded, got {other:?}"),
    }
    // Rejected request leaves no context behind.
    assert_eq!(dispatcher.in_flight(), 1);

    gate.add_permits(1);
    assert!(first.response().await.is_ok());
}

#[tokio::test]
async fn slow_requests_route_to_isolation_pool() {
    let registry = registry_with(ServerConfig::default());
    let resolver = HandlerRegistry::new().register(MessageType::Service, Arc::new(EchoHandler));
    let dispatcher =
        RequestDispatcher::new(Arc::clone(&registry), Arc::new(resolver), Arc::new(AlwaysSlow));

    let handle = dispatcher.submit(context(1, "svc", "m")).unwrap();
    handle.response().await.unwrap();
    assert_eq!(registry.slow_pool().submitted(), 1);
    assert_eq!(registry.shared_pool().submitted(), 0);

    // Disabling the slow pool sends the same traffic to the general pool.
    registry.set_slow_enabled(false);
    let handle = dispatcher.submit(context(2, "svc", "m")).unwrap();
    handle.response().await.unwrap();
    assert_eq!(registry.slow_pool().submitted(), 1);
    assert_eq!(registry.shared_pool().submitted(), 1);
}

#[tokio::test]
async fn admission_gate_rejects_before_pool_selection() {
    let registry = registry_with(ServerConfig::default());
    let dispatcher = dispatcher_with(Arc::clone(&registry), Arc::new(EchoHandler))
        .with_gate(Arc::new(DenyAll));

    let err = dispatcher.submit(context(1, "svc", "m")).unwrap_err();
    assert!(matches!(err, DispatchError::AdmissionRejected(_)));
    assert_eq!(registry.shared_pool().submitted(), 0);
}

#[tokio::test]
async fn need_cancel_at_and_above_the_active_threshold() {
    let server_config = ServerConfig {
        max_pool_size: 2,
        work_queue_size: 4,
        ..ServerConfig::default()
    };
    let gate = Arc::new(Semaphore::new(0));
    let dispatcher = dispatcher_with(
        registry_with(server_config),
        Arc::new(GatedHandler { gate: Arc::clone(&gate) }),
    );

    let probe = InvocationRequest::new(99, "svc", "m", MessageType::Service, Duration::from_secs(1));
    assert!(!dispatcher.need_cancel(&probe));

    let first = dispatcher.submit(context(1, "svc", "m")).unwrap();
    let second = dispatcher.submit(context(2, "svc", "m")).unwrap();
    assert!(
        wait_until(
            || dispatcher.registry().shared_pool().active() == 2,
            Duration::from_secs(2)
        )
        .await
    );

    // cancel_ratio defaults to 1.0: the boundary is active == max.
    assert!(dispatcher.need_cancel(&probe));

    gate.add_permits(1);
    assert!(
        wait_until(
            || dispatcher.registry().shared_pool().active() == 1,
            Duration::from_secs(2)
        )
        .await
    );
    assert!(!dispatcher.need_cancel(&probe));

    gate.add_permits(1);
    let _ = first.response().await;
    let _ = second.response().await;
}

#[tokio::test]
async fn context_timeline_records_all_phases() {
    let dispatcher = dispatcher_with(registry_with(ServerConfig::default()), Arc::new(EchoHandler));

    let context = context(5, "svc", "m");
    let handle = dispatcher.submit(Arc::clone(&context)).unwrap();
    handle.response().await.unwrap();

    use courier_common::TimePhase;
    let phases: Vec<TimePhase> = context.timeline().iter().map(|p| p.phase).collect();
    assert_eq!(
        phases,
        vec![
            TimePhase::Receive,
            TimePhase::Dispatch,
            TimePhase::Execute,
            TimePhase::Complete
        ]
    );
    assert_eq!(context.worker(), Some("courier-request-shared"));
}
