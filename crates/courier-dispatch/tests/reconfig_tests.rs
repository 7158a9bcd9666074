//! ReconfigAgent tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use courier_common::{
    InvocationRequest, InvocationResponse, MessageType, ProviderContext, ServerConfig,
};
use courier_config::{ConfigProvider, MemoryConfigProvider};
use courier_dispatch::lifecycle::actives_key;
use courier_dispatch::registry::{CANCEL_RATIO_KEY, CORE_RATIO_KEY, SLOW_POOL_ENABLE_KEY};
use courier_dispatch::{
    sized_spec, HandlerRegistry, InvocationHandler, NeverSlow, PoolRegistry, ReconfigAgent,
    RequestDispatcher, SharedPoolKeys, WorkerPool,
};

const SHARED_CORE_KEY: &str = "courier.provider.pool.coresize";
const SHARED_MAX_KEY: &str = "courier.provider.pool.maxsize";
const SHARED_QUEUE_KEY: &str = "courier.provider.pool.queuesize";

fn shared_keys() -> SharedPoolKeys {
    SharedPoolKeys {
        core_size: SHARED_CORE_KEY.to_string(),
        max_size: SHARED_MAX_KEY.to_string(),
        queue_size: SHARED_QUEUE_KEY.to_string(),
    }
}

fn wired_registry() -> (Arc<PoolRegistry>, Arc<ReconfigAgent>, MemoryConfigProvider) {
    courier_common::logging::init_logging();
    let provider = MemoryConfigProvider::new();
    let registry = PoolRegistry::from_config(&ServerConfig::default(), &provider);
    let agent = ReconfigAgent::with_shared_keys(Arc::clone(&registry), shared_keys());
    provider.subscribe(agent.clone());
    (registry, agent, provider)
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

#[tokio::test]
async fn shared_core_size_update_swaps_the_pool() {
    let (registry, _agent, provider) = wired_registry();
    let before = registry.shared_pool();
    assert_eq!(before.core_size(), 30);

    provider.set(SHARED_CORE_KEY, "64");

    let after = registry.shared_pool();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.core_size(), 64);
    // The other sizing fields carry over.
    assert_eq!(after.max_size(), before.max_size());
    assert_eq!(after.queue_capacity(), before.queue_capacity());

    // The superseded pool is retired in the background.
    assert!(wait_until(|| !before.is_accepting(), Duration::from_secs(2)).await);
    assert!(after.is_accepting());
}

#[tokio::test]
async fn update_with_current_value_is_a_no_op() {
    let (registry, _agent, provider) = wired_registry();
    let before = registry.shared_pool();

    provider.set(SHARED_MAX_KEY, "300"); // already the live value

    let after = registry.shared_pool();
    assert!(Arc::ptr_eq(&before, &after));
    assert!(after.is_accepting());
}

#[tokio::test]
async fn malformed_value_is_dropped_and_later_updates_apply() {
    let (registry, _agent, provider) = wired_registry();
    let before = registry.shared_pool();

    provider.set(SHARED_QUEUE_KEY, "banana");
    assert!(Arc::ptr_eq(&before, &registry.shared_pool()));

    provider.set(SHARED_QUEUE_KEY, "900");
    let after = registry.shared_pool();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.queue_capacity(), 900);
}

#[tokio::test]
async fn flag_and_ratio_keys_update_in_place() {
    let (registry, _agent, provider) = wired_registry();
    let shared = registry.shared_pool();

    provider.set(SLOW_POOL_ENABLE_KEY, "false");
    assert!(!registry.slow_enabled());
    provider.set(SLOW_POOL_ENABLE_KEY, "true");
    assert!(registry.slow_enabled());

    provider.set(CANCEL_RATIO_KEY, "0.5");
    assert_eq!(registry.cancel_ratio(), 0.5);

    provider.set(CORE_RATIO_KEY, "2.0");
    assert_eq!(registry.core_ratio(), 2.0);

    // None of these touch the live pools.
    assert!(Arc::ptr_eq(&shared, &registry.shared_pool()));
}

#[tokio::test]
async fn provider_prefixed_keys_match_by_suffix() {
    let (registry, _agent, provider) = wired_registry();

    provider.set(&format!("app.eu-west.{SLOW_POOL_ENABLE_KEY}"), "false");
    assert!(!registry.slow_enabled());
}

#[tokio::test]
async fn unrecognized_key_changes_nothing() {
    let (registry, _agent, provider) = wired_registry();
    let shared = registry.shared_pool();

    provider.set("courier.provider.heartbeat.interval", "5000");

    assert!(Arc::ptr_eq(&shared, &registry.shared_pool()));
    assert!(registry.slow_enabled());
    assert_eq!(registry.cancel_ratio(), 1.0);
}

#[tokio::test]
async fn bound_method_pool_resizes_from_actives_update() {
    let (registry, agent, provider) = wired_registry();
    let pool_key = "svc#find";
    let before = registry.method_pool_entry(pool_key, || {
        WorkerPool::new(sized_spec(pool_key, 10, registry.core_ratio()))
    });
    agent.bind_method_pool(actives_key(pool_key), pool_key);

    provider.set(&actives_key(pool_key), "20");

    let after = registry.method_pool(pool_key).unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.max_size(), 20);
    assert_eq!(after.queue_capacity(), 20);
    assert_eq!(after.core_size(), 6); // floor(20 / 3.0)
    assert!(wait_until(|| !before.is_accepting(), Duration::from_secs(2)).await);
}

#[tokio::test]
async fn actives_update_never_resurrects_a_removed_pool() {
    let (registry, agent, provider) = wired_registry();
    let pool_key = "http://svc/user#find";
    registry.method_pool_entry(pool_key, || {
        WorkerPool::new(sized_spec(pool_key, 10, registry.core_ratio()))
    });
    agent.bind_method_pool(actives_key(pool_key), pool_key);

    for pool in registry.remove_service_pools("http://svc/user") {
        pool.shutdown();
    }
    assert!(registry.method_pool(pool_key).is_none());

    provider.set(&actives_key(pool_key), "20");
    assert!(registry.method_pool(pool_key).is_none());

    // The binding was dropped with the pool; repeats stay inert.
    provider.set(&actives_key(pool_key), "30");
    assert!(registry.method_pool(pool_key).is_none());
}

struct GatedHandler {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl InvocationHandler for GatedHandler {
    async fn handle(&self, context: Arc<ProviderContext>) -> anyhow::Result<InvocationResponse> {
        let _permit = self.gate.acquire().await;
        Ok(InvocationResponse::new(context.request().sequence, json!("ok")))
    }
}

#[tokio::test]
async fn in_flight_requests_survive_a_shared_pool_swap() {
    let (registry, _agent, provider) = wired_registry();
    let gate = Arc::new(Semaphore::new(0));
    let resolver = HandlerRegistry::new().register(
        MessageType::Service,
        Arc::new(GatedHandler { gate: Arc::clone(&gate) }),
    );
    let dispatcher =
        RequestDispatcher::new(Arc::clone(&registry), Arc::new(resolver), Arc::new(NeverSlow));

    let old_pool = registry.shared_pool();
    let mut handles = Vec::new();
    for sequence in 0..8 {
        let context = Arc::new(ProviderContext::new(InvocationRequest::new(
            sequence,
            "svc",
            "m",
            MessageType::Service,
            Duration::from_secs(1),
        )));
        handles.push(dispatcher.submit(context).unwrap());
    }

    provider.set(SHARED_CORE_KEY, "64");
    assert!(!Arc::ptr_eq(&old_pool, &registry.shared_pool()));

    // Everything accepted before the swap still completes on the old pool.
    gate.add_permits(8);
    for handle in handles {
        let response = tokio::time::timeout(Duration::from_secs(2), handle.response())
            .await
            .expect("resolves after swap")
            .expect("handler succeeded");
        assert_eq!(response.payload, json!("ok"));
    }
    assert_eq!(old_pool.completed(), 8);
}
