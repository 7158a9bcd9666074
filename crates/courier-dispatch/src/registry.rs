//! PoolRegistry - Tiered storage of live worker pools
//!
//! Holds the method-tier and service-tier pool maps, the swappable shared
//! pool reference, the optional per-server pool, and the fixed slow-request
//! isolation pool, plus the routing tunables (slow-pool flag, cancel ratio,
//! core ratio). Lookups on the submission path are lock-free; mutation goes
//! through atomic publishes and the single registration mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::info;

use courier_common::{ExecutionStrategy, InvocationRequest, PoolSnapshot, PoolSpec, ServerConfig};
use courier_config::ConfigProvider;

use crate::handler::SlowRequestClassifier;
use crate::pool::WorkerPool;

pub const POOL_STRATEGY_KEY: &str = "courier.provider.pool.strategy";
pub const SLOW_POOL_CORE_SIZE_KEY: &str = "courier.provider.pool.slow.coresize";
pub const SLOW_POOL_MAX_SIZE_KEY: &str = "courier.provider.pool.slow.maxsize";
pub const SLOW_POOL_QUEUE_SIZE_KEY: &str = "courier.provider.pool.slow.queuesize";
pub const SLOW_POOL_ENABLE_KEY: &str = "courier.provider.pool.slow.enable";
pub const DEFAULT_ACTIVES_KEY: &str = "courier.provider.pool.actives";
pub const CORE_RATIO_KEY: &str = "courier.provider.pool.ratio.core";
pub const CANCEL_RATIO_KEY: &str = "courier.timeout.cancelratio";

const DEFAULT_SLOW_CORE_SIZE: usize = 30;
const DEFAULT_SLOW_MAX_SIZE: usize = 200;
const DEFAULT_SLOW_QUEUE_SIZE: usize = 500;
const DEFAULT_ACTIVES: u32 = 60;
const DEFAULT_CORE_RATIO: f32 = 3.0;
const DEFAULT_CANCEL_RATIO: f32 = 1.0;

pub const SHARED_POOL_NAME: &str = "courier-request-shared";
pub const SLOW_POOL_NAME: &str = "courier-request-slow";

/// Tiered pool registry. One instance per process, passed explicitly to the
/// dispatcher, reconfiguration agent, and lifecycle manager.
pub struct PoolRegistry {
    strategy: ExecutionStrategy,
    shared: ArcSwap<WorkerPool>,
    /// Present iff strategy is Server.
    server: Option<Arc<WorkerPool>>,
    slow: Arc<WorkerPool>,
    slow_enabled: AtomicBool,
    cancel_ratio: RwLock<f32>,
    core_ratio: RwLock<f32>,
    default_actives: u32,
    method_pools: DashMap<String, Arc<WorkerPool>>,
    service_pools: DashMap<String, Arc<WorkerPool>>,
    /// Serializes service (de)registration; never taken on the submission path.
    registration: Mutex<()>,
}

impl PoolRegistry {
    /// Build the registry from the listening-server sizing and the startup
    /// configuration reads.
    pub fn from_config(server_config: &ServerConfig, config: &dyn ConfigProvider) -> Arc<Self> {
        let strategy =
            ExecutionStrategy::parse(&config.get_string(POOL_STRATEGY_KEY, "shared"));

        let shared = WorkerPool::new(PoolSpec::new(
            SHARED_POOL_NAME,
            server_config.core_pool_size,
            server_config.max_pool_size,
            server_config.work_queue_size,
        ));

        let server = match strategy {
            ExecutionStrategy::Server => Some(WorkerPool::new(PoolSpec::new(
                format!(
                    "courier-request-server-{}-{}",
                    server_config.protocol, server_config.port
                ),
                server_config.core_pool_size,
                server_config.max_pool_size,
                server_config.work_queue_size,
            ))),
            _ => None,
        };

        let slow = WorkerPool::new(PoolSpec::new(
            SLOW_POOL_NAME,
            config.get_usize(SLOW_POOL_CORE_SIZE_KEY, DEFAULT_SLOW_CORE_SIZE),
            config.get_usize(SLOW_POOL_MAX_SIZE_KEY, DEFAULT_SLOW_MAX_SIZE),
            config.get_usize(SLOW_POOL_QUEUE_SIZE_KEY, DEFAULT_SLOW_QUEUE_SIZE),
        ));

        info!(strategy = ?strategy, "pool registry initialized");

        Arc::new(Self {
            strategy,
            shared: ArcSwap::from(shared),
            server,
            slow,
            slow_enabled: AtomicBool::new(config.get_bool(SLOW_POOL_ENABLE_KEY, true)),
            cancel_ratio: RwLock::new(config.get_f32(CANCEL_RATIO_KEY, DEFAULT_CANCEL_RATIO)),
            core_ratio: RwLock::new(config.get_f32(CORE_RATIO_KEY, DEFAULT_CORE_RATIO)),
            default_actives: config.get_u32(DEFAULT_ACTIVES_KEY, DEFAULT_ACTIVES),
            method_pools: DashMap::new(),
            service_pools: DashMap::new(),
            registration: Mutex::new(()),
        })
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    /// The pool a request routes to.
    ///
    /// A non-empty service tier is consulted after the method tier and its
    /// result overwrites the method-tier match unconditionally, even when
    /// its own lookup misses; the request then falls through to slow/general.
    pub fn select_pool(
        &self,
        request: &InvocationRequest,
        classifier: &dyn SlowRequestClassifier,
    ) -> Arc<WorkerPool> {
        let mut pool: Option<Arc<WorkerPool>> = None;
        if !self.method_pools.is_empty() {
            pool = self
                .method_pools
                .get(&request.method_key())
                .map(|entry| Arc::clone(entry.value()));
        }
        if !self.service_pools.is_empty() {
            pool = self
                .service_pools
                .get(&request.service_name)
                .map(|entry| Arc::clone(entry.value()));
        }
        match pool {
            Some(pool) => pool,
            None => {
                if self.slow_enabled.load(Ordering::Acquire) && classifier.is_slow(request) {
                    Arc::clone(&self.slow)
                } else {
                    self.general_pool()
                }
            }
        }
    }

    /// The per-server pool when strategy is Server, else the shared pool.
    pub fn general_pool(&self) -> Arc<WorkerPool> {
        match self.strategy {
            ExecutionStrategy::Server => self
                .server
                .as_ref()
                .map(Arc::clone)
                .unwrap_or_else(|| self.shared.load_full()),
            _ => self.shared.load_full(),
        }
    }

    pub fn shared_pool(&self) -> Arc<WorkerPool> {
        self.shared.load_full()
    }

    pub fn slow_pool(&self) -> Arc<WorkerPool> {
        Arc::clone(&self.slow)
    }

    /// Atomically publish a replacement shared pool; returns the retired one.
    /// Readers that already captured the old reference keep using it until it
    /// drains.
    pub fn swap_shared(&self, pool: Arc<WorkerPool>) -> Arc<WorkerPool> {
        self.shared.swap(pool)
    }

    pub fn slow_enabled(&self) -> bool {
        self.slow_enabled.load(Ordering::Acquire)
    }

    pub fn set_slow_enabled(&self, enabled: bool) {
        self.slow_enabled.store(enabled, Ordering::Release);
    }

    pub fn cancel_ratio(&self) -> f32 {
        *self.cancel_ratio.read()
    }

    pub fn set_cancel_ratio(&self, ratio: f32) {
        *self.cancel_ratio.write() = ratio;
    }

    pub fn core_ratio(&self) -> f32 {
        *self.core_ratio.read()
    }

    pub fn set_core_ratio(&self, ratio: f32) {
        *self.core_ratio.write() = ratio;
    }

    pub fn default_actives(&self) -> u32 {
        self.default_actives
    }

    /// Guard for service (de)registration. Submission never takes this.
    pub fn registration_lock(&self) -> MutexGuard<'_, ()> {
        self.registration.lock()
    }

    pub fn method_pool(&self, key: &str) -> Option<Arc<WorkerPool>> {
        self.method_pools.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn service_pool(&self, url: &str) -> Option<Arc<WorkerPool>> {
        self.service_pools.get(url).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert-if-absent for the service tier; first write wins.
    pub fn service_pool_entry(
        &self,
        url: &str,
        build: impl FnOnce() -> Arc<WorkerPool>,
    ) -> Arc<WorkerPool> {
        Arc::clone(
            self.service_pools
                .entry(url.to_string())
                .or_insert_with(build)
                .value(),
        )
    }

    /// Insert-if-absent for the method tier; first write wins.
    pub fn method_pool_entry(
        &self,
        key: &str,
        build: impl FnOnce() -> Arc<WorkerPool>,
    ) -> Arc<WorkerPool> {
        Arc::clone(
            self.method_pools
                .entry(key.to_string())
                .or_insert_with(build)
                .value(),
        )
    }

    /// Replace a method-tier pool in place; returns the retired one if the
    /// key existed.
    pub fn replace_method_pool(&self, key: &str, pool: Arc<WorkerPool>) -> Option<Arc<WorkerPool>> {
        self.method_pools.insert(key.to_string(), pool)
    }

    /// Remove every pool a deregistered service owns: the method-tier pools
    /// keyed `url#...` and the service-tier pool keyed `url`. Returns the
    /// removed pools for shutdown by the caller.
    pub fn remove_service_pools(&self, url: &str) -> Vec<Arc<WorkerPool>> {
        let prefix = format!("{url}#");
        let method_keys: Vec<String> = self
            .method_pools
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(method_keys.len() + 1);
        for key in method_keys {
            if let Some((_, pool)) = self.method_pools.remove(&key) {
                removed.push(pool);
            }
        }
        if let Some((_, pool)) = self.service_pools.remove(url) {
            removed.push(pool);
        }
        removed
    }

    /// Snapshots of every live pool: general, slow, service tier, method tier.
    pub fn snapshots(&self) -> Vec<PoolSnapshot> {
        let mut snapshots = vec![self.general_pool().snapshot(), self.slow.snapshot()];
        snapshots.extend(self.service_pools.iter().map(|entry| entry.value().snapshot()));
        snapshots.extend(self.method_pools.iter().map(|entry| entry.value().snapshot()));
        snapshots
    }

    /// Human-readable occupancy report across every live pool. No global
    /// lock is held; each pool is read independently, so the report is only
    /// eventually consistent across pools.
    pub fn report(&self) -> String {
        let mut out = String::new();
        match self.strategy {
            ExecutionStrategy::Server => {
                out.push_str(&format!("[server={}]", self.general_pool().snapshot()));
            }
            _ => {
                out.push_str(&format!("[shared={}]", self.shared_pool().snapshot()));
            }
        }
        out.push_str(&format!("[slow={}]", self.slow.snapshot()));
        for entry in self.service_pools.iter() {
            out.push_str(&format!(",[{}={}]", entry.key(), entry.value().snapshot()));
        }
        for entry in self.method_pools.iter() {
            out.push_str(&format!(",[{}={}]", entry.key(), entry.value().snapshot()));
        }
        out
    }
}
