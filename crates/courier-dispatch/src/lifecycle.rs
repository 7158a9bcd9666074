//! ServiceLifecycle - Pool provisioning for published and retracted services
//!
//! Translates service publication into method- or service-tier pools and
//! tears them down on retraction. All mutation happens under the registry's
//! registration mutex, so concurrent publishes of the same service are
//! idempotent.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info};

use courier_common::{ExecutionStrategy, ServiceConfig};

use crate::pool::{retire, WorkerPool};
use crate::reconfig::{sized_spec, ReconfigAgent};
use crate::registry::PoolRegistry;

const RETIRE_GRACE: Duration = Duration::from_secs(5);

pub struct ServiceLifecycle {
    registry: Arc<PoolRegistry>,
    /// When present, each provisioned method pool is bound to its actives
    /// configuration key for live resizing.
    agent: Option<Arc<ReconfigAgent>>,
    runtime: Handle,
}

impl ServiceLifecycle {
    /// Must be called from within a tokio runtime; the current handle is
    /// captured for draining retired pools in the background.
    pub fn new(registry: Arc<PoolRegistry>) -> Self {
        Self {
            registry,
            agent: None,
            runtime: Handle::current(),
        }
    }

    pub fn with_agent(mut self, agent: Arc<ReconfigAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Whether this service gets pools of its own instead of riding the
    /// general pool.
    fn needs_standalone(&self, config: &ServiceConfig) -> bool {
        !config.use_shared_pool || self.registry.strategy() == ExecutionStrategy::Method
    }

    /// Provision pools for a newly published service. A service declaring
    /// method overrides gets one method-tier pool per overridden published
    /// method; otherwise a positive `actives` buys one service-tier pool,
    /// and a service declaring neither gets nothing. Safe to call again for
    /// the same service; existing pools are kept.
    pub fn add_service(&self, config: &ServiceConfig) {
        if !self.needs_standalone(config) {
            debug!(url = %config.url, "service rides the general pool");
            return;
        }

        let _guard = self.registry.registration_lock();
        let core_ratio = self.registry.core_ratio();

        if !config.method_overrides.is_empty() {
            // Pools only for published methods with an explicit override.
            for (method, override_config) in &config.method_overrides {
                if !config.method_names.contains(method) {
                    continue;
                }
                let actives = if override_config.actives > 0 {
                    override_config.actives
                } else {
                    self.registry.default_actives()
                };
                let pool_key = format!("{}#{}", config.url, method);
                let spec = sized_spec(&pool_key, actives, core_ratio);
                self.registry
                    .method_pool_entry(&pool_key, || WorkerPool::new(spec));
                if let Some(agent) = &self.agent {
                    agent.bind_method_pool(actives_key(&pool_key), pool_key.as_str());
                }
                info!(pool = %pool_key, actives, "method pool provisioned");
            }
            return;
        }

        if config.actives == 0 {
            debug!(url = %config.url, "no capacity declared, no standalone pool");
            return;
        }
        let spec = sized_spec(&config.url, config.actives, core_ratio);
        self.registry
            .service_pool_entry(&config.url, || WorkerPool::new(spec));
        info!(url = %config.url, actives = config.actives, "service pool provisioned");
    }

    /// Tear down every pool the service owns. Requests already handed to a
    /// removed pool finish within the drain grace. Calling twice is safe.
    pub fn remove_service(&self, url: &str) {
        let removed = {
            let _guard = self.registry.registration_lock();
            self.registry.remove_service_pools(url)
        };
        if let Some(agent) = &self.agent {
            agent.unbind_service(url);
        }
        if removed.is_empty() {
            debug!(url, "no pools to remove");
            return;
        }
        info!(url, pools = removed.len(), "retiring service pools");
        for pool in removed {
            self.runtime.spawn(async move {
                retire(pool, RETIRE_GRACE).await;
            });
        }
    }
}

/// Configuration key carrying the actives bound of one method pool.
pub fn actives_key(pool_key: &str) -> String {
    format!("courier.provider.pool.{pool_key}.actives")
}
