//! ReconfigAgent - Applies configuration changes to live pools
//!
//! Listens on the configuration provider and translates key updates into
//! registry mutations: flag and ratio stores for the cheap tunables, and
//! build-then-swap-then-drain for sizing changes. Notifications can arrive
//! on arbitrary threads, so the agent carries a runtime handle captured at
//! construction for spawning drains.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, error, info};

use courier_common::PoolSpec;
use courier_config::{parse_value, ConfigListener};

use crate::pool::{retire, WorkerPool};
use crate::registry::{
    PoolRegistry, CANCEL_RATIO_KEY, CORE_RATIO_KEY, SLOW_POOL_ENABLE_KEY,
};

const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Configuration keys whose updates resize the shared pool.
#[derive(Debug, Clone)]
pub struct SharedPoolKeys {
    pub core_size: String,
    pub max_size: String,
    pub queue_size: String,
}

enum SharedField {
    Core,
    Max,
    Queue,
}

pub struct ReconfigAgent {
    registry: Arc<PoolRegistry>,
    shared_keys: Option<SharedPoolKeys>,
    /// config key -> method-tier pool key ("url#method").
    method_bindings: DashMap<String, String>,
    /// Serializes overlapping pool swaps; never taken on the submission path.
    swap_lock: Mutex<()>,
    runtime: Handle,
    drain_grace: Duration,
}

impl ReconfigAgent {
    /// Must be called from within a tokio runtime; the current handle is
    /// captured for spawning pool drains from configuration callbacks.
    pub fn new(registry: Arc<PoolRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            shared_keys: None,
            method_bindings: DashMap::new(),
            swap_lock: Mutex::new(()),
            runtime: Handle::current(),
            drain_grace: DRAIN_GRACE,
        })
    }

    /// Like [`ReconfigAgent::new`], also watching the given keys for shared
    /// pool resizes.
    pub fn with_shared_keys(registry: Arc<PoolRegistry>, keys: SharedPoolKeys) -> Arc<Self> {
        Arc::new(Self {
            registry,
            shared_keys: Some(keys),
            method_bindings: DashMap::new(),
            swap_lock: Mutex::new(()),
            runtime: Handle::current(),
            drain_grace: DRAIN_GRACE,
        })
    }

    /// Watch `config_key` for actives updates to the method-tier pool at
    /// `pool_key`.
    pub fn bind_method_pool(&self, config_key: impl Into<String>, pool_key: impl Into<String>) {
        self.method_bindings.insert(config_key.into(), pool_key.into());
    }

    fn set_slow_enabled(&self, key: &str, value: &str) {
        match parse_value::<bool>(key, value) {
            Ok(enabled) => {
                self.registry.set_slow_enabled(enabled);
                info!(enabled, "slow request pool toggled");
            }
            Err(err) => error!(%err, "ignoring slow pool toggle update"),
        }
    }

    fn set_cancel_ratio(&self, key: &str, value: &str) {
        match parse_value::<f32>(key, value) {
            Ok(ratio) => {
                self.registry.set_cancel_ratio(ratio);
                info!(ratio, "cancel ratio updated");
            }
            Err(err) => error!(%err, "ignoring cancel ratio update"),
        }
    }

    fn set_core_ratio(&self, key: &str, value: &str) {
        match parse_value::<f32>(key, value) {
            Ok(ratio) => {
                self.registry.set_core_ratio(ratio);
                info!(ratio, "core sizing ratio updated");
            }
            Err(err) => error!(%err, "ignoring core ratio update"),
        }
    }

    /// Build-then-swap-then-drain for one shared pool sizing field. An
    /// update carrying the current value is a no-op and keeps the live
    /// pool untouched.
    fn resize_shared(&self, field: SharedField, key: &str, value: &str) {
        let new_size = match parse_value::<usize>(key, value) {
            Ok(size) => size,
            Err(err) => {
                error!(%err, "ignoring shared pool resize");
                return;
            }
        };

        let _guard = self.swap_lock.lock();
        let current = self.registry.shared_pool();
        let mut spec = current.spec().clone();
        let unchanged = match field {
            SharedField::Core => {
                let same = spec.core_size == new_size;
                spec.core_size = new_size;
                same
            }
            SharedField::Max => {
                let same = spec.max_size == new_size;
                spec.max_size = new_size;
                same
            }
            SharedField::Queue => {
                let same = spec.queue_capacity == new_size;
                spec.queue_capacity = new_size;
                same
            }
        };
        if unchanged {
            debug!(key, value, "shared pool resize is a no-op");
            return;
        }

        info!(
            core = spec.core_size,
            max = spec.max_size,
            queue = spec.queue_capacity,
            "replacing shared pool"
        );
        let replacement = WorkerPool::new(spec);
        let retired = self.registry.swap_shared(replacement);
        let grace = self.drain_grace;
        self.runtime.spawn(async move {
            retire(retired, grace).await;
        });
    }

    /// Drop bindings owned by a retracted service.
    pub fn unbind_service(&self, url: &str) {
        let prefix = format!("{url}#");
        self.method_bindings
            .retain(|_, pool_key| !pool_key.starts_with(&prefix));
    }

    /// Rebuild one method-tier pool from an actives update, sized with the
    /// registry's core ratio. Only pools that are still registered are
    /// rebuilt; an update for a retracted service drops the stale binding
    /// instead of resurrecting its pool.
    fn resize_method_pool(&self, binding_key: &str, pool_key: &str, config_key: &str, value: &str) {
        let actives = match parse_value::<u32>(config_key, value) {
            Ok(actives) => actives,
            Err(err) => {
                error!(%err, pool = pool_key, "ignoring method pool resize");
                return;
            }
        };

        let _guard = self.swap_lock.lock();
        let current = match self.registry.method_pool(pool_key) {
            Some(pool) => pool,
            None => {
                self.method_bindings.remove(binding_key);
                debug!(pool = pool_key, "no live pool behind binding, binding dropped");
                return;
            }
        };
        let spec = sized_spec(pool_key, actives, self.registry.core_ratio());
        if *current.spec() == spec {
            debug!(pool = pool_key, "method pool resize is a no-op");
            return;
        }

        info!(
            pool = pool_key,
            core = spec.core_size,
            max = spec.max_size,
            queue = spec.queue_capacity,
            "replacing method pool"
        );
        let replacement = WorkerPool::new(spec);
        if let Some(retired) = self.registry.replace_method_pool(pool_key, replacement) {
            let grace = self.drain_grace;
            self.runtime.spawn(async move {
                retire(retired, grace).await;
            });
        }
    }
}

impl ConfigListener for ReconfigAgent {
    /// Keys are matched by suffix so provider-prefixed variants of the
    /// well-known keys are recognized.
    fn on_key_updated(&self, key: &str, value: &str) {
        if key.ends_with(SLOW_POOL_ENABLE_KEY) {
            self.set_slow_enabled(key, value);
            return;
        }
        if key.ends_with(CANCEL_RATIO_KEY) {
            self.set_cancel_ratio(key, value);
            return;
        }
        if key.ends_with(CORE_RATIO_KEY) {
            self.set_core_ratio(key, value);
            return;
        }
        if let Some(keys) = &self.shared_keys {
            if key.ends_with(keys.core_size.as_str()) {
                self.resize_shared(SharedField::Core, key, value);
                return;
            }
            if key.ends_with(keys.max_size.as_str()) {
                self.resize_shared(SharedField::Max, key, value);
                return;
            }
            if key.ends_with(keys.queue_size.as_str()) {
                self.resize_shared(SharedField::Queue, key, value);
                return;
            }
        }
        let binding = self.method_bindings.iter().find_map(|entry| {
            key.ends_with(entry.key().as_str())
                .then(|| (entry.key().clone(), entry.value().clone()))
        });
        if let Some((binding_key, pool_key)) = binding {
            self.resize_method_pool(&binding_key, &pool_key, key, value);
            return;
        }
        debug!(key, "unrecognized configuration key, ignored");
    }
}

/// Pool sizing from a concurrency bound: maximum and queue equal the bound,
/// core at `actives / core_ratio`, floored and clamped to at least one.
pub fn sized_spec(name: &str, actives: u32, core_ratio: f32) -> PoolSpec {
    let actives = actives as usize;
    let core = if core_ratio > 0.0 {
        ((actives as f32 / core_ratio).floor() as usize).max(1)
    } else {
        1
    };
    PoolSpec::new(name, core, actives, actives)
}
