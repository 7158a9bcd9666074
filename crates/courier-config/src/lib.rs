//! Courier Configuration Provider
//!
//! The keyed configuration store the dispatch layer consumes: typed reads
//! with defaults plus a change-notification subscription. The dispatch core
//! only reacts to notifications and performs typed reads at startup; where
//! values actually come from (file, env, remote config service) is the
//! embedding application's concern.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::warn;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Parse {
        key: String,
        value: String,
        reason: String,
    },
}

/// Parse a raw configuration value into its expected type.
///
/// Used by the typed getters (which fall back to the default) and by change
/// listeners (which drop the single notification with a logged error).
pub fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Parse {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_or_default<T>(raw: Option<String>, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    match raw {
        None => default,
        Some(value) => match parse_value(key, &value) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(key = %key, error = %e, "malformed config value, using default");
                default
            }
        },
    }
}

/// Callback invoked when a configuration key changes.
///
/// May be called on an arbitrary thread supplied by the configuration
/// subsystem, and concurrently for different keys; implementations must be
/// safe under overlapping invocations.
pub trait ConfigListener: Send + Sync {
    fn on_key_updated(&self, key: &str, value: &str);
}

/// Keyed configuration store with typed reads and change subscription.
pub trait ConfigProvider: Send + Sync {
    /// Raw string value for a key, if present.
    fn get_raw(&self, key: &str) -> Option<String>;

    /// Register a listener for key changes.
    fn subscribe(&self, listener: Arc<dyn ConfigListener>);

    fn get_string(&self, key: &str, default: &str) -> String {
        self.get_raw(key).unwrap_or_else(|| default.to_string())
    }

    fn get_u32(&self, key: &str, default: u32) -> u32 {
        parse_or_default(self.get_raw(key), key, default)
    }

    fn get_usize(&self, key: &str, default: usize) -> usize {
        parse_or_default(self.get_raw(key), key, default)
    }

    fn get_f32(&self, key: &str, default: f32) -> f32 {
        parse_or_default(self.get_raw(key), key, default)
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        parse_or_default(self.get_raw(key), key, default)
    }
}

/// In-memory provider used by embedding code and tests. `set` mutates the
/// store and delivers the change to every subscribed listener on the calling
/// thread.
#[derive(Default)]
pub struct MemoryConfigProvider {
    values: DashMap<String, String>,
    listeners: RwLock<Vec<Arc<dyn ConfigListener>>>,
}

impl MemoryConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let provider = Self::new();
        for (key, value) in values {
            provider.values.insert(key.into(), value.into());
        }
        provider
    }

    /// Store a value and notify subscribers.
    pub fn set(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());

        // Snapshot under the read lock, deliver outside it: a listener may
        // subscribe another listener or trigger further sets.
        let listeners: Vec<_> = self.listeners.read().clone();
        for listener in listeners {
            listener.on_key_updated(key, value);
        }
    }

    pub fn remove(&self, key: &str) {
        self.values.remove(key);
    }
}

impl ConfigProvider for MemoryConfigProvider {
    fn get_raw(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|entry| entry.value().clone())
    }

    fn subscribe(&self, listener: Arc<dyn ConfigListener>) {
        self.listeners.write().push(listener);
    }
}
