//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use modelgate_core::{PoolRegistry, PoolsConfig};

use crate::forwarder::{Forwarder, ForwarderError};
use crate::ServerConfig;

/// State shared across all request handlers.
#[derive(Debug)]
pub struct AppState {
    /// Admission pools, one per configured model plus `default`.
    pub registry: Arc<PoolRegistry>,

    /// Upstream client.
    pub forwarder: Forwarder,

    /// Absolute bound on a request from receipt to terminal state.
    pub lifecycle_timeout: Duration,
}

impl AppState {
    /// Build the state for a server configuration.
    pub fn new(config: &ServerConfig) -> Result<Self, ForwarderError> {
        let registry = PoolRegistry::new(PoolsConfig {
            models: config.models.clone(),
            default_capacity: config.default_capacity,
            admission_wait: config.admission_wait,
        });

        Ok(Self {
            registry: Arc::new(registry),
            forwarder: Forwarder::new(&config.backend_url)?,
            lifecycle_timeout: config.lifecycle_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_core::ModelCapacity;

    #[test]
    fn state_builds_pools_from_config() {
        let state = AppState::new(&ServerConfig {
            models: vec![ModelCapacity::new("m", 3)],
            default_capacity: 5,
            ..ServerConfig::default()
        })
        .unwrap();

        assert_eq!(state.registry.lookup("m").capacity(), 3);
        assert_eq!(state.registry.lookup("other").capacity(), 5);
        assert_eq!(state.lifecycle_timeout, Duration::from_secs(99));
    }
}
