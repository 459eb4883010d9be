//! Configuration for the admission pools.

use std::time::Duration;

/// Capacity entry for a single model.
#[derive(Debug, Clone)]
pub struct ModelCapacity {
    /// Model name as it appears in request bodies.
    pub name: String,

    /// Maximum concurrent admissions. Non-positive values are replaced with
    /// a fallback at registry build time.
    pub capacity: i64,
}

impl ModelCapacity {
    pub fn new(name: impl Into<String>, capacity: i64) -> Self {
        Self { name: name.into(), capacity }
    }
}

/// Configuration for building a [`PoolRegistry`](super::PoolRegistry).
#[derive(Debug, Clone)]
pub struct PoolsConfig {
    /// Per-model capacities.
    pub models: Vec<ModelCapacity>,

    /// Capacity of the synthesized `default` pool.
    pub default_capacity: usize,

    /// Maximum time a request may wait for a free slot before being
    /// rejected.
    pub admission_wait: Duration,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            default_capacity: 100,
            admission_wait: Duration::from_secs(75),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = PoolsConfig::default();
        assert!(config.models.is_empty());
        assert_eq!(config.default_capacity, 100);
        assert_eq!(config.admission_wait, Duration::from_secs(75));
    }
}
