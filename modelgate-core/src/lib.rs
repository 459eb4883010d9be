// Modelgate Core Library
//
// Admission control primitives for the modelgate proxy: per-model bounded
// pools, one-shot admission tokens, and the change-driven metrics reporter.

pub mod pool;

pub use pool::{
    spawn_reporters, AcquireError, AdmissionToken, MetricsSnapshot, ModelCapacity, ModelPool,
    PoolMetrics, PoolRegistry, PoolsConfig, DEFAULT_POOL,
};
