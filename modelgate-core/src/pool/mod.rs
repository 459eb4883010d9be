//! Per-model admission control.
//!
//! Each configured model gets a bounded pool of admission slots; a request
//! holds a slot from admission until its response is fully delivered.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Incoming Requests                     │
//! └───────────────────────────┬─────────────────────────────┘
//!                             │ model name
//!                    ┌────────▼────────┐
//!                    │  PoolRegistry   │ ← name → pool, built once
//!                    │  ┌───────────┐  │
//!                    │  │ llama3    │  │
//!                    │  │ mistral   │  │
//!                    │  │ default   │  │
//!                    │  └───────────┘  │
//!                    └────────┬────────┘
//!                             │ acquire (≤ 75 s, FIFO)
//!                    ┌────────▼────────┐
//!                    │ AdmissionToken  │ ← slot held until drop
//!                    └─────────────────┘
//! ```
//!
//! Every admission event marks the pool's metrics dirty; a reporter task per
//! pool turns those changes into rate-limited log lines.

mod config;
mod metrics;
mod registry;
mod reporter;

pub use config::{ModelCapacity, PoolsConfig};
pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use registry::{AcquireError, AdmissionToken, ModelPool, PoolRegistry, DEFAULT_POOL};
pub use reporter::spawn_reporters;
