//! Reusable building blocks consumed by the orchestrator. Time-dependent
//! primitives take an explicit `Instant` on their `*_at` variants so tests
//! stay deterministic.

pub mod batch;
pub mod cache;
pub mod debounce;
pub mod metrics;
pub mod rate;

pub use batch::Batcher;
pub use cache::TtlCache;
pub use debounce::Debouncer;
pub use metrics::Percentiles;
pub use rate::RateLimiter;
