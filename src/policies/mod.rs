//! Retry policies.
//!
//! ## Contents
//! - [`BackoffPolicy`] how retry delays evolve (first / factor / max + jitter)
//! - [`JitterPolicy`]  randomization strategy to avoid synchronized retries
//!
//! ## Wiring
//! ```text
//! ListenerConfig.reconnect ──► listener reconnect loop   (BackoffPolicy::reconnect)
//! DispatchConfig.backoff   ──► per-subscriber delivery   (BackoffPolicy::delivery)
//! ReconcileConfig.retry    ──► snapshot query / outbox commit retries
//! ```

mod backoff;
mod jitter;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
