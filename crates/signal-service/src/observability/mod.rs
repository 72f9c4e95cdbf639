//! Observability: health probes.

/// Module for liveness/readiness endpoints
pub mod health;

pub use health::{health_router, HealthState};
