//! Prometheus metrics and probe endpoints for the liberator controller
//!
//! This module exposes metrics for monitoring controller health and
//! reconciliation progress, plus the `/healthz` and `/readyz` probes.

mod prometheus;

pub use prometheus::*;
