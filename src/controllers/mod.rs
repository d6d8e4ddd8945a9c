//! Kubernetes controllers for liberator
//!
//! This module wires the claim watch, event filter and reconciler into the
//! kube runtime, which deduplicates work per claim and bounds concurrency.

pub mod backoff;
mod claim_controller;

pub use claim_controller::run as run_claim_controller;

use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::adapters::{KubeObjectStore, ObjectStore};
use crate::config::Config;
use crate::reconcilers::ClaimRefReconciler;
use backoff::FailureTracker;

/// Shared context for the claim controller
pub struct Context {
    /// Cleanup protocol
    pub reconciler: ClaimRefReconciler,
    /// Requeue backoff per claim
    pub failures: FailureTracker,
    /// Cancelled when the process shuts down or loses leadership
    pub shutdown: CancellationToken,
    /// Upper bound on concurrently running reconciles
    pub max_concurrent_reconciles: u16,
}

impl Context {
    /// Create a new context backed by the API server
    pub fn new(client: Client, config: &Config, shutdown: CancellationToken) -> Self {
        let store: Arc<dyn ObjectStore> = Arc::new(KubeObjectStore::new(client));
        Self {
            reconciler: ClaimRefReconciler::new(store, config.reconcile_timeout()),
            failures: FailureTracker::default(),
            shutdown,
            max_concurrent_reconciles: config.max_concurrent_reconciles,
        }
    }
}
