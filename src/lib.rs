//! liberator: PersistentVolumeClaim claimRef cleanup controller
//!
//! Claims carrying the `liberator.io/pv-claim-ref-cleanup` finalizer get
//! their bound PersistentVolume's claimRef cleared before the finalizer is
//! released, so deleting the claim never leaves the volume pointing at a
//! claim that no longer exists.

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod error;
pub mod filter;
pub mod leader_election;
pub mod metrics;
pub mod reconcilers;

pub use error::{Error, Result, StoreError};
