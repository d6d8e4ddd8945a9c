//! Reconcilers for PersistentVolumeClaims
//!
//! Reconcilers hold the business logic executed per claim identity:
//! - Reading current claim and volume state
//! - Clearing the volume's claimRef when it points back at the claim
//! - Releasing the claim's finalizer once the volume is detached

pub mod claim_ref_cleanup;

pub use claim_ref_cleanup::{
    bound_volume, claim_ref_matches, has_finalizer, without_finalizer, ClaimRefReconciler,
    Completion, Outcome, PV_CLAIM_REF_CLEANUP_FINALIZER,
};
