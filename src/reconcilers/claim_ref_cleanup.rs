//! claimRef cleanup reconciler
//!
//! Runs the cleanup protocol for one claim:
//! 1. Re-read the claim; a missing claim needs nothing.
//! 2. Only claims marked for deletion that still carry our finalizer are
//!    touched.
//! 3. Clear the bound volume's claimRef if it points at this claim.
//! 4. Remove our finalizer.
//!
//! Step 3 must be committed (or found unnecessary) before step 4. Once the
//! finalizer is gone the API server may delete the claim, and a claimRef left
//! behind would dangle forever. Every write follows a fresh read and an
//! equality check, so the whole protocol can be re-run from the top at any
//! point.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::adapters::{ClaimKey, ObjectStore};
use crate::error::{Error, Result};
use crate::metrics;

/// Finalizer owned by this controller. Users add it; we only ever remove it.
pub const PV_CLAIM_REF_CLEANUP_FINALIZER: &str = "liberator.io/pv-claim-ref-cleanup";

/// Terminal branch taken by a successful reconciliation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The claim no longer exists
    ClaimGone,
    /// The claim is alive or does not carry our finalizer
    NothingToDo,
    /// The finalizer was removed
    Released { claim_ref_cleared: bool },
}

/// Result of one reconcile invocation, as reported to the controller host
#[derive(Debug)]
pub enum Outcome {
    Success(Completion),
    /// Requeue with backoff and re-run from the top
    RetryableFailure(Error),
    /// Contract violation; log and drop the request
    FatalFailure(Error),
}

impl Outcome {
    fn from_result(result: Result<Completion>) -> Self {
        match result {
            Ok(completion) => Outcome::Success(completion),
            Err(e) if e.is_retryable() => Outcome::RetryableFailure(e),
            Err(e) => Outcome::FatalFailure(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::RetryableFailure(_) => "retryable_failure",
            Outcome::FatalFailure(_) => "fatal_failure",
        }
    }
}

/// Whether the finalizer list carries our finalizer
pub fn has_finalizer(finalizers: &[String]) -> bool {
    finalizers.iter().any(|f| f == PV_CLAIM_REF_CLEANUP_FINALIZER)
}

/// The finalizer list without ours, other entries kept in order
pub fn without_finalizer(finalizers: &[String]) -> Vec<String> {
    finalizers
        .iter()
        .filter(|f| f.as_str() != PV_CLAIM_REF_CLEANUP_FINALIZER)
        .cloned()
        .collect()
}

/// Name of the volume the claim is bound to, if any
pub fn bound_volume(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_name.as_deref())
        .filter(|name| !name.is_empty())
}

/// Whether the volume's claimRef names this claim (name and namespace)
pub fn claim_ref_matches(volume: &PersistentVolume, claim: &PersistentVolumeClaim) -> bool {
    let Some(claim_ref) = volume.spec.as_ref().and_then(|spec| spec.claim_ref.as_ref()) else {
        return false;
    };
    claim_ref.name.as_deref() == claim.metadata.name.as_deref()
        && claim_ref.namespace.as_deref() == claim.metadata.namespace.as_deref()
}

fn validate_key(key: &ClaimKey) -> Result<()> {
    if key.name.is_empty() {
        return Err(Error::invalid_identity(format!("claim {} has an empty name", key)));
    }
    if key.namespace.is_empty() {
        return Err(Error::invalid_identity(format!(
            "claim {} has an empty namespace",
            key
        )));
    }
    Ok(())
}

/// Executes the claimRef cleanup protocol against an [`ObjectStore`]
#[derive(Clone)]
pub struct ClaimRefReconciler {
    store: Arc<dyn ObjectStore>,
    timeout: Duration,
}

impl ClaimRefReconciler {
    pub fn new(store: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Reconcile one claim identity.
    ///
    /// Single attempt: errors are classified and returned, never retried
    /// here. Cancellation or the deadline abort in-flight store calls and
    /// report a retryable failure.
    #[instrument(skip(self, cancel), fields(claim = %key.name, namespace = %key.namespace))]
    pub async fn reconcile(&self, key: &ClaimKey, cancel: CancellationToken) -> Outcome {
        if let Err(e) = validate_key(key) {
            return Outcome::FatalFailure(e);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(self.timeout, self.run(key)) => {
                result.unwrap_or_else(|_| Err(Error::DeadlineExceeded(self.timeout)))
            }
        };

        Outcome::from_result(result)
    }

    async fn run(&self, key: &ClaimKey) -> Result<Completion> {
        info!("Received event for PVC");

        let claim = match self.store.get_claim(key).await {
            Ok(claim) => claim,
            Err(e) if e.is_not_found() => {
                debug!("PVC no longer exists, nothing to do");
                return Ok(Completion::ClaimGone);
            }
            Err(e) => return Err(e.into()),
        };

        let deleting = claim.metadata.deletion_timestamp.is_some();
        if !deleting || !has_finalizer(claim.finalizers()) {
            debug!(deleting, "PVC not awaiting cleanup");
            return Ok(Completion::NothingToDo);
        }

        self.handle_deletion(key, claim).await
    }

    async fn handle_deletion(
        &self,
        key: &ClaimKey,
        claim: PersistentVolumeClaim,
    ) -> Result<Completion> {
        let volume_name = bound_volume(&claim).map(str::to_owned);
        info!(volume = volume_name.as_deref().unwrap_or(""), "Processing PVC deletion");

        let claim_ref_cleared = match volume_name.as_deref() {
            Some(volume_name) => self.clear_claim_ref(&claim, volume_name).await?,
            None => false,
        };

        self.remove_finalizer(key, claim).await?;
        Ok(Completion::Released { claim_ref_cleared })
    }

    /// Clear the volume's claimRef if it points at `claim`.
    ///
    /// Returns whether a write happened. A missing volume has nothing to
    /// clear.
    async fn clear_claim_ref(
        &self,
        claim: &PersistentVolumeClaim,
        volume_name: &str,
    ) -> Result<bool> {
        let volume = match self.store.get_volume(volume_name).await {
            Ok(volume) => volume,
            Err(e) if e.is_not_found() => {
                info!(volume = %volume_name, "PV not found, nothing to clear");
                return Ok(false);
            }
            Err(e) => {
                error!(volume = %volume_name, error = %e, "Failed to get PV");
                return Err(e.into());
            }
        };

        if !claim_ref_matches(&volume, claim) {
            debug!(volume = %volume_name, "PV claimRef does not reference this PVC");
            return Ok(false);
        }

        info!(volume = %volume_name, "Clearing claimRef from PV");
        let mut updated = volume;
        if let Some(spec) = updated.spec.as_mut() {
            spec.claim_ref = None;
        }

        if let Err(e) = self.store.update_volume(volume_name, &updated).await {
            error!(volume = %volume_name, error = %e, "Failed to update PV");
            return Err(e.into());
        }

        metrics::CLAIM_REFS_CLEARED.inc();
        info!(volume = %volume_name, "Successfully cleared claimRef from PV");
        Ok(true)
    }

    async fn remove_finalizer(&self, key: &ClaimKey, claim: PersistentVolumeClaim) -> Result<()> {
        info!("Removing finalizer from PVC");

        let mut updated = claim;
        let remaining = without_finalizer(updated.finalizers());
        updated.metadata.finalizers = Some(remaining);

        if let Err(e) = self.store.update_claim(key, &updated).await {
            error!(error = %e, "Failed to remove finalizer from PVC");
            return Err(e.into());
        }

        metrics::FINALIZERS_RELEASED.inc();
        info!("Successfully removed finalizer from PVC");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ObjectReference, PersistentVolumeClaimSpec, PersistentVolumeSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn claim(name: &str, namespace: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn volume_referencing(name: Option<&str>, namespace: Option<&str>) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some("v1".to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                claim_ref: Some(ObjectReference {
                    name: name.map(str::to_string),
                    namespace: namespace.map(str::to_string),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn finalizer_detection() {
        let finalizers = vec![
            "kubernetes.io/pvc-protection".to_string(),
            PV_CLAIM_REF_CLEANUP_FINALIZER.to_string(),
        ];
        assert!(has_finalizer(&finalizers));
        assert!(!has_finalizer(&finalizers[..1]));
        assert!(!has_finalizer(&[]));
    }

    #[test]
    fn without_finalizer_keeps_other_entries_in_order() {
        let finalizers = vec![
            "a.io/one".to_string(),
            PV_CLAIM_REF_CLEANUP_FINALIZER.to_string(),
            "b.io/two".to_string(),
        ];
        assert_eq!(
            without_finalizer(&finalizers),
            vec!["a.io/one".to_string(), "b.io/two".to_string()]
        );
    }

    #[test]
    fn claim_ref_must_match_name_and_namespace() {
        let c1 = claim("c1", "ns1");
        assert!(claim_ref_matches(&volume_referencing(Some("c1"), Some("ns1")), &c1));
        assert!(!claim_ref_matches(&volume_referencing(Some("c1"), Some("ns2")), &c1));
        assert!(!claim_ref_matches(&volume_referencing(Some("other"), Some("ns1")), &c1));
        assert!(!claim_ref_matches(&volume_referencing(None, None), &c1));
    }

    #[test]
    fn volume_without_claim_ref_never_matches() {
        let volume = PersistentVolume {
            spec: Some(PersistentVolumeSpec::default()),
            ..Default::default()
        };
        assert!(!claim_ref_matches(&volume, &claim("c1", "ns1")));
        assert!(!claim_ref_matches(&PersistentVolume::default(), &claim("c1", "ns1")));
    }

    #[test]
    fn empty_volume_name_is_unbound() {
        let mut c = claim("c1", "ns1");
        assert_eq!(bound_volume(&c), None);
        c.spec = Some(PersistentVolumeClaimSpec {
            volume_name: Some(String::new()),
            ..Default::default()
        });
        assert_eq!(bound_volume(&c), None);
        c.spec = Some(PersistentVolumeClaimSpec {
            volume_name: Some("v1".to_string()),
            ..Default::default()
        });
        assert_eq!(bound_volume(&c), Some("v1"));
    }

    #[test]
    fn identity_validation() {
        assert!(validate_key(&ClaimKey::new("ns1", "c1")).is_ok());
        assert!(matches!(
            validate_key(&ClaimKey::new("", "c1")),
            Err(Error::InvalidIdentity(_))
        ));
        assert!(matches!(
            validate_key(&ClaimKey::new("ns1", "")),
            Err(Error::InvalidIdentity(_))
        ));
    }
}
