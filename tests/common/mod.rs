//! In-memory object store for reconciler tests
//!
//! Behaves like the API server where it matters to the cleanup protocol:
//! writes are conditional on resourceVersion, and a claim marked for deletion
//! disappears once its last finalizer is removed.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use liberator::adapters::{ClaimKey, ObjectStore, CLAIM_KIND, VOLUME_KIND};
use liberator::reconcilers::PV_CLAIM_REF_CLEANUP_FINALIZER;
use liberator::StoreError;

/// Store operations that faults can target
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    GetClaim,
    UpdateClaim,
    GetVolume,
    UpdateVolume,
}

/// Injected failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Conflict,
    Transient,
    /// Never completes
    Hang,
}

/// A successful write
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Write {
    Claim(ClaimKey),
    Volume(String),
}

#[derive(Default)]
struct State {
    claims: HashMap<ClaimKey, PersistentVolumeClaim>,
    volumes: HashMap<String, PersistentVolume>,
    next_version: u64,
    writes: Vec<Write>,
    faults: HashMap<Op, Fault>,
    sticky: HashSet<Op>,
    calls: Vec<Op>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_claim(&self, mut claim: PersistentVolumeClaim) {
        let mut state = self.state.lock().unwrap();
        claim.metadata.resource_version = Some(state.bump());
        state.claims.insert(ClaimKey::from_claim(&claim), claim);
    }

    pub fn insert_volume(&self, mut volume: PersistentVolume) {
        let mut state = self.state.lock().unwrap();
        volume.metadata.resource_version = Some(state.bump());
        let name = volume.metadata.name.clone().unwrap_or_default();
        state.volumes.insert(name, volume);
    }

    pub fn claim(&self, key: &ClaimKey) -> Option<PersistentVolumeClaim> {
        self.state.lock().unwrap().claims.get(key).cloned()
    }

    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.state.lock().unwrap().volumes.get(name).cloned()
    }

    /// Fail the next call of `op` once
    pub fn fail_next(&self, op: Op, fault: Fault) {
        let mut state = self.state.lock().unwrap();
        state.faults.insert(op, fault);
        state.sticky.remove(&op);
    }

    /// Fail every call of `op` until cleared
    pub fn fail_always(&self, op: Op, fault: Fault) {
        let mut state = self.state.lock().unwrap();
        state.faults.insert(op, fault);
        state.sticky.insert(op);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock().unwrap();
        state.faults.clear();
        state.sticky.clear();
    }

    pub fn writes(&self) -> Vec<Write> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn volume_writes(&self) -> usize {
        self.writes()
            .iter()
            .filter(|w| matches!(w, Write::Volume(_)))
            .count()
    }

    pub fn calls(&self) -> Vec<Op> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Record the call and take any fault armed for it
    fn enter(&self, op: Op) -> Option<Fault> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(op);
        if state.sticky.contains(&op) {
            state.faults.get(&op).copied()
        } else {
            state.faults.remove(&op)
        }
    }

    async fn inject(&self, op: Op, kind: &'static str, name: &str) -> Result<(), StoreError> {
        match self.enter(op) {
            None => Ok(()),
            Some(Fault::Conflict) => Err(StoreError::Conflict {
                kind,
                name: name.to_string(),
            }),
            Some(Fault::Transient) => Err(StoreError::transient(kind, name, "connection reset")),
            Some(Fault::Hang) => std::future::pending().await,
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get_claim(&self, key: &ClaimKey) -> Result<PersistentVolumeClaim, StoreError> {
        self.inject(Op::GetClaim, CLAIM_KIND, &key.to_string()).await?;
        self.claim(key).ok_or_else(|| StoreError::NotFound {
            kind: CLAIM_KIND,
            name: key.to_string(),
        })
    }

    async fn update_claim(
        &self,
        key: &ClaimKey,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, StoreError> {
        self.inject(Op::UpdateClaim, CLAIM_KIND, &key.to_string()).await?;

        let mut state = self.state.lock().unwrap();
        let current = state.claims.get(key).ok_or_else(|| StoreError::NotFound {
            kind: CLAIM_KIND,
            name: key.to_string(),
        })?;
        if current.metadata.resource_version != claim.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: CLAIM_KIND,
                name: key.to_string(),
            });
        }

        let mut stored = claim.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.writes.push(Write::Claim(key.clone()));

        let finalizers_left = stored
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if stored.metadata.deletion_timestamp.is_some() && !finalizers_left {
            state.claims.remove(key);
        } else {
            state.claims.insert(key.clone(), stored.clone());
        }
        Ok(stored)
    }

    async fn get_volume(&self, name: &str) -> Result<PersistentVolume, StoreError> {
        self.inject(Op::GetVolume, VOLUME_KIND, name).await?;
        self.volume(name).ok_or_else(|| StoreError::NotFound {
            kind: VOLUME_KIND,
            name: name.to_string(),
        })
    }

    async fn update_volume(
        &self,
        name: &str,
        volume: &PersistentVolume,
    ) -> Result<PersistentVolume, StoreError> {
        self.inject(Op::UpdateVolume, VOLUME_KIND, name).await?;

        let mut state = self.state.lock().unwrap();
        let current = state.volumes.get(name).ok_or_else(|| StoreError::NotFound {
            kind: VOLUME_KIND,
            name: name.to_string(),
        })?;
        if current.metadata.resource_version != volume.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: VOLUME_KIND,
                name: name.to_string(),
            });
        }

        let mut stored = volume.clone();
        stored.metadata.resource_version = Some(state.bump());
        state.writes.push(Write::Volume(name.to_string()));
        state.volumes.insert(name.to_string(), stored.clone());
        Ok(stored)
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn claim(name: &str, namespace: &str, volume: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            finalizers: Some(vec![
                "kubernetes.io/pvc-protection".to_string(),
                PV_CLAIM_REF_CLEANUP_FINALIZER.to_string(),
            ]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            volume_name: Some(volume.to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn deleting(mut claim: PersistentVolumeClaim) -> PersistentVolumeClaim {
    claim.metadata.deletion_timestamp = Some(Time(Utc::now()));
    claim
}

pub fn without_guard(mut claim: PersistentVolumeClaim) -> PersistentVolumeClaim {
    claim.metadata.finalizers = Some(vec!["kubernetes.io/pvc-protection".to_string()]);
    claim
}

pub fn volume(name: &str, claim_ref: Option<(&str, &str)>) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            claim_ref: claim_ref.map(|(name, namespace)| ObjectReference {
                kind: Some("PersistentVolumeClaim".to_string()),
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// (name, namespace) of the volume's claimRef
pub fn claim_ref_of(volume: &PersistentVolume) -> Option<(String, String)> {
    let claim_ref = volume.spec.as_ref()?.claim_ref.as_ref()?;
    Some((
        claim_ref.name.clone().unwrap_or_default(),
        claim_ref.namespace.clone().unwrap_or_default(),
    ))
}

pub fn has_guard(claim: &PersistentVolumeClaim) -> bool {
    claim
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == PV_CLAIM_REF_CLEANUP_FINALIZER))
}
