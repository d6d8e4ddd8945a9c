//! Typed get/update access to claims and volumes
//!
//! Every update is a full replace carrying the `resourceVersion` of the copy
//! that was read, so the API server rejects stale writes with a conflict
//! instead of silently overwriting a concurrent change.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::{api::PostParams, Api, Client, ResourceExt};

use crate::error::StoreError;

pub const CLAIM_KIND: &str = "PersistentVolumeClaim";
pub const VOLUME_KIND: &str = "PersistentVolume";

/// Namespaced identity of a claim
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimKey {
    pub namespace: String,
    pub name: String,
}

impl ClaimKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Identity of an observed claim object
    pub fn from_claim(claim: &PersistentVolumeClaim) -> Self {
        Self::new(claim.namespace().unwrap_or_default(), claim.name_any())
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Object store operations the reconciler depends on
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read a claim by identity
    async fn get_claim(&self, key: &ClaimKey) -> Result<PersistentVolumeClaim, StoreError>;

    /// Write a claim, conditional on the resourceVersion it carries
    async fn update_claim(
        &self,
        key: &ClaimKey,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, StoreError>;

    /// Read a cluster-scoped volume by name
    async fn get_volume(&self, name: &str) -> Result<PersistentVolume, StoreError>;

    /// Write a volume, conditional on the resourceVersion it carries
    async fn update_volume(
        &self,
        name: &str,
        volume: &PersistentVolume,
    ) -> Result<PersistentVolume, StoreError>;
}

/// [`ObjectStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get_claim(&self, key: &ClaimKey) -> Result<PersistentVolumeClaim, StoreError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &key.namespace);
        api.get(&key.name)
            .await
            .map_err(|e| StoreError::from_kube(CLAIM_KIND, key.to_string(), e))
    }

    async fn update_claim(
        &self,
        key: &ClaimKey,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, StoreError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &key.namespace);
        api.replace(&key.name, &PostParams::default(), claim)
            .await
            .map_err(|e| StoreError::from_kube(CLAIM_KIND, key.to_string(), e))
    }

    async fn get_volume(&self, name: &str) -> Result<PersistentVolume, StoreError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| StoreError::from_kube(VOLUME_KIND, name, e))
    }

    async fn update_volume(
        &self,
        name: &str,
        volume: &PersistentVolume,
    ) -> Result<PersistentVolume, StoreError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.replace(name, &PostParams::default(), volume)
            .await
            .map_err(|e| StoreError::from_kube(VOLUME_KIND, name, e))
    }
}
