//! Event filtering for PersistentVolumeClaim notifications
//!
//! Decides, from the notification alone, whether a claim change is worth a
//! reconcile. Unbound claims are never interesting. Beyond that we only need
//! to see every transition into "deletion requested while guarded by our
//! finalizer".

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::{reflector::ObjectRef, watcher};
use kube::{Resource, ResourceExt};

use crate::reconcilers::{bound_volume, has_finalizer};

/// A change to a watched object
#[derive(Clone, Debug, PartialEq)]
pub enum Notification<K> {
    /// First observation of the object
    Create { new: K },
    /// The object changed since it was last observed
    Update { old: K, new: K },
    /// The object was removed from the store
    Delete { old: K },
    /// The object was re-delivered by a relist without a known change
    Resync { current: K },
}

impl<K> Notification<K> {
    /// Label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Create { .. } => "create",
            Notification::Update { .. } => "update",
            Notification::Delete { .. } => "delete",
            Notification::Resync { .. } => "resync",
        }
    }

    /// The most recent state carried by the notification
    pub fn object(&self) -> &K {
        match self {
            Notification::Create { new } | Notification::Update { new, .. } => new,
            Notification::Delete { old } => old,
            Notification::Resync { current } => current,
        }
    }

    pub fn into_object(self) -> K {
        match self {
            Notification::Create { new } | Notification::Update { new, .. } => new,
            Notification::Delete { old } => old,
            Notification::Resync { current } => current,
        }
    }
}

fn is_deleting(claim: &PersistentVolumeClaim) -> bool {
    claim.metadata.deletion_timestamp.is_some()
}

/// Whether a claim notification should enqueue a reconcile
pub fn admits(notification: &Notification<PersistentVolumeClaim>) -> bool {
    if bound_volume(notification.object()).is_none() {
        return false;
    }

    match notification {
        Notification::Create { new } => has_finalizer(new.finalizers()),
        Notification::Update { old, new } => {
            let finalizer_flipped = has_finalizer(old.finalizers()) != has_finalizer(new.finalizers());
            let deletion_started = !is_deleting(old) && is_deleting(new);
            finalizer_flipped || deletion_started
        }
        // Cleanup has to happen before the store drops the object
        Notification::Delete { .. } => false,
        Notification::Resync { current } => has_finalizer(current.finalizers()),
    }
}

/// Turns raw watcher events into [`Notification`]s.
///
/// The watcher only reports current state, so the tracker remembers the last
/// state seen for each object to tell creations from updates and to supply
/// the old side of an update.
pub struct NotificationTracker<K>
where
    K: Resource,
    K::DynamicType: Eq + Hash,
{
    seen: HashMap<ObjectRef<K>, K>,
    relisted: HashSet<ObjectRef<K>>,
}

impl<K> Default for NotificationTracker<K>
where
    K: Resource,
    K::DynamicType: Eq + Hash,
{
    fn default() -> Self {
        Self {
            seen: HashMap::new(),
            relisted: HashSet::new(),
        }
    }
}

impl<K> NotificationTracker<K>
where
    K: Resource + Clone,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently remembered
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Feed one watcher event, returning the notifications it implies
    pub fn observe(&mut self, event: watcher::Event<K>) -> Vec<Notification<K>> {
        match event {
            watcher::Event::Apply(obj) => {
                let key = ObjectRef::from_obj(&obj);
                let notification = match self.seen.insert(key, obj.clone()) {
                    Some(old) => Notification::Update { old, new: obj },
                    None => Notification::Create { new: obj },
                };
                vec![notification]
            }
            watcher::Event::Delete(obj) => {
                self.seen.remove(&ObjectRef::from_obj(&obj));
                vec![Notification::Delete { old: obj }]
            }
            watcher::Event::Init => {
                self.relisted.clear();
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                let key = ObjectRef::from_obj(&obj);
                self.relisted.insert(key.clone());
                let notification = match self.seen.insert(key, obj.clone()) {
                    Some(_) => Notification::Resync { current: obj },
                    None => Notification::Create { new: obj },
                };
                vec![notification]
            }
            watcher::Event::InitDone => {
                // Objects missing from the relist were deleted while the watch was down
                let relisted = std::mem::take(&mut self.relisted);
                let vanished: Vec<ObjectRef<K>> = self
                    .seen
                    .keys()
                    .filter(|key| !relisted.contains(*key))
                    .cloned()
                    .collect();
                vanished
                    .into_iter()
                    .filter_map(|key| self.seen.remove(&key))
                    .map(|old| Notification::Delete { old })
                    .collect()
            }
        }
    }
}
