//! Provisioned state
//!
//! [`ProvisionedSet`] is the only shared mutable state of a run. Each id is
//! written at most once and readers only ever see fully built resources.

use crate::model::{ResourceId, ResourceKind};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Runtime result of creating a declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    id: ResourceId,
    kind: ResourceKind,
    attributes: BTreeMap<String, String>,
}

impl ProvisionedResource {
    #[must_use]
    pub fn new(id: ResourceId, kind: ResourceKind, attributes: BTreeMap<String, String>) -> Self {
        Self {
            id,
            kind,
            attributes,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    #[inline]
    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
}

/// Returned when an id is published twice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlreadyPublished(pub ResourceId);

/// Write-once map of provisioned resources
#[derive(Debug, Default)]
pub struct ProvisionedSet {
    inner: DashMap<ResourceId, Arc<ProvisionedResource>>,
}

impl ProvisionedSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a checkpoint
    #[must_use]
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        let set = Self::new();
        for resource in checkpoint.resources.values() {
            set.inner
                .insert(resource.id.clone(), Arc::new(resource.clone()));
        }
        set
    }

    /// Publish a fully built resource
    ///
    /// The entry becomes visible atomically; a second publish of the same id
    /// is rejected and leaves the first one in place.
    pub fn publish(
        &self,
        resource: ProvisionedResource,
    ) -> Result<Arc<ProvisionedResource>, AlreadyPublished> {
        match self.inner.entry(resource.id.clone()) {
            Entry::Occupied(_) => Err(AlreadyPublished(resource.id)),
            Entry::Vacant(slot) => {
                let resource = Arc::new(resource);
                slot.insert(Arc::clone(&resource));
                Ok(resource)
            }
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<ProvisionedResource>> {
        self.inner.get(id).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Consistent, sorted copy of everything published so far
    #[must_use]
    pub fn snapshot(&self) -> Checkpoint {
        let resources = self
            .inner
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().as_ref().clone()))
            .collect();
        Checkpoint { resources }
    }
}

/// Serializable snapshot `{resource id -> provisioned resource}`
///
/// An external store may persist it between runs; re-running with a
/// checkpoint skips the resources it already contains.
///
/// Every key must equal the id of the resource stored under it; a file that
/// disagrees is rejected when loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<ResourceId, ProvisionedResource>",
    into = "BTreeMap<ResourceId, ProvisionedResource>"
)]
pub struct Checkpoint {
    resources: BTreeMap<ResourceId, ProvisionedResource>,
}

impl TryFrom<BTreeMap<ResourceId, ProvisionedResource>> for Checkpoint {
    type Error = String;

    fn try_from(resources: BTreeMap<ResourceId, ProvisionedResource>) -> Result<Self, String> {
        if let Some((key, resource)) = resources.iter().find(|(key, r)| **key != r.id) {
            return Err(format!(
                "checkpoint entry `{key}` holds resource `{}`",
                resource.id
            ));
        }
        Ok(Self { resources })
    }
}

impl From<Checkpoint> for BTreeMap<ResourceId, ProvisionedResource> {
    fn from(checkpoint: Checkpoint) -> Self {
        checkpoint.resources
    }
}

impl Checkpoint {
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ProvisionedResource> {
        self.resources.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> + '_ {
        self.resources.keys()
    }

    pub fn resources(&self) -> impl Iterator<Item = &ProvisionedResource> + '_ {
        self.resources.values()
    }

    /// Drop an entry, e.g. to force re-creation
    pub fn remove(&mut self, id: &str) -> Option<ProvisionedResource> {
        self.resources.remove(id)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json_str(source: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(source)
    }
}

impl FromIterator<ProvisionedResource> for Checkpoint {
    fn from_iter<I: IntoIterator<Item = ProvisionedResource>>(iter: I) -> Self {
        Self {
            resources: iter.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket() -> ProvisionedResource {
        ProvisionedResource::new(
            ResourceId::new("bucket"),
            ResourceKind::ObjectStore,
            BTreeMap::from([("name".to_string(), "demo-bucket".to_string())]),
        )
    }

    #[test]
    fn publish_is_write_once() {
        let set = ProvisionedSet::new();
        set.publish(bucket()).unwrap();

        let mut other = bucket();
        other.attributes.insert("name".into(), "other".into());
        let err = set.publish(other).unwrap_err();

        assert_eq!(err, AlreadyPublished(ResourceId::new("bucket")));
        assert_eq!(
            set.get("bucket").unwrap().attribute("name"),
            Some("demo-bucket")
        );
    }

    #[test]
    fn snapshot_seeds_a_new_set() {
        let set = ProvisionedSet::new();
        set.publish(bucket()).unwrap();

        let checkpoint = set.snapshot();
        let json = checkpoint.to_json_pretty().unwrap();
        let reloaded = Checkpoint::from_json_str(&json).unwrap();
        assert_eq!(reloaded, checkpoint);

        let seeded = ProvisionedSet::from_checkpoint(&reloaded);
        assert!(seeded.contains("bucket"));
        assert_eq!(seeded.len(), 1);
    }

    #[test]
    fn checkpoint_keys_must_match_resource_ids() {
        let json = r#"{"queue": {"id": "bucket", "kind": "object_store", "attributes": {}}}"#;
        let err = Checkpoint::from_json_str(json).unwrap_err();
        assert!(err.to_string().contains("`queue` holds resource `bucket`"));

        let json = r#"{"bucket": {"id": "bucket", "kind": "object_store", "attributes": {}}}"#;
        assert!(Checkpoint::from_json_str(json).unwrap().contains("bucket"));
    }
}
