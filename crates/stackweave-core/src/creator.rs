//! Resource creation capability
//!
//! The provisioner never talks to a provider directly. It hands each resolved
//! declaration to a [`ResourceCreator`] and publishes whatever attributes come
//! back.

use crate::context::DeploymentContext;
use crate::error::CreateError;
use crate::model::{FunctionInterface, ResolvedConfig, ResourceId, ResourceKind};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Everything a creator needs to build one resource
#[derive(Debug, Clone, Copy)]
pub struct CreateRequest<'a> {
    pub id: &'a ResourceId,
    pub kind: ResourceKind,
    /// Config with every reference substituted
    pub config: &'a ResolvedConfig,
    pub function: Option<&'a FunctionInterface>,
    pub context: &'a DeploymentContext,
}

/// Attributes of a freshly created resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreatedResource {
    /// Provider identifier, published as `id`
    pub identifier: String,
    /// Published as `arn` when present
    pub arn: Option<String>,
    /// Further attributes (`name`, `uri`, `url`, ...)
    pub attributes: BTreeMap<String, String>,
}

impl CreatedResource {
    #[must_use]
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_arn(mut self, arn: impl Into<String>) -> Self {
        self.arn = Some(arn.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Creates resources of one or more kinds
///
/// Implementations perform the only side effect of a run.
#[async_trait]
pub trait ResourceCreator: Send + Sync {
    /// Create one resource
    async fn create(&self, request: CreateRequest<'_>) -> Result<CreatedResource, CreateError>;
}

/// Routes requests to a creator registered for the resource kind
#[derive(Default, Clone)]
pub struct CreatorRegistry {
    creators: HashMap<ResourceKind, Arc<dyn ResourceCreator>>,
    fallback: Option<Arc<dyn ResourceCreator>>,
}

impl CreatorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `creator` for `kind`, replacing any previous one
    #[must_use]
    pub fn register(mut self, kind: ResourceKind, creator: Arc<dyn ResourceCreator>) -> Self {
        self.creators.insert(kind, creator);
        self
    }

    /// Creator used for kinds without a registration
    #[must_use]
    pub fn with_fallback(mut self, creator: Arc<dyn ResourceCreator>) -> Self {
        self.fallback = Some(creator);
        self
    }

    #[must_use]
    pub fn handles(&self, kind: ResourceKind) -> bool {
        self.fallback.is_some() || self.creators.contains_key(&kind)
    }
}

impl std::fmt::Debug for CreatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.creators.keys().collect();
        kinds.sort();
        f.debug_struct("CreatorRegistry")
            .field("kinds", &kinds)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[async_trait]
impl ResourceCreator for CreatorRegistry {
    async fn create(&self, request: CreateRequest<'_>) -> Result<CreatedResource, CreateError> {
        let creator = self
            .creators
            .get(&request.kind)
            .or(self.fallback.as_ref())
            .ok_or(CreateError::Unsupported(request.kind))?;
        creator.create(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl ResourceCreator for Fixed {
        async fn create(
            &self,
            request: CreateRequest<'_>,
        ) -> Result<CreatedResource, CreateError> {
            Ok(CreatedResource::new(format!("{}-{}", self.0, request.id)))
        }
    }

    fn request<'a>(
        id: &'a ResourceId,
        kind: ResourceKind,
        config: &'a ResolvedConfig,
        context: &'a DeploymentContext,
    ) -> CreateRequest<'a> {
        CreateRequest {
            id,
            kind,
            config,
            function: None,
            context,
        }
    }

    #[tokio::test]
    async fn routes_by_kind_then_fallback() {
        let registry = CreatorRegistry::new()
            .register(ResourceKind::Topic, Arc::new(Fixed("sns")))
            .with_fallback(Arc::new(Fixed("generic")));
        let id = ResourceId::new("alerts");
        let config = ResolvedConfig::new();
        let ctx = DeploymentContext::default();

        let topic = registry
            .create(request(&id, ResourceKind::Topic, &config, &ctx))
            .await
            .unwrap();
        assert_eq!(topic.identifier, "sns-alerts");

        let bucket = registry
            .create(request(&id, ResourceKind::ObjectStore, &config, &ctx))
            .await
            .unwrap();
        assert_eq!(bucket.identifier, "generic-alerts");
    }

    #[tokio::test]
    async fn unregistered_kind_is_unsupported() {
        let registry = CreatorRegistry::new().register(ResourceKind::Topic, Arc::new(Fixed("sns")));
        let id = ResourceId::new("net");
        let config = ResolvedConfig::new();
        let ctx = DeploymentContext::default();

        let err = registry
            .create(request(&id, ResourceKind::Network, &config, &ctx))
            .await
            .unwrap_err();
        assert_eq!(err, CreateError::Unsupported(ResourceKind::Network));
        assert!(!registry.handles(ResourceKind::Network));
    }
}
