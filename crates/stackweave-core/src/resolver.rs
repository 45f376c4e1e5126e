//! Reference Resolver
//!
//! Substitutes deferred references and context values in a config tree with
//! the attributes of already provisioned resources. Resolution is a pure read
//! of the provisioned set, so resolving the same value twice against the same
//! state yields the same result.

use crate::context::DeploymentContext;
use crate::error::ResolveError;
use crate::model::{Config, ConfigValue, DeferredRef, ResolvedConfig};
use crate::state::ProvisionedSet;
use serde_json::Value;

/// Resolves config values against a provisioned set and deployment context
#[derive(Debug, Clone, Copy)]
pub struct ReferenceResolver<'a> {
    provisioned: &'a ProvisionedSet,
    context: &'a DeploymentContext,
}

impl<'a> ReferenceResolver<'a> {
    #[must_use]
    pub fn new(provisioned: &'a ProvisionedSet, context: &'a DeploymentContext) -> Self {
        Self {
            provisioned,
            context,
        }
    }

    /// Resolve a whole config map
    pub fn resolve_config(&self, config: &Config) -> Result<ResolvedConfig, ResolveError> {
        config
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.resolve_value(value)?)))
            .collect::<Result<ResolvedConfig, ResolveError>>()
    }

    /// Resolve one value recursively
    pub fn resolve_value(&self, value: &ConfigValue) -> Result<Value, ResolveError> {
        match value {
            ConfigValue::Literal(literal) => Ok(literal.clone()),
            ConfigValue::Deferred { reference } => {
                self.resolve_reference(reference).map(Value::String)
            }
            ConfigValue::Context { context } => self
                .context
                .get(*context)
                .map(|v| Value::String(v.to_string()))
                .ok_or(ResolveError::MissingContext { field: *context }),
            ConfigValue::Join { join, separator } => {
                let parts = join
                    .iter()
                    .map(|part| self.resolve_value(part).map(|v| render_scalar(&v)))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::String(parts.join(separator.as_str())))
            }
            ConfigValue::List(items) => items
                .iter()
                .map(|item| self.resolve_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            ConfigValue::Map(entries) => entries
                .iter()
                .map(|(key, item)| Ok((key.clone(), self.resolve_value(item)?)))
                .collect::<Result<serde_json::Map<String, Value>, ResolveError>>()
                .map(Value::Object),
        }
    }

    /// Look up `resource.attribute`
    ///
    /// Distinguishes a resource that is not provisioned yet from one that was
    /// provisioned without the requested attribute.
    pub fn resolve_reference(&self, reference: &DeferredRef) -> Result<String, ResolveError> {
        let resource = self.provisioned.get(reference.resource.as_str()).ok_or_else(|| {
            ResolveError::UnresolvedReference {
                resource: reference.resource.clone(),
                attribute: reference.attribute.clone(),
            }
        })?;

        let value = resource
            .attribute(&reference.attribute)
            .ok_or_else(|| ResolveError::MissingAttribute {
                resource: reference.resource.clone(),
                attribute: reference.attribute.clone(),
            })?;

        tracing::debug!("Resolved {} -> {}", reference, value);
        Ok(value.to_string())
    }
}

/// Resolve `config` against `provisioned`
pub fn resolve(
    config: &Config,
    provisioned: &ProvisionedSet,
    context: &DeploymentContext,
) -> Result<ResolvedConfig, ResolveError> {
    ReferenceResolver::new(provisioned, context).resolve_config(config)
}

/// Strings render raw, everything else as JSON text
pub(crate) fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
