//! Deployment context
//!
//! Account-wide settings (region, account, partition) are threaded explicitly
//! through graph construction, provisioning and export. Nothing in the core
//! reads them from the process environment.

use crate::error::StackError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A field of the deployment context that declarations may reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextField {
    Region,
    Account,
    Partition,
    StackName,
    Environment,
}

impl fmt::Display for ContextField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Region => "region",
            Self::Account => "account",
            Self::Partition => "partition",
            Self::StackName => "stack_name",
            Self::Environment => "environment",
        };
        f.write_str(name)
    }
}

/// Target environment of one synthesis run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentContext {
    /// Logical stack name, used as a prefix for physical names
    pub stack_name: String,
    /// Environment label (dev, staging, prod)
    pub environment: String,
    /// Account identifier, if known
    pub account: Option<String>,
    /// Region, if known
    pub region: Option<String>,
    /// ARN partition
    pub partition: String,
}

impl DeploymentContext {
    /// Create a context for the given stack with default settings
    #[must_use]
    pub fn new(stack_name: impl Into<String>) -> Self {
        Self {
            stack_name: stack_name.into(),
            ..Self::default()
        }
    }

    /// With region
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// With account
    #[must_use]
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    /// With environment label
    #[must_use]
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Look up a context field; `None` when it is not configured
    #[must_use]
    pub fn get(&self, field: ContextField) -> Option<&str> {
        match field {
            ContextField::Region => self.region.as_deref(),
            ContextField::Account => self.account.as_deref(),
            ContextField::Partition => Some(self.partition.as_str()),
            ContextField::StackName => Some(self.stack_name.as_str()),
            ContextField::Environment => Some(self.environment.as_str()),
        }
    }

    /// Parse a context from TOML
    pub fn from_toml_str(source: &str) -> Result<Self, StackError> {
        toml::from_str(source).map_err(|e| StackError::Config(e.to_string()))
    }
}

impl Default for DeploymentContext {
    fn default() -> Self {
        Self {
            stack_name: "stackweave".to_string(),
            environment: "dev".to_string(),
            account: None,
            region: None,
            partition: "aws".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_are_absent() {
        let ctx = DeploymentContext::new("demo");
        assert_eq!(ctx.get(ContextField::Region), None);
        assert_eq!(ctx.get(ContextField::Account), None);
        assert_eq!(ctx.get(ContextField::Partition), Some("aws"));
        assert_eq!(ctx.get(ContextField::StackName), Some("demo"));
    }

    #[test]
    fn parses_partial_toml() {
        let ctx = DeploymentContext::from_toml_str(
            r#"
            stack_name = "ai-ml"
            region = "us-west-2"
            "#,
        )
        .unwrap();

        assert_eq!(ctx.stack_name, "ai-ml");
        assert_eq!(ctx.get(ContextField::Region), Some("us-west-2"));
        assert_eq!(ctx.environment, "dev");
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = DeploymentContext::from_toml_str("region = [").unwrap_err();
        assert!(matches!(err, StackError::Config(_)));
    }
}
