//! Policy Composer
//!
//! Turns the grants declared on an actor into minimal-scope statements:
//! - identical `(actions, targets)` grants collapse into one statement
//! - grants with different target sets are never merged, so every statement
//!   stays auditable on its own
//! - a `*` target is rejected unless the grant opts in with `allow_wildcard`

use crate::error::PolicyError;
use crate::model::{attr, DeferredRef, ResourceId};
use crate::resolver::ReferenceResolver;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Target of a grant
///
/// Parsed from a string: `*` is the wildcard, `arn:...` an externally known
/// ARN, `id/path` a path under a declared resource's ARN and anything else a
/// declared resource id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetRef {
    /// Every resource
    Wildcard,
    /// The ARN of a declared resource
    Resource(ResourceId),
    /// A path below a declared resource's ARN, e.g. the objects of a bucket
    ResourcePath { resource: ResourceId, path: String },
    /// An ARN that exists outside this stack
    Arn(String),
}

impl TargetRef {
    #[must_use]
    pub fn resource(id: impl Into<ResourceId>) -> Self {
        Self::Resource(id.into())
    }

    #[must_use]
    pub fn path(id: impl Into<ResourceId>, path: impl Into<String>) -> Self {
        Self::ResourcePath {
            resource: id.into(),
            path: path.into(),
        }
    }

    #[must_use]
    pub fn arn(arn: impl Into<String>) -> Self {
        Self::Arn(arn.into())
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard)
    }

    /// Declared resource named by this target, if any
    #[must_use]
    pub fn resource_id(&self) -> Option<&ResourceId> {
        match self {
            Self::Resource(id) | Self::ResourcePath { resource: id, .. } => Some(id),
            Self::Arn(_) | Self::Wildcard => None,
        }
    }
}

impl FromStr for TargetRef {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PolicyError::InvalidTarget(s.to_string()));
        }
        if s == "*" {
            return Ok(Self::Wildcard);
        }
        if s.starts_with("arn:") {
            return Ok(Self::Arn(s.to_string()));
        }
        match s.split_once('/') {
            Some((id, path)) if !id.is_empty() && !path.is_empty() => Ok(Self::path(id, path)),
            Some(_) => Err(PolicyError::InvalidTarget(s.to_string())),
            None => Ok(Self::resource(s)),
        }
    }
}

impl TryFrom<String> for TargetRef {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetRef> for String {
    fn from(value: TargetRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wildcard => f.write_str("*"),
            Self::Resource(id) => write!(f, "{id}"),
            Self::ResourcePath { resource, path } => write!(f, "{resource}/{path}"),
            Self::Arn(arn) => f.write_str(arn),
        }
    }
}

/// Permission an actor needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub actions: BTreeSet<String>,
    pub targets: BTreeSet<TargetRef>,
    /// Explicit opt-in for `*` targets
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_wildcard: bool,
}

impl Grant {
    /// Grant `actions` on `targets`
    #[must_use]
    pub fn new<A, T>(actions: impl IntoIterator<Item = A>, targets: impl IntoIterator<Item = T>) -> Self
    where
        A: Into<String>,
        T: Into<TargetRef>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
            targets: targets.into_iter().map(Into::into).collect(),
            allow_wildcard: false,
        }
    }

    /// Grant `actions` on every resource, flagged
    #[must_use]
    pub fn wildcard<A: Into<String>>(actions: impl IntoIterator<Item = A>) -> Self {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
            targets: BTreeSet::from([TargetRef::Wildcard]),
            allow_wildcard: true,
        }
    }

    #[must_use]
    pub fn has_wildcard_target(&self) -> bool {
        self.targets.iter().any(TargetRef::is_wildcard)
    }
}

impl From<&str> for TargetRef {
    /// Convenience for literals; unparsable input becomes a resource id
    fn from(value: &str) -> Self {
        value
            .parse()
            .unwrap_or_else(|_| Self::Resource(ResourceId::new(value)))
    }
}

/// How wildcard targets without opt-in are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WildcardPolicy {
    /// Fail with `OverbroadGrant`
    #[default]
    Reject,
    /// Emit the statement flagged and log a warning
    Warn,
}

/// Minimal-scope permission bound to one actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    pub actor: ResourceId,
    pub actions: BTreeSet<String>,
    pub resources: BTreeSet<TargetRef>,
    /// Set when the statement targets `*`
    #[serde(default)]
    pub wildcard: bool,
}

/// Statement with every target bound to a concrete ARN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundStatement {
    pub actions: Vec<String>,
    pub resources: Vec<String>,
    pub wildcard: bool,
}

/// All bound statements of one actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub actor: ResourceId,
    pub statements: Vec<BoundStatement>,
}

impl PolicyDocument {
    /// IAM-style JSON document
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let statements: Vec<serde_json::Value> = self
            .statements
            .iter()
            .map(|s| {
                serde_json::json!({
                    "Effect": "Allow",
                    "Action": s.actions,
                    "Resource": s.resources,
                })
            })
            .collect();
        serde_json::json!({
            "Version": "2012-10-17",
            "Statement": statements,
        })
    }
}

/// Builds and binds policy statements
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyComposer {
    wildcard_policy: WildcardPolicy,
}

impl PolicyComposer {
    #[must_use]
    pub fn new(wildcard_policy: WildcardPolicy) -> Self {
        Self { wildcard_policy }
    }

    #[must_use]
    pub fn wildcard_policy(&self) -> WildcardPolicy {
        self.wildcard_policy
    }

    /// Compose the statements for `actor`
    ///
    /// Statements come out in first-occurrence order of their grants.
    ///
    /// # Errors
    /// - `EmptyActions` / `EmptyTargets` for degenerate grants
    /// - `OverbroadGrant` for a `*` target without `allow_wildcard`, unless
    ///   the composer runs with [`WildcardPolicy::Warn`]
    pub fn compose(
        &self,
        actor: &ResourceId,
        grants: &[Grant],
    ) -> Result<Vec<PolicyStatement>, PolicyError> {
        let mut grouped: IndexMap<(&BTreeSet<String>, &BTreeSet<TargetRef>), bool> =
            IndexMap::new();

        for grant in grants {
            if grant.actions.is_empty() {
                return Err(PolicyError::EmptyActions {
                    actor: actor.clone(),
                });
            }
            if grant.targets.is_empty() {
                return Err(PolicyError::EmptyTargets {
                    actor: actor.clone(),
                });
            }

            let wildcard = grant.has_wildcard_target();
            if wildcard && !grant.allow_wildcard {
                match self.wildcard_policy {
                    WildcardPolicy::Reject => {
                        return Err(PolicyError::OverbroadGrant {
                            actor: actor.clone(),
                        })
                    }
                    WildcardPolicy::Warn => tracing::warn!(
                        "Grant for {} targets every resource without opt-in; emitting flagged statement",
                        actor
                    ),
                }
            } else if wildcard {
                tracing::warn!("Grant for {} targets every resource (allow_wildcard)", actor);
            }

            for action in &grant.actions {
                if action == "*" || action.ends_with(":*") {
                    tracing::warn!("Grant for {} uses service-wide action {}", actor, action);
                }
            }

            grouped
                .entry((&grant.actions, &grant.targets))
                .or_insert(wildcard);
        }

        Ok(grouped
            .into_iter()
            .map(|((actions, targets), wildcard)| PolicyStatement {
                actor: actor.clone(),
                actions: actions.clone(),
                resources: targets.clone(),
                wildcard,
            })
            .collect())
    }

    /// Bind every target of `statements` to an ARN
    ///
    /// Declared resources bind to their provisioned `arn` attribute.
    ///
    /// # Errors
    /// `UnboundTarget` when a declared target is not provisioned or has no ARN.
    pub fn bind(
        &self,
        actor: &ResourceId,
        statements: &[PolicyStatement],
        resolver: &ReferenceResolver<'_>,
    ) -> Result<PolicyDocument, PolicyError> {
        let bind_arn = |id: &ResourceId| {
            resolver
                .resolve_reference(&DeferredRef::new(id.clone(), attr::ARN))
                .map_err(|source| PolicyError::UnboundTarget {
                    actor: actor.clone(),
                    target: id.clone(),
                    source,
                })
        };

        let statements = statements
            .iter()
            .map(|statement| {
                let resources = statement
                    .resources
                    .iter()
                    .map(|target| match target {
                        TargetRef::Wildcard => Ok("*".to_string()),
                        TargetRef::Arn(arn) => Ok(arn.clone()),
                        TargetRef::Resource(id) => bind_arn(id),
                        TargetRef::ResourcePath { resource, path } => {
                            bind_arn(resource).map(|arn| format!("{arn}/{path}"))
                        }
                    })
                    .collect::<Result<Vec<_>, PolicyError>>()?;
                Ok(BoundStatement {
                    actions: statement.actions.iter().cloned().collect(),
                    resources,
                    wildcard: statement.wildcard,
                })
            })
            .collect::<Result<Vec<_>, PolicyError>>()?;

        Ok(PolicyDocument {
            actor: actor.clone(),
            statements,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeploymentContext;
    use crate::model::ResourceKind;
    use crate::state::{ProvisionedResource, ProvisionedSet};
    use std::collections::BTreeMap;

    fn actor() -> ResourceId {
        ResourceId::new("risk-fn")
    }

    #[test]
    fn parses_targets() {
        assert_eq!("*".parse::<TargetRef>().unwrap(), TargetRef::Wildcard);
        assert_eq!(
            "arn:aws:bedrock:*::foundation-model/*".parse::<TargetRef>().unwrap(),
            TargetRef::arn("arn:aws:bedrock:*::foundation-model/*")
        );
        assert_eq!(
            "bucket/*".parse::<TargetRef>().unwrap(),
            TargetRef::path("bucket", "*")
        );
        assert_eq!("topic".parse::<TargetRef>().unwrap(), TargetRef::resource("topic"));
        assert!("/oops".parse::<TargetRef>().is_err());
        assert!(" ".parse::<TargetRef>().is_err());
    }

    #[test]
    fn identical_grants_collapse() {
        let grants = vec![
            Grant::new(["s3:GetObject"], ["bucket"]),
            Grant::new(["s3:GetObject"], ["bucket"]),
        ];
        let statements = PolicyComposer::default().compose(&actor(), &grants).unwrap();
        assert_eq!(statements.len(), 1);
    }

    #[test]
    fn different_targets_are_never_merged() {
        let grants = vec![
            Grant::new(["s3:GetObject", "s3:PutObject"], ["bucket"]),
            Grant::new(["s3:GetObject"], ["other"]),
            Grant::new(["s3:GetObject", "s3:PutObject"], ["bucket"]),
        ];
        let statements = PolicyComposer::default().compose(&actor(), &grants).unwrap();
        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[0].resources,
            BTreeSet::from([TargetRef::resource("bucket")])
        );
        assert_eq!(
            statements[1].resources,
            BTreeSet::from([TargetRef::resource("other")])
        );
    }

    #[test]
    fn wildcard_requires_opt_in() {
        let grants = vec![Grant::new(["iam:*"], ["*"])];

        let err = PolicyComposer::default().compose(&actor(), &grants).unwrap_err();
        assert!(err.is_overbroad());

        let flagged = PolicyComposer::new(WildcardPolicy::Warn)
            .compose(&actor(), &grants)
            .unwrap();
        assert!(flagged[0].wildcard);

        let opted_in = PolicyComposer::default()
            .compose(&actor(), &[Grant::wildcard(["iam:*"])])
            .unwrap();
        assert!(opted_in[0].wildcard);
    }

    #[test]
    fn rejects_degenerate_grants() {
        let composer = PolicyComposer::default();
        let no_actions = Grant::new(Vec::<String>::new(), ["bucket"]);
        let no_targets = Grant::new(["s3:GetObject"], Vec::<TargetRef>::new());

        assert!(matches!(
            composer.compose(&actor(), &[no_actions]),
            Err(PolicyError::EmptyActions { .. })
        ));
        assert!(matches!(
            composer.compose(&actor(), &[no_targets]),
            Err(PolicyError::EmptyTargets { .. })
        ));
    }

    #[test]
    fn binds_targets_to_provisioned_arns() {
        let set = ProvisionedSet::new();
        set.publish(ProvisionedResource::new(
            ResourceId::new("bucket"),
            ResourceKind::ObjectStore,
            BTreeMap::from([(attr::ARN.to_string(), "arn:aws:s3:::outputs".to_string())]),
        ))
        .unwrap();
        let ctx = DeploymentContext::default();
        let resolver = ReferenceResolver::new(&set, &ctx);

        let composer = PolicyComposer::default();
        let statements = composer
            .compose(
                &actor(),
                &[Grant::new(
                    ["s3:GetObject"],
                    [
                        TargetRef::resource("bucket"),
                        TargetRef::path("bucket", "*"),
                        TargetRef::arn("arn:aws:bedrock:*::foundation-model/*"),
                    ],
                )],
            )
            .unwrap();

        let document = composer.bind(&actor(), &statements, &resolver).unwrap();
        assert_eq!(
            document.statements[0].resources,
            vec![
                "arn:aws:s3:::outputs",
                "arn:aws:s3:::outputs/*",
                "arn:aws:bedrock:*::foundation-model/*",
            ]
        );
        assert_eq!(document.to_json()["Statement"][0]["Effect"], "Allow");

        let unbound = composer
            .compose(&actor(), &[Grant::new(["sns:Publish"], ["topic"])])
            .unwrap();
        assert!(matches!(
            composer.bind(&actor(), &unbound, &resolver),
            Err(PolicyError::UnboundTarget { .. })
        ));
    }
}
