//! Resource declarations
//!
//! A declaration describes one provisionable unit. Configuration values are
//! either literals or forward pointers ([`DeferredRef`]) to attributes of other
//! declarations that only exist once those are created.

use crate::context::ContextField;
use crate::policy::Grant;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Well-known attribute names published by resource creators
pub mod attr {
    /// Physical name
    pub const NAME: &str = "name";
    /// Provider identifier
    pub const ID: &str = "id";
    /// Amazon resource name
    pub const ARN: &str = "arn";
    /// Repository or object URI
    pub const URI: &str = "uri";
    /// Endpoint URL
    pub const URL: &str = "url";
}

/// Unique declaration identifier within one graph
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Create an identifier
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ResourceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Closed set of provisionable resource kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Network,
    ComputeCluster,
    ContainerRegistry,
    ObjectStore,
    Topic,
    Function,
    Gateway,
    Role,
    PipelineStage,
}

impl ResourceKind {
    /// All kinds, in declaration order
    pub const ALL: [ResourceKind; 9] = [
        Self::Network,
        Self::ComputeCluster,
        Self::ContainerRegistry,
        Self::ObjectStore,
        Self::Topic,
        Self::Function,
        Self::Gateway,
        Self::Role,
        Self::PipelineStage,
    ];

    /// Stable snake_case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::ComputeCluster => "compute_cluster",
            Self::ContainerRegistry => "container_registry",
            Self::ObjectStore => "object_store",
            Self::Topic => "topic",
            Self::Function => "function",
            Self::Gateway => "gateway",
            Self::Role => "role",
            Self::PipelineStage => "pipeline_stage",
        }
    }

    /// Whether resources of this kind can act as a policy principal
    #[must_use]
    pub fn is_actor(self) -> bool {
        matches!(self, Self::Function | Self::Role)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pointer to an attribute of another declaration
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeferredRef {
    pub resource: ResourceId,
    pub attribute: String,
}

impl DeferredRef {
    #[must_use]
    pub fn new(resource: impl Into<ResourceId>, attribute: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            attribute: attribute.into(),
        }
    }
}

impl fmt::Display for DeferredRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.attribute)
    }
}

/// A configuration value, possibly containing deferred references
///
/// In YAML/JSON, a reference is written `{ ref: { resource, attribute } }`,
/// a context value `{ context: region }` and a concatenation
/// `{ join: [...], separator: "" }`. Everything else is a literal; lists and
/// maps are walked recursively.
///
/// A map carrying one of the reserved keys `ref`, `context` or `join` must
/// be exactly that form; anything else is rejected when parsing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Deferred {
        #[serde(rename = "ref")]
        reference: DeferredRef,
    },
    Context {
        context: ContextField,
    },
    Join {
        join: Vec<ConfigValue>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        separator: String,
    },
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
    Literal(serde_json::Value),
}

const REF_KEY: &str = "ref";
const CONTEXT_KEY: &str = "context";
const JOIN_KEY: &str = "join";
const SEPARATOR_KEY: &str = "separator";

impl<'de> Deserialize<'de> for ConfigValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Self::from_raw(raw).map_err(de::Error::custom)
    }
}

impl ConfigValue {
    fn from_raw(raw: serde_json::Value) -> Result<Self, String> {
        use serde_json::Value;

        let mut map = match raw {
            Value::Array(items) => {
                let items: Vec<ConfigValue> = items
                    .into_iter()
                    .map(Self::from_raw)
                    .collect::<Result<_, _>>()?;
                return Ok(Self::List(items));
            }
            Value::Object(map) => map,
            scalar => return Ok(Self::Literal(scalar)),
        };

        let reserved: Vec<&str> = [REF_KEY, CONTEXT_KEY, JOIN_KEY]
            .into_iter()
            .filter(|key| map.contains_key(*key))
            .collect();
        let key = match reserved.as_slice() {
            [] => {
                let entries: BTreeMap<String, ConfigValue> = map
                    .into_iter()
                    .map(|(k, v)| Self::from_raw(v).map(|v| (k, v)))
                    .collect::<Result<_, _>>()?;
                return Ok(Self::Map(entries));
            }
            [key] => *key,
            _ => return Err(format!("config map mixes reserved keys {}", reserved.join(", "))),
        };

        let accepts = |k: &str| k == key || (key == JOIN_KEY && k == SEPARATOR_KEY);
        if let Some(extra) = map.keys().find(|k| !accepts(k.as_str())) {
            return Err(format!("`{key}` value does not accept key `{extra}`"));
        }

        let body = map.remove(key).unwrap_or(Value::Null);
        match key {
            REF_KEY => serde_json::from_value::<DeferredRef>(body)
                .map(Self::from)
                .map_err(|e| format!("invalid `ref`: {e}")),
            CONTEXT_KEY => serde_json::from_value::<ContextField>(body)
                .map(Self::context)
                .map_err(|e| format!("invalid `context`: {e}")),
            _ => {
                let Value::Array(parts) = body else {
                    return Err("`join` expects a list".to_string());
                };
                let join: Vec<ConfigValue> = parts
                    .into_iter()
                    .map(Self::from_raw)
                    .collect::<Result<_, _>>()?;
                let separator = match map.remove(SEPARATOR_KEY) {
                    None => String::new(),
                    Some(Value::String(separator)) => separator,
                    Some(other) => return Err(format!("`separator` must be a string, got {other}")),
                };
                Ok(Self::Join { join, separator })
            }
        }
    }

    /// Literal value
    #[must_use]
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Deferred reference to `resource.attribute`
    #[must_use]
    pub fn reference(resource: impl Into<ResourceId>, attribute: impl Into<String>) -> Self {
        Self::Deferred {
            reference: DeferredRef::new(resource, attribute),
        }
    }

    /// Deployment context value
    #[must_use]
    pub fn context(field: ContextField) -> Self {
        Self::Context { context: field }
    }

    /// Concatenation of resolved parts
    #[must_use]
    pub fn join(parts: impl IntoIterator<Item = ConfigValue>) -> Self {
        Self::Join {
            join: parts.into_iter().collect(),
            separator: String::new(),
        }
    }

    /// Map of values
    #[must_use]
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, ConfigValue)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Collect every deferred reference, depth first
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a DeferredRef>) {
        match self {
            Self::Deferred { reference } => out.push(reference),
            Self::Join { join: items, .. } | Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(out);
                }
            }
            Self::Context { .. } | Self::Literal(_) => {}
        }
    }

    /// Collect every context field used, depth first
    pub fn collect_context_fields(&self, out: &mut Vec<ContextField>) {
        match self {
            Self::Context { context } => out.push(*context),
            Self::Join { join: items, .. } | Self::List(items) => {
                for item in items {
                    item.collect_context_fields(out);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.collect_context_fields(out);
                }
            }
            Self::Deferred { .. } | Self::Literal(_) => {}
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::Literal(serde_json::Value::from(value))
    }
}

impl From<DeferredRef> for ConfigValue {
    fn from(reference: DeferredRef) -> Self {
        Self::Deferred { reference }
    }
}

/// Declared configuration of a resource
pub type Config = BTreeMap<String, ConfigValue>;

/// Configuration after every reference has been substituted
pub type ResolvedConfig = BTreeMap<String, serde_json::Value>;

/// Collect references across a whole config map
#[must_use]
pub fn config_references(config: &Config) -> Vec<&DeferredRef> {
    let mut refs = Vec::new();
    for value in config.values() {
        value.collect_references(&mut refs);
    }
    refs
}

/// Declared interface of a function handler package
///
/// `code` is an opaque artifact location handed to the creator unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInterface {
    pub runtime: String,
    pub handler: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Environment variables the handler reads; each must be present in the
    /// declaration's `environment` config map
    #[serde(default)]
    pub required_env: BTreeSet<String>,
}

impl FunctionInterface {
    #[must_use]
    pub fn new(
        runtime: impl Into<String>,
        handler: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            runtime: runtime.into(),
            handler: handler.into(),
            code: code.into(),
            timeout_secs: None,
            required_env: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn requires_env<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.required_env.extend(names.into_iter().map(Into::into));
        self
    }
}

/// Config key holding a function's environment map
pub const ENVIRONMENT_KEY: &str = "environment";

/// One resource to provision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    pub id: ResourceId,
    pub kind: ResourceKind,
    #[serde(default)]
    pub config: Config,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<ResourceId>,
    /// Permissions this resource needs, when it is an actor
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grants: Vec<Grant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionInterface>,
}

impl ResourceDeclaration {
    /// Create an empty declaration
    #[must_use]
    pub fn new(id: impl Into<ResourceId>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            config: Config::new(),
            depends_on: BTreeSet::new(),
            grants: Vec::new(),
            function: None,
        }
    }

    /// Set a config entry
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Add an explicit dependency
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<ResourceId>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Attach a grant
    #[must_use]
    pub fn grant(mut self, grant: Grant) -> Self {
        self.grants.push(grant);
        self
    }

    /// Attach a function interface
    #[must_use]
    pub fn function(mut self, interface: FunctionInterface) -> Self {
        self.function = Some(interface);
        self
    }

    /// Deferred references in config order
    #[must_use]
    pub fn references(&self) -> Vec<&DeferredRef> {
        config_references(&self.config)
    }

    /// Every id this declaration needs provisioned first: references
    /// followed by explicit dependencies, without repeats
    #[must_use]
    pub fn dependency_ids(&self) -> Vec<&ResourceId> {
        let mut seen = BTreeSet::new();
        self.references()
            .into_iter()
            .map(|r| &r.resource)
            .chain(self.depends_on.iter())
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

impl From<serde_json::Value> for ConfigValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Literal(value)
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::Literal(serde_json::Value::String(value))
    }
}

impl From<u64> for ConfigValue {
    fn from(value: u64) -> Self {
        Self::Literal(serde_json::Value::from(value))
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        Self::Literal(serde_json::Value::Bool(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_ids_merge_refs_and_explicit_deps() {
        let decl = ResourceDeclaration::new("fn", ResourceKind::Function)
            .with("topic", ConfigValue::reference("topic", attr::ARN))
            .with(
                ENVIRONMENT_KEY,
                ConfigValue::map([
                    ("TOPIC", ConfigValue::reference("topic", attr::ARN)),
                    ("BUCKET", ConfigValue::reference("bucket", attr::NAME)),
                ]),
            )
            .depends_on("bucket")
            .depends_on("network");

        let ids: Vec<&str> = decl.dependency_ids().iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["bucket", "topic", "network"]);
    }

    #[test]
    fn parses_tagged_values_from_yaml() {
        let yaml = r#"
id: risk
kind: function
config:
  environment:
    SNS_TOPIC_ARN: { ref: { resource: topic, attribute: arn } }
    REGION: { context: region }
    OBJECTS: { join: [ { ref: { resource: bucket, attribute: arn } }, "/*" ] }
  memory: 512
"#;
        let decl: ResourceDeclaration = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(decl.kind, ResourceKind::Function);

        let ConfigValue::Map(env) = &decl.config[ENVIRONMENT_KEY] else {
            panic!("environment should be a map");
        };
        assert_eq!(env["SNS_TOPIC_ARN"], ConfigValue::reference("topic", "arn"));
        assert_eq!(env["REGION"], ConfigValue::context(ContextField::Region));
        assert!(matches!(env["OBJECTS"], ConfigValue::Join { .. }));
        assert_eq!(decl.config["memory"], ConfigValue::literal(512));

        let refs: Vec<String> = decl.references().iter().map(|r| r.to_string()).collect();
        assert_eq!(refs, vec!["bucket.arn", "topic.arn"]);
    }

    #[test]
    fn reserved_keys_must_form_exact_values() {
        let extra_key = "tags: { ref: { resource: b, attribute: arn }, owner: team-ml }";
        let err = serde_yaml::from_str::<Config>(extra_key).unwrap_err();
        assert!(err.to_string().contains("owner"), "{err}");

        let misspelled = "region: { context: regoin }";
        assert!(serde_yaml::from_str::<Config>(misspelled).is_err());

        let mixed = "both: { ref: { resource: b, attribute: arn }, context: region }";
        assert!(serde_yaml::from_str::<Config>(mixed).is_err());

        let stray_field = "x: { ref: { resource: b, attribute: arn, region: eu } }";
        assert!(serde_yaml::from_str::<Config>(stray_field).is_err());
    }

    #[test]
    fn plain_maps_and_separators_still_parse() {
        let yaml = r#"
labels: { owner: team-ml, tier: 1 }
path: { join: [ { context: partition }, ":s3" ], separator: "" }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config["labels"],
            ConfigValue::map([
                ("owner", ConfigValue::literal("team-ml")),
                ("tier", ConfigValue::literal(1)),
            ])
        );
        assert!(matches!(config["path"], ConfigValue::Join { ref join, .. } if join.len() == 2));
    }

    #[test]
    fn context_fields_are_collected_recursively() {
        let value = ConfigValue::join([
            ConfigValue::literal("arn:"),
            ConfigValue::context(ContextField::Partition),
            ConfigValue::List(vec![ConfigValue::context(ContextField::Region)]),
        ]);
        let mut fields = Vec::new();
        value.collect_context_fields(&mut fields);
        assert_eq!(fields, vec![ContextField::Partition, ContextField::Region]);
    }
}
