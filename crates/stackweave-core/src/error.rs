//! Error types for stackweave
//!
//! Every failure names the offending resource, output or stage:
//! - Graph validation (cycles, unknown references, missing context)
//! - Reference resolution (not yet provisioned vs. missing attribute)
//! - Provisioning failures carrying the partial checkpoint
//! - Policy and pipeline validation

use crate::context::ContextField;
use crate::model::{ResourceId, ResourceKind};
use crate::pipeline::ArtifactKind;
use crate::state::Checkpoint;

/// Top-level error of a synthesis run
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    /// Malformed declaration set
    #[error("graph validation failed: {0}")]
    Graph(#[from] GraphError),

    /// Deferred reference could not be resolved
    #[error("resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    /// Resource creation failed
    #[error(transparent)]
    Provision(#[from] Box<ProvisionFailure>),

    /// Policy composition failed
    #[error("policy rejected: {0}")]
    Policy(#[from] PolicyError),

    /// Pipeline validation or execution failed
    #[error("pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),

    /// Output export failed
    #[error("output export failed: {0}")]
    Output(#[from] OutputError),

    /// Definition or context could not be loaded
    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse classification used for reporting and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Validation,
    Resolution,
    Provisioning,
    Policy,
    Pipeline,
    Config,
}

impl ErrorClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Resolution => "resolution",
            Self::Provisioning => "provisioning",
            Self::Policy => "policy",
            Self::Pipeline => "pipeline",
            Self::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StackError {
    /// Classify the error
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Graph(_) => ErrorClass::Validation,
            Self::Resolve(_) | Self::Output(_) => ErrorClass::Resolution,
            Self::Provision(_) => ErrorClass::Provisioning,
            Self::Policy(_) => ErrorClass::Policy,
            Self::Pipeline(PipelineError::StageFailed { .. }) => ErrorClass::Provisioning,
            Self::Pipeline(_) => ErrorClass::Pipeline,
            Self::Config(_) => ErrorClass::Config,
        }
    }

    /// Malformed declarations are always fatal; a failed creation may be
    /// retried from its checkpoint and a wildcard grant may be downgraded
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Provision(_) => false,
            Self::Policy(e) => !e.is_overbroad(),
            Self::Pipeline(PipelineError::StageFailed { .. }) => false,
            _ => true,
        }
    }

    /// Process exit code for the error class
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self.class() {
            ErrorClass::Validation => 2,
            ErrorClass::Resolution => 3,
            ErrorClass::Provisioning => 4,
            ErrorClass::Policy => 5,
            ErrorClass::Pipeline => 6,
            ErrorClass::Config => 7,
        }
    }
}

impl From<ProvisionFailure> for StackError {
    fn from(value: ProvisionFailure) -> Self {
        Self::Provision(Box::new(value))
    }
}

fn render_cycle(cycle: &[ResourceId]) -> String {
    let mut parts: Vec<&str> = cycle.iter().map(ResourceId::as_str).collect();
    if let Some(first) = cycle.first() {
        parts.push(first.as_str());
    }
    parts.join(" -> ")
}

/// Dependency graph validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// The declarations reference each other in a loop
    #[error("dependency cycle: {}", render_cycle(.cycle))]
    Cycle { cycle: Vec<ResourceId> },

    /// A reference names an id that is not declared
    #[error("{referrer} references unknown resource `{missing}`")]
    UnknownReference {
        referrer: String,
        missing: ResourceId,
    },

    /// Two declarations share an id
    #[error("duplicate resource id `{0}`")]
    DuplicateId(ResourceId),

    /// A context value is used but not configured
    #[error("{referrer} uses context field `{field}` which is not configured")]
    MissingContext {
        referrer: String,
        field: ContextField,
    },

    /// Only functions and roles act on other resources
    #[error("`{resource}` is a {kind} and cannot hold grants")]
    GrantOnNonActor {
        resource: ResourceId,
        kind: ResourceKind,
    },

    /// A function handler needs an environment variable that is not set
    #[error("function `{resource}` requires environment variable `{variable}`")]
    MissingEnvironment {
        resource: ResourceId,
        variable: String,
    },
}

impl GraphError {
    /// Ids named by the error
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&ResourceId> {
        match self {
            Self::Cycle { cycle } => cycle.iter().collect(),
            Self::UnknownReference { missing, .. } => vec![missing],
            Self::DuplicateId(id)
            | Self::MissingEnvironment { resource: id, .. }
            | Self::GrantOnNonActor { resource: id, .. } => vec![id],
            Self::MissingContext { .. } => Vec::new(),
        }
    }
}

/// Reference resolution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The referenced resource has not been provisioned yet
    #[error("`{resource}` is not provisioned yet (needed for attribute `{attribute}`)")]
    UnresolvedReference {
        resource: ResourceId,
        attribute: String,
    },

    /// The resource exists but was built without the attribute
    #[error("`{resource}` has no attribute `{attribute}`")]
    MissingAttribute {
        resource: ResourceId,
        attribute: String,
    },

    /// A context field is not configured
    #[error("context field `{field}` is not configured")]
    MissingContext { field: ContextField },
}

impl ResolveError {
    /// Timing problem rather than a declaration bug
    #[must_use]
    pub fn is_timing(&self) -> bool {
        matches!(self, Self::UnresolvedReference { .. })
    }
}

/// Failure reported by a resource creator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CreateError {
    /// The provider refused the request
    #[error("creation rejected: {0}")]
    Rejected(String),

    /// The provider could not be reached or timed out
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// No creator is registered for the kind
    #[error("no creator registered for kind `{0}`")]
    Unsupported(ResourceKind),
}

impl CreateError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Why provisioning a node failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionCause {
    /// The creator returned an error
    #[error(transparent)]
    Create(#[from] CreateError),

    /// Config could not be resolved against already provisioned resources
    #[error("reference resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    /// A checkpoint entry disagrees with the declaration
    #[error("checkpoint records kind `{found}` but declaration is `{expected}`")]
    KindMismatch {
        expected: ResourceKind,
        found: ResourceKind,
    },

    /// Another writer already published this id
    #[error("resource was already published")]
    AlreadyPublished,
}

impl ProvisionCause {
    /// A dependency missing at creation time means the walk itself is broken
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::Resolve(e) if e.is_timing()) || matches!(self, Self::AlreadyPublished)
    }
}

/// Provisioning halted at `resource`
///
/// `checkpoint` holds everything provisioned before the failure; re-running
/// with it skips those resources.
#[derive(Debug, Clone, thiserror::Error)]
#[error("provisioning `{resource}` failed: {cause}")]
pub struct ProvisionFailure {
    pub resource: ResourceId,
    #[source]
    pub cause: ProvisionCause,
    pub checkpoint: Checkpoint,
}

/// Policy composition errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// Wildcard target without an explicit opt-in
    #[error("grant for `{actor}` targets `*` without allow_wildcard")]
    OverbroadGrant { actor: ResourceId },

    #[error("grant for `{actor}` has no actions")]
    EmptyActions { actor: ResourceId },

    #[error("grant for `{actor}` has no targets")]
    EmptyTargets { actor: ResourceId },

    /// Target could not be bound to an ARN
    #[error("statement for `{actor}` cannot bind `{target}`: {source}")]
    UnboundTarget {
        actor: ResourceId,
        target: ResourceId,
        source: ResolveError,
    },

    /// Target string could not be parsed
    #[error("invalid policy target `{0}`")]
    InvalidTarget(String),
}

impl PolicyError {
    #[must_use]
    pub fn is_overbroad(&self) -> bool {
        matches!(self, Self::OverbroadGrant { .. })
    }
}

/// Pipeline validation and execution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline has no stages")]
    EmptyPipeline,

    #[error("duplicate stage `{0}`")]
    DuplicateStage(String),

    /// The first stage must start from an external trigger
    #[error("first stage `{stage}` has no source trigger")]
    MissingTrigger { stage: String },

    /// Only the first stage may be triggered externally
    #[error("stage `{stage}` declares a source trigger but is not the first stage")]
    UnexpectedTrigger { stage: String },

    /// Adjacent stages disagree on the handed-off artifact
    #[error(
        "stage `{stage}` expects a `{found}` artifact but `{previous}` produces `{expected}`"
    )]
    ArtifactMismatch {
        previous: String,
        stage: String,
        expected: ArtifactKind,
        found: ArtifactKind,
    },

    /// A runner reported an artifact other than the declared output
    #[error("stage `{stage}` produced `{found}` instead of `{expected}`")]
    OutputMismatch {
        stage: String,
        expected: String,
        found: String,
    },

    /// State machine driven out of order
    #[error("stage `{stage}` cannot {operation} in state {state}")]
    OutOfOrder {
        stage: String,
        operation: &'static str,
        state: &'static str,
    },

    /// An action's config could not be resolved
    #[error("stage `{stage}` action `{action}`: {source}")]
    ActionResolution {
        stage: String,
        action: String,
        source: ResolveError,
    },

    /// The external runner failed the stage
    #[error("stage `{stage}` failed: {reason}")]
    StageFailed { stage: String, reason: String },
}

/// Output export errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutputError {
    #[error("duplicate output `{0}`")]
    DuplicateOutput(String),

    #[error("output `{output}`: {source}")]
    Resolve { output: String, source: ResolveError },
}
