//! stackweave core
//!
//! Declarative provisioning with a two-phase design:
//! 1. **Planning Phase**: build the dependency graph, compose policies and
//!    sequence the pipeline. Every malformed declaration is rejected here,
//!    before any resource is created.
//! 2. **Apply Phase**: walk the graph in dependency order, create each
//!    resource through a [`ResourceCreator`], resolve deferred attribute
//!    references and export the named outputs.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use stackweave_core::prelude::*;
//!
//! let context = DeploymentContext::new("demo").with_region("eu-west-1");
//! let synthesizer = Synthesizer::new(context);
//!
//! let plan = synthesizer.plan(catalog::ai_ml_stack())?;
//! let deployment = synthesizer
//!     .apply(&plan, Arc::new(Simulator::new()), Checkpoint::default())
//!     .await?;
//!
//! for output in &deployment.outputs {
//!     println!("{} = {}", output.name, output.value);
//! }
//! ```

#![allow(missing_docs)]

// Declarations and runtime state
pub mod context;
pub mod error;
pub mod model;
pub mod state;

// Planning
pub mod graph;
pub mod pipeline;
pub mod policy;

// Apply
pub mod creator;
pub mod outputs;
pub mod provisioner;
pub mod resolver;

// Orchestration
pub mod catalog;
pub mod simulator;
pub mod stack;

// Re-exports
pub use context::{ContextField, DeploymentContext};
pub use creator::{CreateRequest, CreatedResource, CreatorRegistry, ResourceCreator};
pub use error::{
    CreateError, ErrorClass, GraphError, OutputError, PipelineError, PolicyError, ProvisionCause,
    ProvisionFailure, ResolveError, StackError,
};
pub use graph::DependencyGraph;
pub use model::{
    Config, ConfigValue, DeferredRef, FunctionInterface, ResolvedConfig, ResourceDeclaration,
    ResourceId, ResourceKind,
};
pub use outputs::{ExportedOutput, OutputExporter, OutputSpec};
pub use pipeline::{PipelinePlan, PipelineSequencer, StageRunner, StageSpec};
pub use policy::{Grant, PolicyComposer, PolicyDocument, PolicyStatement, TargetRef, WildcardPolicy};
pub use provisioner::{ProvisionOptions, ProvisionReport, Provisioner};
pub use resolver::ReferenceResolver;
pub use simulator::Simulator;
pub use stack::{Deployment, StackDefinition, StackPlan, Synthesizer};
pub use state::{Checkpoint, ProvisionedResource, ProvisionedSet};

/// Common imports for driving a synthesis run
pub mod prelude {
    pub use crate::catalog;
    pub use crate::{
        Checkpoint, ConfigValue, DeploymentContext, Grant, ResourceDeclaration, ResourceId,
        ResourceKind, Simulator, StackDefinition, StackError, Synthesizer, TargetRef,
    };
    pub use std::sync::Arc;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
