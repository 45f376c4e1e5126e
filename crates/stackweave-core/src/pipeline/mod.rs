//! Pipeline Stage Sequencer
//!
//! Validates an ordered list of build/deploy stages and turns it into a
//! [`PipelinePlan`]. Stages run strictly one after another; the artifact a
//! stage consumes must be of the kind the preceding stage produces, and only
//! the first stage starts from an external source trigger.

mod execution;

pub use execution::{
    Action, ExecutableStage, ExecutionState, PipelineExecution, PipelineSummary,
    ProducedArtifact, StageSource,
};

use crate::context::DeploymentContext;
use crate::error::PipelineError;
use crate::model::{Config, ConfigValue};
use crate::state::ProvisionedSet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Typed output handed from one stage to the next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    SourceArchive,
    BuildOutput,
    ContainerImage,
    DeploymentReport,
    AnalysisReport,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SourceArchive => "source_archive",
            Self::BuildOutput => "build_output",
            Self::ContainerImage => "container_image",
            Self::DeploymentReport => "deployment_report",
            Self::AnalysisReport => "analysis_report",
        };
        f.write_str(name)
    }
}

/// Named, typed artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub kind: ArtifactKind,
}

impl ArtifactRef {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)
    }
}

/// Name of a credential held by an external secret store; never its value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretRef(String);

impl SecretRef {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

/// External event that starts the first stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTrigger {
    pub provider: String,
    pub repository: String,
    pub branch: String,
    pub credential: SecretRef,
}

/// What a stage consumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageInput {
    Trigger(SourceTrigger),
    Artifact(ArtifactRef),
}

/// Side-effecting step of a stage, carried out by the stage runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Checkout,
    Synthesize,
    BuildImage,
    PushImage,
    Deploy,
    Invoke,
    Notify,
    Test,
}

/// Declared action; its config may reference provisioned resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    pub kind: ActionKind,
    #[serde(default)]
    pub config: Config,
}

impl ActionSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            config: Config::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// One declared stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub input: StageInput,
    pub output: ArtifactRef,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

impl StageSpec {
    /// Stage started by an external trigger
    #[must_use]
    pub fn source(name: impl Into<String>, trigger: SourceTrigger, output: ArtifactRef) -> Self {
        Self {
            name: name.into(),
            input: StageInput::Trigger(trigger),
            output,
            actions: Vec::new(),
        }
    }

    /// Stage consuming the previous stage's artifact
    #[must_use]
    pub fn consuming(name: impl Into<String>, input: ArtifactRef, output: ArtifactRef) -> Self {
        Self {
            name: name.into(),
            input: StageInput::Artifact(input),
            output,
            actions: Vec::new(),
        }
    }

    #[must_use]
    pub fn action(mut self, action: ActionSpec) -> Self {
        self.actions.push(action);
        self
    }

    /// Every config value of every action
    pub fn config_values(&self) -> impl Iterator<Item = &ConfigValue> + Clone + '_ {
        self.actions.iter().flat_map(|a| a.config.values())
    }
}

/// Validates stage lists
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineSequencer;

impl PipelineSequencer {
    /// Validate `stages` and produce an executable plan
    ///
    /// # Errors
    /// - `EmptyPipeline`, `DuplicateStage`
    /// - `MissingTrigger` if the first stage does not start from a trigger
    /// - `UnexpectedTrigger` if a later stage does
    /// - `ArtifactMismatch` naming both stages when adjacent kinds differ
    pub fn sequence(stages: Vec<StageSpec>) -> Result<PipelinePlan, PipelineError> {
        let Some(first) = stages.first() else {
            return Err(PipelineError::EmptyPipeline);
        };
        if !matches!(first.input, StageInput::Trigger(_)) {
            return Err(PipelineError::MissingTrigger {
                stage: first.name.clone(),
            });
        }

        let mut names = HashSet::with_capacity(stages.len());
        for stage in &stages {
            if !names.insert(stage.name.as_str()) {
                return Err(PipelineError::DuplicateStage(stage.name.clone()));
            }
        }

        for pair in stages.windows(2) {
            let (previous, stage) = (&pair[0], &pair[1]);
            match &stage.input {
                StageInput::Trigger(_) => {
                    return Err(PipelineError::UnexpectedTrigger {
                        stage: stage.name.clone(),
                    })
                }
                StageInput::Artifact(input) if input.kind != previous.output.kind => {
                    return Err(PipelineError::ArtifactMismatch {
                        previous: previous.name.clone(),
                        stage: stage.name.clone(),
                        expected: previous.output.kind,
                        found: input.kind,
                    })
                }
                StageInput::Artifact(_) => {}
            }
        }

        tracing::debug!("Sequenced pipeline with {} stages", stages.len());
        Ok(PipelinePlan { stages })
    }
}

/// Validated, strictly sequential pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelinePlan {
    stages: Vec<StageSpec>,
}

impl PipelinePlan {
    #[must_use]
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Start a step-by-step execution against provisioned state
    #[must_use]
    pub fn execution<'a>(
        &'a self,
        provisioned: &'a ProvisionedSet,
        context: &'a DeploymentContext,
    ) -> PipelineExecution<'a> {
        PipelineExecution::new(self, provisioned, context)
    }

    /// Drive every stage through `runner`, one at a time
    ///
    /// # Errors
    /// The first failing stage, as `StageFailed`, `OutputMismatch` or
    /// `ActionResolution`.
    pub async fn run(
        &self,
        runner: &dyn StageRunner,
        provisioned: &ProvisionedSet,
        context: &DeploymentContext,
    ) -> Result<PipelineSummary, PipelineError> {
        let mut execution = self.execution(provisioned, context);

        while let Some(stage) = execution.next_stage()? {
            tracing::info!(
                "Running stage {} ({} actions)",
                stage.name,
                stage.actions.len()
            );
            match runner.run_stage(&stage).await {
                Ok(produced) => {
                    tracing::info!("Stage {} produced {}", stage.name, produced.location);
                    execution.complete_stage(produced)?;
                }
                Err(reason) => return Err(execution.fail_stage(reason)),
            }
        }

        Ok(execution.into_summary())
    }
}

/// Executes one constructed stage outside the core
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Run every action of `stage` and report the produced artifact
    async fn run_stage(&self, stage: &ExecutableStage) -> Result<ProducedArtifact, String>;
}
