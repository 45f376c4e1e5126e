//! Pipeline execution state machine
//!
//! ```text
//! Ready(0) -> AwaitingOutput(0) -> Ready(1) -> ... -> AwaitingOutput(n) -> Finished
//!      \              \
//!       +--> Failed    +--> Failed
//! ```
//!
//! A stage's actions are resolved only when the stage is started, which is
//! only possible once the previous stage has reported its output.

use super::{ActionKind, ArtifactRef, PipelinePlan, SourceTrigger, StageInput};
use crate::context::DeploymentContext;
use crate::error::PipelineError;
use crate::model::ResolvedConfig;
use crate::resolver::ReferenceResolver;
use crate::state::ProvisionedSet;
use serde::{Deserialize, Serialize};

/// Position of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Stage may be started
    Ready { stage: usize },
    /// Stage was handed out; waiting for its artifact
    AwaitingOutput { stage: usize },
    Finished,
    Failed { stage: usize },
}

impl ExecutionState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::AwaitingOutput { .. } => "awaiting_output",
            Self::Finished => "finished",
            Self::Failed { .. } => "failed",
        }
    }
}

fn allowed(from: ExecutionState, to: ExecutionState) -> bool {
    use ExecutionState::{AwaitingOutput, Failed, Finished, Ready};
    match (from, to) {
        (Ready { stage: a }, AwaitingOutput { stage: b } | Failed { stage: b })
        | (AwaitingOutput { stage: a }, Failed { stage: b }) => a == b,
        (AwaitingOutput { stage: a }, Ready { stage: b }) => b == a + 1,
        (AwaitingOutput { .. }, Finished) => true,
        _ => false,
    }
}

/// Artifact reported by a stage runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducedArtifact {
    pub artifact: ArtifactRef,
    /// Where the runner stored it
    pub location: String,
}

/// What a started stage consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageSource {
    Trigger(SourceTrigger),
    Artifact(ProducedArtifact),
}

/// Action with its config resolved
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub name: String,
    pub kind: ActionKind,
    pub config: ResolvedConfig,
}

/// Stage ready to hand to a [`StageRunner`](super::StageRunner)
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutableStage {
    pub index: usize,
    pub name: String,
    pub input: StageSource,
    pub expected_output: ArtifactRef,
    pub actions: Vec<Action>,
}

/// Artifacts produced by a finished run, in stage order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSummary {
    pub artifacts: Vec<(String, ProducedArtifact)>,
}

/// Step-by-step execution of a [`PipelinePlan`]
#[derive(Debug)]
pub struct PipelineExecution<'a> {
    plan: &'a PipelinePlan,
    resolver: ReferenceResolver<'a>,
    state: ExecutionState,
    produced: Vec<ProducedArtifact>,
}

impl<'a> PipelineExecution<'a> {
    pub(super) fn new(
        plan: &'a PipelinePlan,
        provisioned: &'a ProvisionedSet,
        context: &'a DeploymentContext,
    ) -> Self {
        let state = if plan.is_empty() {
            ExecutionState::Finished
        } else {
            ExecutionState::Ready { stage: 0 }
        };
        Self {
            plan,
            resolver: ReferenceResolver::new(provisioned, context),
            state,
            produced: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ExecutionState {
        self.state
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state == ExecutionState::Finished
    }

    /// Artifacts reported so far
    #[must_use]
    pub fn produced(&self) -> &[ProducedArtifact] {
        &self.produced
    }

    fn stage_name(&self, index: usize) -> String {
        self.plan
            .stages()
            .get(index)
            .map_or_else(String::new, |s| s.name.clone())
    }

    fn current_name(&self) -> String {
        match self.state {
            ExecutionState::Ready { stage }
            | ExecutionState::AwaitingOutput { stage }
            | ExecutionState::Failed { stage } => self.stage_name(stage),
            ExecutionState::Finished => String::new(),
        }
    }

    fn out_of_order(&self, operation: &'static str) -> PipelineError {
        PipelineError::OutOfOrder {
            stage: self.current_name(),
            operation,
            state: self.state.name(),
        }
    }

    /// Move to `to`; a move the table forbids leaves the state untouched
    fn transition(
        &mut self,
        to: ExecutionState,
        operation: &'static str,
    ) -> Result<(), PipelineError> {
        if !allowed(self.state, to) {
            tracing::warn!(
                "Rejected pipeline transition {:?} -> {:?} on {operation}",
                self.state,
                to
            );
            return Err(self.out_of_order(operation));
        }
        tracing::debug!("Pipeline {} -> {}", self.state.name(), to.name());
        self.state = to;
        Ok(())
    }

    /// Construct the next stage, or `None` once every stage has finished
    ///
    /// # Errors
    /// - `OutOfOrder` while a stage is still awaiting its output or after a
    ///   failure
    /// - `ActionResolution` if an action's config cannot be resolved; the
    ///   execution is failed
    pub fn next_stage(&mut self) -> Result<Option<ExecutableStage>, PipelineError> {
        let index = match self.state {
            ExecutionState::Finished => return Ok(None),
            ExecutionState::Ready { stage } => stage,
            ExecutionState::AwaitingOutput { .. } | ExecutionState::Failed { .. } => {
                return Err(self.out_of_order("start"))
            }
        };
        let plan = self.plan;
        let spec = &plan.stages()[index];

        let input = match (&spec.input, self.produced.last()) {
            (StageInput::Trigger(trigger), _) => StageSource::Trigger(trigger.clone()),
            (StageInput::Artifact(_), Some(previous)) => StageSource::Artifact(previous.clone()),
            (StageInput::Artifact(_), None) => return Err(self.out_of_order("start")),
        };

        let mut actions = Vec::with_capacity(spec.actions.len());
        for action in &spec.actions {
            match self.resolver.resolve_config(&action.config) {
                Ok(config) => actions.push(Action {
                    name: action.name.clone(),
                    kind: action.kind,
                    config,
                }),
                Err(source) => {
                    self.transition(ExecutionState::Failed { stage: index }, "start")?;
                    return Err(PipelineError::ActionResolution {
                        stage: spec.name.clone(),
                        action: action.name.clone(),
                        source,
                    });
                }
            }
        }

        self.transition(ExecutionState::AwaitingOutput { stage: index }, "start")?;
        Ok(Some(ExecutableStage {
            index,
            name: spec.name.clone(),
            input,
            expected_output: spec.output.clone(),
            actions,
        }))
    }

    /// Report the artifact of the running stage
    ///
    /// # Errors
    /// - `OutOfOrder` when no stage is running
    /// - `OutputMismatch` when the artifact is not the declared output; the
    ///   stage stays running
    pub fn complete_stage(&mut self, produced: ProducedArtifact) -> Result<(), PipelineError> {
        let ExecutionState::AwaitingOutput { stage: index } = self.state else {
            return Err(self.out_of_order("complete"));
        };
        let plan = self.plan;
        let spec = &plan.stages()[index];
        if produced.artifact != spec.output {
            return Err(PipelineError::OutputMismatch {
                stage: spec.name.clone(),
                expected: spec.output.to_string(),
                found: produced.artifact.to_string(),
            });
        }

        self.produced.push(produced);
        let next = index + 1;
        if next < plan.len() {
            self.transition(ExecutionState::Ready { stage: next }, "complete")
        } else {
            self.transition(ExecutionState::Finished, "complete")
        }
    }

    /// Mark the running stage as failed and return the error to surface
    pub fn fail_stage(&mut self, reason: impl Into<String>) -> PipelineError {
        let ExecutionState::AwaitingOutput { stage: index } = self.state else {
            return self.out_of_order("fail");
        };
        if let Err(err) = self.transition(ExecutionState::Failed { stage: index }, "fail") {
            return err;
        }
        PipelineError::StageFailed {
            stage: self.stage_name(index),
            reason: reason.into(),
        }
    }

    /// Stage names paired with their artifacts
    #[must_use]
    pub fn into_summary(self) -> PipelineSummary {
        let artifacts = self
            .plan
            .stages()
            .iter()
            .map(|s| s.name.clone())
            .zip(self.produced)
            .collect();
        PipelineSummary { artifacts }
    }
}
