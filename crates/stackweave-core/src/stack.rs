//! Stack synthesis
//!
//! [`Synthesizer`] ties the components together:
//! 1. `plan`: build the graph, sequence the pipeline, check every output and
//!    action reference and compose the policies. Nothing is created yet.
//! 2. `apply`: provision, bind the policies to real ARNs and export outputs.
//! 3. `run_pipeline`: optionally drive the deploy pipeline.

use crate::context::DeploymentContext;
use crate::creator::ResourceCreator;
use crate::error::{OutputError, StackError};
use crate::graph::DependencyGraph;
use crate::model::{ResourceDeclaration, ResourceId};
use crate::outputs::{ExportedOutput, OutputExporter, OutputSpec};
use crate::pipeline::{PipelinePlan, PipelineSequencer, PipelineSummary, StageRunner, StageSpec};
use crate::policy::{PolicyComposer, PolicyDocument, PolicyStatement, WildcardPolicy};
use crate::provisioner::{ProvisionOptions, ProvisionReport, Provisioner};
use crate::resolver::ReferenceResolver;
use crate::state::Checkpoint;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Declarative description of a whole stack
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackDefinition {
    #[serde(default)]
    pub resources: Vec<ResourceDeclaration>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline: Vec<StageSpec>,
}

impl StackDefinition {
    pub fn from_yaml_str(source: &str) -> Result<Self, StackError> {
        serde_yaml::from_str(source).map_err(|e| StackError::Config(format!("invalid stack YAML: {e}")))
    }

    pub fn from_json_str(source: &str) -> Result<Self, StackError> {
        serde_json::from_str(source).map_err(|e| StackError::Config(format!("invalid stack JSON: {e}")))
    }
}

/// Validated stack, ready to apply
#[derive(Debug)]
pub struct StackPlan {
    pub graph: DependencyGraph,
    /// Composed statements per actor
    pub policies: BTreeMap<ResourceId, Vec<PolicyStatement>>,
    pub pipeline: Option<PipelinePlan>,
    pub outputs: Vec<OutputSpec>,
}

impl StackPlan {
    /// Statements flagged for targeting `*`
    pub fn flagged_statements(&self) -> impl Iterator<Item = &PolicyStatement> + '_ {
        self.policies.values().flatten().filter(|s| s.wildcard)
    }
}

/// Result of applying a plan
#[derive(Debug)]
pub struct Deployment {
    pub report: ProvisionReport,
    /// Policy documents bound to provisioned ARNs
    pub policies: Vec<PolicyDocument>,
    pub outputs: Vec<ExportedOutput>,
}

impl Deployment {
    #[must_use]
    pub fn output_map(&self) -> BTreeMap<String, String> {
        self.outputs
            .iter()
            .map(|o| (o.name.clone(), o.value.clone()))
            .collect()
    }
}

/// Plans and applies stacks for one deployment context
#[derive(Debug, Clone)]
pub struct Synthesizer {
    context: DeploymentContext,
    composer: PolicyComposer,
    options: ProvisionOptions,
}

impl Synthesizer {
    #[must_use]
    pub fn new(context: DeploymentContext) -> Self {
        Self {
            context,
            composer: PolicyComposer::default(),
            options: ProvisionOptions::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_wildcard_policy(mut self, policy: WildcardPolicy) -> Self {
        self.composer = PolicyComposer::new(policy);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_options(mut self, options: ProvisionOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn context(&self) -> &DeploymentContext {
        &self.context
    }

    /// Validate `definition` without side effects
    ///
    /// # Errors
    /// Any graph, pipeline, output or policy error. All of them are detected
    /// before anything is provisioned.
    pub fn plan(&self, definition: StackDefinition) -> Result<StackPlan, StackError> {
        tracing::info!(
            "Planning stack {}: {} resources, {} outputs, {} stages",
            self.context.stack_name,
            definition.resources.len(),
            definition.outputs.len(),
            definition.pipeline.len()
        );

        let graph = DependencyGraph::build(definition.resources, &self.context)?;

        let mut names = HashSet::with_capacity(definition.outputs.len());
        for output in &definition.outputs {
            if !names.insert(output.name.as_str()) {
                return Err(OutputError::DuplicateOutput(output.name.clone()).into());
            }
            graph.check_references(
                &format!("output `{}`", output.name),
                std::iter::once(&output.value),
                &self.context,
            )?;
        }

        let pipeline = if definition.pipeline.is_empty() {
            None
        } else {
            let plan = PipelineSequencer::sequence(definition.pipeline)?;
            for stage in plan.stages() {
                graph.check_references(
                    &format!("stage `{}`", stage.name),
                    stage.config_values(),
                    &self.context,
                )?;
            }
            Some(plan)
        };

        let mut policies = BTreeMap::new();
        for actor in graph.actors() {
            let statements = self.composer.compose(&actor.id, &actor.grants)?;
            tracing::debug!("Composed {} statements for {}", statements.len(), actor.id);
            policies.insert(actor.id.clone(), statements);
        }

        let plan = StackPlan {
            graph,
            policies,
            pipeline,
            outputs: definition.outputs,
        };
        let flagged = plan.flagged_statements().count();
        if flagged > 0 {
            tracing::warn!("Plan contains {} wildcard statements", flagged);
        }
        Ok(plan)
    }

    /// Provision `plan`, bind its policies and export its outputs
    ///
    /// # Errors
    /// `Provision` with the partial checkpoint, or a policy/output binding
    /// error after provisioning.
    pub async fn apply(
        &self,
        plan: &StackPlan,
        creator: Arc<dyn ResourceCreator>,
        checkpoint: Checkpoint,
    ) -> Result<Deployment, StackError> {
        let report = Provisioner::new(creator, self.context.clone())
            .with_options(self.options)
            .provision(&plan.graph, checkpoint)
            .await?;

        let resolver = ReferenceResolver::new(&report.provisioned, &self.context);
        let policies = plan
            .policies
            .iter()
            .map(|(actor, statements)| self.composer.bind(actor, statements, &resolver))
            .collect::<Result<Vec<_>, _>>()?;

        let outputs = OutputExporter::new(&self.context).describe(&plan.outputs, &report.provisioned)?;
        tracing::info!("Exported {} outputs", outputs.len());

        Ok(Deployment {
            report,
            policies,
            outputs,
        })
    }

    /// Drive the plan's pipeline against a finished deployment
    ///
    /// Returns `None` when the stack declares no pipeline.
    pub async fn run_pipeline(
        &self,
        plan: &StackPlan,
        deployment: &Deployment,
        runner: &dyn StageRunner,
    ) -> Result<Option<PipelineSummary>, StackError> {
        let Some(pipeline) = &plan.pipeline else {
            return Ok(None);
        };
        let summary = pipeline
            .run(runner, &deployment.report.provisioned, &self.context)
            .await?;
        Ok(Some(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorClass, GraphError};
    use crate::simulator::Simulator;

    const YAML: &str = r#"
resources:
  - id: topic
    kind: topic
  - id: fn
    kind: function
    function: { runtime: python3.9, handler: index.handler, code: lambda/fn }
    config:
      environment:
        TOPIC_ARN: { ref: { resource: topic, attribute: arn } }
    grants:
      - actions: ["sns:Publish"]
        targets: [topic]
outputs:
  - name: FunctionName
    value: { ref: { resource: fn, attribute: name } }
    description: Name of the function
"#;

    #[test]
    fn plans_from_yaml() {
        let definition = StackDefinition::from_yaml_str(YAML).unwrap();
        let plan = Synthesizer::new(DeploymentContext::new("demo"))
            .plan(definition)
            .unwrap();

        assert_eq!(plan.graph.len(), 2);
        assert_eq!(plan.policies[&ResourceId::new("fn")].len(), 1);
        assert!(plan.pipeline.is_none());
    }

    #[test]
    fn unknown_output_reference_fails_planning() {
        let mut definition = StackDefinition::from_yaml_str(YAML).unwrap();
        definition.outputs.push(OutputSpec::new(
            "Missing",
            crate::model::ConfigValue::reference("ghost", "arn"),
            "",
        ));

        let err = Synthesizer::new(DeploymentContext::default())
            .plan(definition)
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(matches!(
            err,
            StackError::Graph(GraphError::UnknownReference { ref missing, .. })
                if missing.as_str() == "ghost"
        ));
    }

    #[test]
    fn wildcard_grant_on_a_topic_fails_planning() {
        let yaml = r#"
resources:
  - id: t
    kind: topic
    grants:
      - actions: ["iam:*"]
        targets: ["*"]
"#;
        let err = Synthesizer::new(DeploymentContext::new("demo"))
            .plan(StackDefinition::from_yaml_str(yaml).unwrap())
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(matches!(
            err,
            StackError::Graph(GraphError::GrantOnNonActor { ref resource, .. })
                if resource.as_str() == "t"
        ));
    }

    #[test]
    fn mistyped_context_field_is_a_config_error() {
        let yaml = "resources:\n  - id: t\n    kind: topic\n    config:\n      region: { context: regoin }\n";
        let err = StackDefinition::from_yaml_str(yaml).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Config);
    }

    #[test]
    fn malformed_yaml_is_a_config_error() {
        let err = StackDefinition::from_yaml_str("resources: [ { id: x } ]").unwrap_err();
        assert_eq!(err.class(), ErrorClass::Config);
    }

    #[tokio::test]
    async fn applies_and_binds_policies() {
        let synthesizer = Synthesizer::new(DeploymentContext::new("demo"));
        let plan = synthesizer
            .plan(StackDefinition::from_yaml_str(YAML).unwrap())
            .unwrap();

        let deployment = synthesizer
            .apply(&plan, Arc::new(Simulator::new()), Checkpoint::default())
            .await
            .unwrap();

        let topic_arn = deployment
            .report
            .provisioned
            .get("topic")
            .and_then(|t| t.attribute("arn").map(str::to_string))
            .unwrap();
        assert_eq!(deployment.policies[0].statements[0].resources, vec![topic_arn]);
        assert!(deployment.output_map()["FunctionName"].starts_with("demo-fn-"));
    }
}
