//! In-memory provider
//!
//! Derives physical names from a short SHA-256 digest of the stack name and
//! logical id, so the same declarations always produce the same identifiers,
//! ARNs, URIs and endpoint URLs. Used by the CLI and the tests.

use crate::context::{ContextField, DeploymentContext};
use crate::creator::{CreateRequest, CreatedResource, ResourceCreator};
use crate::error::CreateError;
use crate::model::{attr, ResourceId, ResourceKind};
use crate::pipeline::{ExecutableStage, ProducedArtifact, StageRunner, StageSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Account used when the context leaves it unset
pub const DEFAULT_ACCOUNT: &str = "000000000000";
/// Region used when the context leaves it unset
pub const DEFAULT_REGION: &str = "us-east-1";

/// Config key that pins a physical name
pub const NAME_KEY: &str = "name";

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Deterministic [`ResourceCreator`] and [`StageRunner`]
#[derive(Debug, Default)]
pub struct Simulator {
    latency: Option<Duration>,
    require_target: bool,
    created: Mutex<Vec<ResourceId>>,
    stages: Mutex<Vec<String>>,
}

impl Simulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long in every call
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Reject creations whose context has no account or region instead of
    /// falling back to [`DEFAULT_ACCOUNT`] and [`DEFAULT_REGION`]
    #[must_use]
    pub fn with_required_target(mut self) -> Self {
        self.require_target = true;
        self
    }

    /// Account and region to stamp into identifiers
    fn target<'c>(
        &self,
        ctx: &'c DeploymentContext,
        id: &ResourceId,
    ) -> Result<(&'c str, &'c str), CreateError> {
        let account = ctx.get(ContextField::Account);
        let region = ctx.get(ContextField::Region);
        if account.is_none() || region.is_none() {
            if self.require_target {
                return Err(CreateError::Rejected(format!(
                    "`{id}` needs an account and region in the deployment context"
                )));
            }
            tracing::debug!(
                "Context for {id} has no {}, using {} / {}",
                match (account, region) {
                    (None, None) => "account or region",
                    (None, Some(_)) => "account",
                    _ => "region",
                },
                account.unwrap_or(DEFAULT_ACCOUNT),
                region.unwrap_or(DEFAULT_REGION)
            );
        }
        Ok((
            account.unwrap_or(DEFAULT_ACCOUNT),
            region.unwrap_or(DEFAULT_REGION),
        ))
    }

    /// Ids created so far, in completion order
    #[must_use]
    pub fn created(&self) -> Vec<ResourceId> {
        self.created.lock().clone()
    }

    /// Stages run so far
    #[must_use]
    pub fn stages_run(&self) -> Vec<String> {
        self.stages.lock().clone()
    }

    /// Physical name for `id` within `context`
    #[must_use]
    pub fn physical_name(context: &DeploymentContext, id: &ResourceId) -> String {
        let hash = digest(&[&context.stack_name, id.as_str()]);
        format!("{}-{}-{}", context.stack_name, id, &hash[..8])
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ResourceCreator for Simulator {
    async fn create(&self, request: CreateRequest<'_>) -> Result<CreatedResource, CreateError> {
        self.pause().await;

        let ctx = request.context;
        let partition = ctx.partition.as_str();
        let (account, region) = self.target(ctx, request.id)?;

        let hash = digest(&[&ctx.stack_name, request.id.as_str()]);
        let short = &hash[..8];
        let name = request
            .config
            .get(NAME_KEY)
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| Self::physical_name(ctx, request.id), str::to_string);

        let created = match request.kind {
            ResourceKind::Network => {
                let vpc = format!("vpc-{short}");
                CreatedResource::new(&vpc)
                    .with_arn(format!("arn:{partition}:ec2:{region}:{account}:vpc/{vpc}"))
                    .with_attribute(attr::NAME, name)
            }
            ResourceKind::ComputeCluster => CreatedResource::new(&name)
                .with_arn(format!("arn:{partition}:eks:{region}:{account}:cluster/{name}"))
                .with_attribute(
                    attr::URL,
                    format!("https://{}.eks.{region}.amazonaws.com", hash[..16].to_uppercase()),
                )
                .with_attribute(attr::NAME, name),
            ResourceKind::ContainerRegistry => CreatedResource::new(&name)
                .with_arn(format!(
                    "arn:{partition}:ecr:{region}:{account}:repository/{name}"
                ))
                .with_attribute(
                    attr::URI,
                    format!("{account}.dkr.ecr.{region}.amazonaws.com/{name}"),
                )
                .with_attribute(attr::NAME, name),
            ResourceKind::ObjectStore => {
                let bucket = name.to_lowercase();
                CreatedResource::new(&bucket)
                    .with_arn(format!("arn:{partition}:s3:::{bucket}"))
                    .with_attribute(attr::URI, format!("s3://{bucket}"))
                    .with_attribute(attr::NAME, bucket)
            }
            ResourceKind::Topic => CreatedResource::new(&name)
                .with_arn(format!("arn:{partition}:sns:{region}:{account}:{name}"))
                .with_attribute(attr::NAME, name),
            ResourceKind::Function => {
                if request.function.is_none() {
                    return Err(CreateError::Rejected(format!(
                        "function `{}` declares no handler interface",
                        request.id
                    )));
                }
                CreatedResource::new(&name)
                    .with_arn(format!(
                        "arn:{partition}:lambda:{region}:{account}:function:{name}"
                    ))
                    .with_attribute(attr::NAME, name)
            }
            ResourceKind::Gateway => {
                let api_id = &hash[..10];
                let stage = request
                    .config
                    .get("stage")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("prod");
                CreatedResource::new(api_id)
                    .with_arn(format!("arn:{partition}:apigateway:{region}::/restapis/{api_id}"))
                    .with_attribute(
                        attr::URL,
                        format!("https://{api_id}.execute-api.{region}.amazonaws.com/{stage}/"),
                    )
                    .with_attribute(attr::NAME, name)
            }
            ResourceKind::Role => CreatedResource::new(&name)
                .with_arn(format!("arn:{partition}:iam::{account}:role/{name}"))
                .with_attribute(attr::NAME, name),
            ResourceKind::PipelineStage => CreatedResource::new(&name)
                .with_arn(format!(
                    "arn:{partition}:codebuild:{region}:{account}:project/{name}"
                ))
                .with_attribute(attr::NAME, name),
        };

        tracing::debug!("Simulated {} {} as {}", request.kind, request.id, created.identifier);
        self.created.lock().push(request.id.clone());
        Ok(created)
    }
}

#[async_trait]
impl StageRunner for Simulator {
    async fn run_stage(&self, stage: &ExecutableStage) -> Result<ProducedArtifact, String> {
        self.pause().await;

        let upstream = match &stage.input {
            StageSource::Trigger(trigger) => format!("{}@{}", trigger.repository, trigger.branch),
            StageSource::Artifact(artifact) => artifact.location.clone(),
        };
        let hash = digest(&[&stage.name, &stage.expected_output.name, &upstream]);

        self.stages.lock().push(stage.name.clone());
        Ok(ProducedArtifact {
            artifact: stage.expected_output.clone(),
            location: format!(
                "sim://{}/{}-{}",
                stage.name,
                stage.expected_output.name,
                &hash[..8]
            ),
        })
    }
}
