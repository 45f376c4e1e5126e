//! Built-in stacks
//!
//! `ai-ml`: a container cluster with its network and image registry, a
//! versioned output bucket, a notification topic, two model-invoking
//! functions behind a REST gateway, a CI deploy role assumed through web
//! identity, and the source -> build -> deploy -> analyze pipeline.

use crate::context::ContextField;
use crate::model::{
    attr, ConfigValue, FunctionInterface, ResourceDeclaration, ResourceKind, ENVIRONMENT_KEY,
};
use crate::outputs::OutputSpec;
use crate::pipeline::{
    ActionKind, ActionSpec, ArtifactKind, ArtifactRef, SecretRef, SourceTrigger, StageSpec,
};
use crate::policy::{Grant, TargetRef};
use crate::simulator::NAME_KEY;
use crate::stack::StackDefinition;

/// Name of the built-in AI/ML stack
pub const AI_ML: &str = "ai-ml";

/// Repository the deploy role trusts when none is given
pub const DEFAULT_REPOSITORY: &str = "abhaygha/AIMLCDK";

const OIDC_PROVIDER: &str = "token.actions.githubusercontent.com";
const KUBECTL_LAYER_ACCOUNT: &str = "903779448426";

/// Names of every built-in stack
#[must_use]
pub fn names() -> &'static [&'static str] {
    &[AI_ML]
}

/// Built-in stack by name
#[must_use]
pub fn by_name(name: &str) -> Option<StackDefinition> {
    match name {
        AI_ML => Some(ai_ml_stack()),
        _ => None,
    }
}

/// The AI/ML stack trusting [`DEFAULT_REPOSITORY`]
#[must_use]
pub fn ai_ml_stack() -> StackDefinition {
    ai_ml_stack_for(DEFAULT_REPOSITORY)
}

/// The AI/ML stack whose deploy role and pipeline use `repository`
#[must_use]
pub fn ai_ml_stack_for(repository: &str) -> StackDefinition {
    StackDefinition {
        resources: resources(repository),
        outputs: outputs(),
        pipeline: pipeline(repository),
    }
}

fn r(id: &str, attribute: &str) -> ConfigValue {
    ConfigValue::reference(id, attribute)
}

fn lit(value: &str) -> ConfigValue {
    ConfigValue::literal(value)
}

fn resources(repository: &str) -> Vec<ResourceDeclaration> {
    let region = || ConfigValue::context(ContextField::Region);

    let vpc = ResourceDeclaration::new("vpc", ResourceKind::Network).with("max_azs", 2u64);

    let cluster = ResourceDeclaration::new("cluster", ResourceKind::ComputeCluster)
        .with("version", "1.28")
        .with("default_capacity", 2u64)
        .with("instance_type", "t3.medium")
        .with("vpc_id", r("vpc", attr::ID))
        .with(
            "kubectl_layer",
            ConfigValue::join([
                lit("arn:"),
                ConfigValue::context(ContextField::Partition),
                lit(":lambda:"),
                region(),
                lit(&format!(":{KUBECTL_LAYER_ACCOUNT}:layer:kubectl-layer-v28:1")),
            ]),
        )
        .depends_on("vpc");

    let registry = ResourceDeclaration::new("registry", ResourceKind::ContainerRegistry)
        .with(NAME_KEY, "ai-ml-artifacts")
        .with("removal_policy", "destroy")
        .with(
            "lifecycle_rules",
            ConfigValue::List(vec![ConfigValue::map([
                ("max_image_count", ConfigValue::literal(5)),
                ("description", lit("Keep only 5 latest images")),
            ])]),
        );

    let bucket = ResourceDeclaration::new("bucket", ResourceKind::ObjectStore)
        .with("removal_policy", "retain")
        .with("encryption", "s3_managed")
        .with("versioned", true);

    let topic = ResourceDeclaration::new("topic", ResourceKind::Topic)
        .with("display_name", "AI Risk Assessment Notifications")
        .with(
            "subscriptions",
            ConfigValue::List(vec![ConfigValue::map([
                ("protocol", lit("email")),
                ("endpoint", lit("your-email@example.com")),
            ])]),
        );

    let risk_assessment = ResourceDeclaration::new("risk-assessment", ResourceKind::Function)
        .function(
            FunctionInterface::new("python3.9", "index.handler", "lambda/risk-assessment")
                .requires_env([
                    "BEDROCK_REGION",
                    "SNS_TOPIC_ARN",
                    "S3_BUCKET_NAME",
                    "ECR_REPOSITORY_URI",
                    "EKS_CLUSTER_NAME",
                ]),
        )
        .with(
            ENVIRONMENT_KEY,
            ConfigValue::map([
                ("BEDROCK_REGION", region()),
                ("SNS_TOPIC_ARN", r("topic", attr::ARN)),
                ("S3_BUCKET_NAME", r("bucket", attr::NAME)),
                ("ECR_REPOSITORY_URI", r("registry", attr::URI)),
                ("EKS_CLUSTER_NAME", r("cluster", attr::NAME)),
            ]),
        )
        .grant(Grant::new(
            [
                "bedrock:*",
                "sns:Publish",
                "s3:PutObject",
                "s3:GetObject",
                "ecr:*",
                "eks:*",
            ],
            [
                TargetRef::resource("topic"),
                TargetRef::resource("bucket"),
                TargetRef::path("bucket", "*"),
                TargetRef::resource("registry"),
                TargetRef::resource("cluster"),
            ],
        ));

    let failure_analysis = ResourceDeclaration::new("failure-analysis", ResourceKind::Function)
        .function(
            FunctionInterface::new("python3.9", "index.handler", "lambda/failure-analysis")
                .with_timeout_secs(300)
                .requires_env(["BEDROCK_REGION", "SNS_TOPIC_ARN", "S3_BUCKET_NAME"]),
        )
        .with(
            ENVIRONMENT_KEY,
            ConfigValue::map([
                ("BEDROCK_REGION", region()),
                ("SNS_TOPIC_ARN", r("topic", attr::ARN)),
                ("S3_BUCKET_NAME", r("bucket", attr::NAME)),
            ]),
        )
        .grant(Grant::new(
            ["bedrock:InvokeModel", "sns:Publish", "s3:PutObject", "s3:GetObject"],
            [
                TargetRef::arn("arn:aws:bedrock:*::foundation-model/*"),
                TargetRef::resource("topic"),
                TargetRef::resource("bucket"),
                TargetRef::path("bucket", "*"),
            ],
        ));

    let route = |path: &str, target: &str| {
        ConfigValue::map([
            ("method", lit("POST")),
            ("path", lit(path)),
            ("target", r(target, attr::ARN)),
        ])
    };
    let api = ResourceDeclaration::new("api", ResourceKind::Gateway)
        .with("rest_api_name", "Risk Assessment Service")
        .with("description", "API Gateway for AI/ML risk assessment")
        .with("stage", "prod")
        .with(
            "routes",
            ConfigValue::List(vec![
                route("/assess", "risk-assessment"),
                route("/analyze-failure", "failure-analysis"),
            ]),
        );

    // The deploy role deploys the whole stack; its wildcard is declared
    // explicitly so it is flagged rather than rejected.
    let deploy_role = ResourceDeclaration::new("deploy-role", ResourceKind::Role)
        .with(NAME_KEY, "github-actions-deploy-role")
        .with("description", "Role used by GitHub Actions to deploy CDK stacks")
        .with(
            "assumed_by",
            ConfigValue::map([
                ("provider", lit(OIDC_PROVIDER)),
                ("audience", lit("sts.amazonaws.com")),
                (
                    "subject",
                    lit(&format!("repo:{repository}:ref:refs/heads/main")),
                ),
            ]),
        )
        .grant(Grant::wildcard([
            "cloudformation:*",
            "iam:*",
            "lambda:*",
            "apigateway:*",
            "sns:*",
            "bedrock:*",
            "s3:*",
            "ecr:*",
            "eks:*",
            "ec2:*",
        ]));

    vec![
        vpc,
        cluster,
        registry,
        bucket,
        topic,
        risk_assessment,
        failure_analysis,
        api,
        deploy_role,
    ]
}

fn outputs() -> Vec<OutputSpec> {
    vec![
        OutputSpec::new(
            "EksClusterName",
            r("cluster", attr::NAME),
            "Name of the EKS cluster",
        ),
        OutputSpec::new(
            "EcrRepositoryUri",
            r("registry", attr::URI),
            "URI of the ECR repository",
        ),
        OutputSpec::new(
            "BedrockOutputBucketName",
            r("bucket", attr::NAME),
            "Name of the S3 bucket for Bedrock outputs",
        ),
        OutputSpec::new(
            "LambdaFunctionName",
            r("risk-assessment", attr::NAME),
            "Name of the Risk Assessment Lambda Function",
        ),
        OutputSpec::new(
            "FailureAnalysisLambdaName",
            r("failure-analysis", attr::NAME),
            "Name of the Failure Analysis Lambda Function",
        ),
        OutputSpec::new(
            "NotificationTopicArn",
            r("topic", attr::ARN),
            "ARN of the SNS notification topic",
        ),
        OutputSpec::new("ApiEndpoint", r("api", attr::URL), "URL of the Risk Assessment API"),
        OutputSpec::new(
            "GitHubDeployRoleArn",
            r("deploy-role", attr::ARN),
            "ARN of the GitHub Actions deployment role",
        ),
    ]
}

fn pipeline(repository: &str) -> Vec<StageSpec> {
    let source = ArtifactRef::new("source", ArtifactKind::SourceArchive);
    let image = ArtifactRef::new("image", ArtifactKind::ContainerImage);
    let report = ArtifactRef::new("deploy-report", ArtifactKind::DeploymentReport);
    let analysis = ArtifactRef::new("analysis", ArtifactKind::AnalysisReport);

    vec![
        StageSpec::source(
            "source",
            SourceTrigger {
                provider: "github".into(),
                repository: repository.into(),
                branch: "main".into(),
                credential: SecretRef::new("github-token"),
            },
            source.clone(),
        )
        .action(ActionSpec::new("checkout", ActionKind::Checkout)),
        StageSpec::consuming("build", source, image.clone())
            .action(ActionSpec::new("synth", ActionKind::Synthesize))
            .action(ActionSpec::new("test", ActionKind::Test))
            .action(
                ActionSpec::new("build-image", ActionKind::BuildImage)
                    .with("repository", r("registry", attr::URI)),
            ),
        StageSpec::consuming("deploy", image, report.clone())
            .action(
                ActionSpec::new("push-image", ActionKind::PushImage)
                    .with("repository", r("registry", attr::URI)),
            )
            .action(
                ActionSpec::new("deploy", ActionKind::Deploy)
                    .with("role_arn", r("deploy-role", attr::ARN))
                    .with("cluster", r("cluster", attr::NAME)),
            ),
        StageSpec::consuming("analyze", report, analysis)
            .action(
                ActionSpec::new("analyze-failure", ActionKind::Invoke)
                    .with("function", r("failure-analysis", attr::NAME)),
            )
            .action(
                ActionSpec::new("notify", ActionKind::Notify)
                    .with("topic_arn", r("topic", attr::ARN)),
            ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeploymentContext;
    use crate::model::ResourceId;
    use crate::stack::Synthesizer;

    #[test]
    fn plans_with_region() {
        let ctx = DeploymentContext::new("AiMlInfrastructureStack").with_region("us-west-2");
        let plan = Synthesizer::new(ctx).plan(ai_ml_stack()).unwrap();

        assert_eq!(plan.graph.len(), 9);
        assert_eq!(plan.outputs.len(), 8);
        assert_eq!(
            plan.pipeline.as_ref().unwrap().stage_names(),
            vec!["source", "build", "deploy", "analyze"]
        );
        assert_eq!(plan.policies.len(), 3);

        let flagged: Vec<&ResourceId> = plan.flagged_statements().map(|s| &s.actor).collect();
        assert_eq!(flagged, vec![&ResourceId::new("deploy-role")]);
    }

    #[test]
    fn region_is_required() {
        let err = Synthesizer::new(DeploymentContext::new("demo"))
            .plan(ai_ml_stack())
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("region"));
    }

    #[test]
    fn lookup_by_name() {
        assert!(by_name(AI_ML).is_some());
        assert!(by_name("web").is_none());
        assert_eq!(names(), &[AI_ML]);
    }
}
