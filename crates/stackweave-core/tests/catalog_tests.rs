use pretty_assertions::assert_eq;
use stackweave_core::model::attr;
use stackweave_core::{
    catalog, Checkpoint, DeploymentContext, ProvisionOptions, ResourceId, Simulator, StackError,
    Synthesizer,
};
use stackweave_test_utils::FailingCreator;
use std::sync::Arc;

const OUTPUTS: [&str; 8] = [
    "ApiEndpoint",
    "BedrockOutputBucketName",
    "EcrRepositoryUri",
    "EksClusterName",
    "FailureAnalysisLambdaName",
    "GitHubDeployRoleArn",
    "LambdaFunctionName",
    "NotificationTopicArn",
];

fn synthesizer() -> Synthesizer {
    Synthesizer::new(
        DeploymentContext::new("ai-ml")
            .with_region("eu-west-1")
            .with_account("210987654321"),
    )
}

#[tokio::test]
async fn ai_ml_stack_applies_end_to_end() {
    let synth = synthesizer();
    let plan = synth.plan(catalog::ai_ml_stack()).unwrap();
    let sim = Arc::new(Simulator::new());

    let deployment = synth
        .apply(&plan, sim.clone(), Checkpoint::default())
        .await
        .unwrap();

    let outputs = deployment.output_map();
    assert_eq!(outputs.keys().map(String::as_str).collect::<Vec<_>>(), OUTPUTS);
    assert_eq!(
        outputs["EcrRepositoryUri"],
        "210987654321.dkr.ecr.eu-west-1.amazonaws.com/ai-ml-artifacts"
    );
    assert_eq!(
        outputs["GitHubDeployRoleArn"],
        "arn:aws:iam::210987654321:role/github-actions-deploy-role"
    );
    assert!(outputs["ApiEndpoint"].ends_with(".execute-api.eu-west-1.amazonaws.com/prod/"));

    // the cluster is only created after its network
    let created = sim.created();
    let at = |id: &str| created.iter().position(|c| c.as_str() == id).unwrap();
    assert!(at("vpc") < at("cluster"));
    assert!(at("risk-assessment") < at("api"));
}

#[tokio::test]
async fn bound_policies_reference_provisioned_arns() {
    let synth = synthesizer();
    let plan = synth.plan(catalog::ai_ml_stack()).unwrap();
    let deployment = synth
        .apply(&plan, Arc::new(Simulator::new()), Checkpoint::default())
        .await
        .unwrap();

    let topic_arn = deployment
        .report
        .provisioned
        .get("topic")
        .and_then(|t| t.attribute(attr::ARN).map(str::to_string))
        .unwrap();

    let risk = deployment
        .policies
        .iter()
        .find(|p| p.actor.as_str() == "risk-assessment")
        .unwrap();
    let json = risk.to_json();
    assert_eq!(json["Version"], "2012-10-17");
    let resources: Vec<&str> = json["Statement"]
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|s| s["Resource"].as_array().unwrap())
        .filter_map(|r| r.as_str())
        .collect();
    assert!(resources.contains(&topic_arn.as_str()));
    assert!(resources.iter().any(|r| r.ends_with("/*")));
    assert!(!resources.contains(&"*"));

    let role = deployment
        .policies
        .iter()
        .find(|p| p.actor.as_str() == "deploy-role")
        .unwrap();
    assert!(role.statements.iter().any(|s| s.wildcard));
}

#[tokio::test]
async fn pipeline_runs_after_apply() {
    let synth = synthesizer();
    let plan = synth.plan(catalog::ai_ml_stack_for("acme/ml-platform")).unwrap();
    let sim = Simulator::new();
    let deployment = synth
        .apply(&plan, Arc::new(Simulator::new()), Checkpoint::default())
        .await
        .unwrap();

    let summary = synth
        .run_pipeline(&plan, &deployment, &sim)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(sim.stages_run(), vec!["source", "build", "deploy", "analyze"]);
    let names: Vec<&str> = summary.artifacts.iter().map(|(s, _)| s.as_str()).collect();
    assert_eq!(names, vec!["source", "build", "deploy", "analyze"]);
    assert!(summary.artifacts[0].1.location.starts_with("sim://source/"));
}

#[tokio::test]
async fn interrupted_apply_resumes_from_persisted_checkpoint() {
    let synth = synthesizer().with_options(ProvisionOptions::default().with_max_parallel(4));
    let plan = synth.plan(catalog::ai_ml_stack()).unwrap();

    let err = synth
        .apply(
            &plan,
            Arc::new(FailingCreator::failing(["api"])),
            Checkpoint::default(),
        )
        .await
        .unwrap_err();
    let failure = match err {
        StackError::Provision(failure) => failure,
        other => panic!("expected a provisioning failure, got {other}"),
    };
    assert_eq!(failure.resource, ResourceId::new("api"));
    assert!(failure.checkpoint.contains("risk-assessment"));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ai-ml.checkpoint.json");
    std::fs::write(&path, failure.checkpoint.to_json_pretty().unwrap()).unwrap();
    let restored = Checkpoint::from_json_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

    let resumed = Arc::new(FailingCreator::failing(Vec::<&str>::new()));
    let deployment = synth.apply(&plan, resumed.clone(), restored).await.unwrap();

    assert!(!resumed
        .attempts()
        .iter()
        .any(|id| id.as_str() == "risk-assessment"));
    assert!(resumed.attempts().iter().any(|id| id.as_str() == "api"));
    assert_eq!(deployment.outputs.len(), OUTPUTS.len());
}

#[test]
fn catalog_requires_a_region() {
    let err = Synthesizer::new(DeploymentContext::new("ai-ml"))
        .plan(catalog::ai_ml_stack())
        .unwrap_err();
    assert_eq!(err.exit_code(), 2);
}
