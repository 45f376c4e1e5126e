use async_trait::async_trait;
use proptest::prelude::*;
use stackweave_core::pipeline::{
    ArtifactKind, ArtifactRef, ExecutableStage, ProducedArtifact, SecretRef, SourceTrigger,
    StageSource,
};
use stackweave_core::{
    DeploymentContext, PipelineError, PipelineSequencer, ProvisionedSet, Simulator, StageRunner,
    StageSpec,
};

const KINDS: [ArtifactKind; 5] = [
    ArtifactKind::SourceArchive,
    ArtifactKind::BuildOutput,
    ArtifactKind::ContainerImage,
    ArtifactKind::DeploymentReport,
    ArtifactKind::AnalysisReport,
];

fn trigger() -> SourceTrigger {
    SourceTrigger {
        provider: "github".into(),
        repository: "acme/ai-ml".into(),
        branch: "main".into(),
        credential: SecretRef::new("github-token"),
    }
}

/// Stage `i` consumes `inputs[i]` and produces `outputs[i]`
fn stages(inputs: &[ArtifactKind], outputs: &[ArtifactKind]) -> Vec<StageSpec> {
    outputs
        .iter()
        .enumerate()
        .map(|(i, out)| {
            let output = ArtifactRef::new(format!("a{i}"), *out);
            if i == 0 {
                StageSpec::source("s0", trigger(), output)
            } else {
                StageSpec::consuming(
                    format!("s{i}"),
                    ArtifactRef::new(format!("a{}", i - 1), inputs[i]),
                    output,
                )
            }
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_sequencer_accepts_exactly_matching_handoffs(
        picks in proptest::collection::vec((0..5usize, 0..5usize), 1..8)
    ) {
        let inputs: Vec<ArtifactKind> = picks.iter().map(|(i, _)| KINDS[*i]).collect();
        let outputs: Vec<ArtifactKind> = picks.iter().map(|(_, o)| KINDS[*o]).collect();
        let result = PipelineSequencer::sequence(stages(&inputs, &outputs));

        let first_mismatch = (1..outputs.len()).find(|&i| inputs[i] != outputs[i - 1]);
        match (first_mismatch, result) {
            (None, Ok(plan)) => prop_assert_eq!(plan.len(), outputs.len()),
            (Some(i), Err(PipelineError::ArtifactMismatch { previous, stage, .. })) => {
                prop_assert_eq!(previous, format!("s{}", i - 1));
                prop_assert_eq!(stage, format!("s{i}"));
            }
            (expected, got) => prop_assert!(false, "expected mismatch at {:?}, got {:?}", expected, got),
        }
    }
}

/// Runner that fails one named stage
struct BreaksAt(&'static str);

#[async_trait]
impl StageRunner for BreaksAt {
    async fn run_stage(&self, stage: &ExecutableStage) -> Result<ProducedArtifact, String> {
        if stage.name == self.0 {
            return Err(format!("{} exited with status 1", stage.name));
        }
        Ok(ProducedArtifact {
            artifact: stage.expected_output.clone(),
            location: format!("mem://{}", stage.name),
        })
    }
}

/// Runner that reports the wrong artifact
struct WrongArtifact;

#[async_trait]
impl StageRunner for WrongArtifact {
    async fn run_stage(&self, stage: &ExecutableStage) -> Result<ProducedArtifact, String> {
        Ok(ProducedArtifact {
            artifact: ArtifactRef::new("other", stage.expected_output.kind),
            location: "mem://other".into(),
        })
    }
}

fn three_stages() -> Vec<StageSpec> {
    stages(
        &[
            ArtifactKind::SourceArchive,
            ArtifactKind::SourceArchive,
            ArtifactKind::ContainerImage,
        ],
        &[
            ArtifactKind::SourceArchive,
            ArtifactKind::ContainerImage,
            ArtifactKind::DeploymentReport,
        ],
    )
}

#[tokio::test]
async fn run_hands_each_artifact_to_the_next_stage() {
    let plan = PipelineSequencer::sequence(three_stages()).unwrap();
    let sim = Simulator::new();
    let set = ProvisionedSet::new();
    let ctx = DeploymentContext::default();

    let summary = plan.run(&sim, &set, &ctx).await.unwrap();
    assert_eq!(sim.stages_run(), vec!["s0", "s1", "s2"]);
    assert_eq!(summary.artifacts.len(), 3);
    assert_eq!(summary.artifacts[2].1.artifact.kind, ArtifactKind::DeploymentReport);
}

#[tokio::test]
async fn failing_stage_stops_the_pipeline() {
    let plan = PipelineSequencer::sequence(three_stages()).unwrap();
    let set = ProvisionedSet::new();
    let ctx = DeploymentContext::default();

    let err = plan.run(&BreaksAt("s1"), &set, &ctx).await.unwrap_err();
    assert_eq!(
        err,
        PipelineError::StageFailed {
            stage: "s1".into(),
            reason: "s1 exited with status 1".into()
        }
    );
}

#[tokio::test]
async fn mismatched_output_is_rejected() {
    let plan = PipelineSequencer::sequence(three_stages()).unwrap();
    let set = ProvisionedSet::new();
    let ctx = DeploymentContext::default();

    let err = plan.run(&WrongArtifact, &set, &ctx).await.unwrap_err();
    assert!(matches!(err, PipelineError::OutputMismatch { ref stage, .. } if stage == "s0"));
}

#[test]
fn second_stage_receives_first_stage_artifact() {
    let plan = PipelineSequencer::sequence(three_stages()).unwrap();
    let set = ProvisionedSet::new();
    let ctx = DeploymentContext::default();
    let mut exec = plan.execution(&set, &ctx);

    let first = exec.next_stage().unwrap().unwrap();
    let produced = ProducedArtifact {
        artifact: first.expected_output.clone(),
        location: "mem://s0".into(),
    };
    exec.complete_stage(produced.clone()).unwrap();

    let second = exec.next_stage().unwrap().unwrap();
    assert_eq!(second.input, StageSource::Artifact(produced));
}
