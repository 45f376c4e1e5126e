//! Subcommand implementations

use anyhow::Context as _;
use clap::ArgMatches;
use serde_json::json;
use stackweave_core::{
    catalog, Checkpoint, Deployment, DeploymentContext, ProvisionOptions, Simulator,
    StackDefinition, StackError, StackPlan, Synthesizer, WildcardPolicy,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Build the deployment context: TOML file first, then flag overrides
fn context(args: &ArgMatches) -> anyhow::Result<DeploymentContext> {
    let mut ctx = match args.get_one::<PathBuf>("context") {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("reading context file {}", path.display()))?;
            DeploymentContext::from_toml_str(&source)?
        }
        None => DeploymentContext::new(default_stack_name(args)),
    };

    if let Some(name) = args.get_one::<String>("stack-name") {
        ctx.stack_name.clone_from(name);
    }
    if let Some(account) = args.get_one::<String>("account") {
        ctx.account = Some(account.clone());
    }
    if let Some(region) = args.get_one::<String>("region") {
        ctx.region = Some(region.clone());
    }
    if let Some(environment) = args.get_one::<String>("environment") {
        ctx.environment.clone_from(environment);
    }
    Ok(ctx)
}

fn default_stack_name(args: &ArgMatches) -> String {
    if let Some(path) = args.get_one::<PathBuf>("file") {
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            return stem.to_string();
        }
    }
    args.get_one::<String>("stack")
        .cloned()
        .unwrap_or_else(|| catalog::AI_ML.to_string())
}

/// Load the selected stack, from a file or the built-in catalog
fn definition(args: &ArgMatches) -> anyhow::Result<StackDefinition> {
    if let Some(path) = args.get_one::<PathBuf>("file") {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("reading stack file {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let definition = if is_json {
            StackDefinition::from_json_str(&source)?
        } else {
            StackDefinition::from_yaml_str(&source)?
        };
        return Ok(definition);
    }

    let name = args
        .get_one::<String>("stack")
        .map_or(catalog::AI_ML, String::as_str);
    if name == catalog::AI_ML {
        if let Some(repository) = args.get_one::<String>("repository") {
            return Ok(catalog::ai_ml_stack_for(repository));
        }
    }
    catalog::by_name(name).ok_or_else(|| {
        StackError::Config(format!(
            "unknown stack `{name}` (available: {})",
            catalog::names().join(", ")
        ))
        .into()
    })
}

fn synthesizer(args: &ArgMatches) -> anyhow::Result<Synthesizer> {
    let mut synth = Synthesizer::new(context(args)?);
    if args.get_flag("warn-wildcards") {
        synth = synth.with_wildcard_policy(WildcardPolicy::Warn);
    }
    Ok(synth)
}

fn read_checkpoint(path: &Path) -> anyhow::Result<Checkpoint> {
    if !path.exists() {
        tracing::info!("No checkpoint at {}, starting fresh", path.display());
        return Ok(Checkpoint::default());
    }
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading checkpoint {}", path.display()))?;
    let checkpoint = Checkpoint::from_json_str(&source)
        .map_err(|e| StackError::Config(format!("invalid checkpoint {}: {e}", path.display())))?;
    tracing::info!(
        "Loaded checkpoint {} with {} resources",
        path.display(),
        checkpoint.len()
    );
    Ok(checkpoint)
}

fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> anyhow::Result<()> {
    let body = checkpoint.to_json_pretty()?;
    std::fs::write(path, body)
        .with_context(|| format!("writing checkpoint {}", path.display()))?;
    tracing::info!(
        "Wrote checkpoint {} with {} resources",
        path.display(),
        checkpoint.len()
    );
    Ok(())
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn plan_json(synth: &Synthesizer, plan: &StackPlan) -> serde_json::Value {
    let waves: Vec<Vec<&str>> = plan
        .graph
        .waves()
        .iter()
        .map(|wave| wave.iter().map(|d| d.id.as_str()).collect())
        .collect();
    json!({
        "stack": synth.context().stack_name,
        "region": synth.context().region,
        "order": plan.graph.order_ids(),
        "waves": waves,
        "policies": plan.policies,
        "pipeline": plan.pipeline.as_ref().map(|p| p.stage_names()),
        "outputs": plan.outputs.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
    })
}

pub(crate) fn plan(args: &ArgMatches) -> anyhow::Result<()> {
    let synth = synthesizer(args)?;
    let plan = synth.plan(definition(args)?)?;

    if args.get_flag("json") {
        return print_json(&plan_json(&synth, &plan));
    }

    let ctx = synth.context();
    println!(
        "Stack {} ({}/{}): {} resources in {} waves",
        ctx.stack_name,
        ctx.account.as_deref().unwrap_or("-"),
        ctx.region.as_deref().unwrap_or("-"),
        plan.graph.len(),
        plan.graph.waves().len()
    );
    for (i, decl) in plan.graph.provisioning_order().enumerate() {
        println!("  {:>2}. {} ({})", i + 1, decl.id, decl.kind);
    }

    if !plan.policies.is_empty() {
        println!("Policies:");
        for (actor, statements) in &plan.policies {
            let flagged = statements.iter().filter(|s| s.wildcard).count();
            if flagged > 0 {
                println!(
                    "  {actor}: {} statements ({flagged} targeting *)",
                    statements.len()
                );
            } else {
                println!("  {actor}: {} statements", statements.len());
            }
        }
    }
    if let Some(pipeline) = &plan.pipeline {
        println!("Pipeline: {}", pipeline.stage_names().join(" -> "));
    }
    if !plan.outputs.is_empty() {
        println!("Outputs:");
        for output in &plan.outputs {
            println!("  {}", output.name);
        }
    }
    Ok(())
}

pub(crate) fn graph(args: &ArgMatches) -> anyhow::Result<()> {
    let synth = synthesizer(args)?;
    let plan = synth.plan(definition(args)?)?;
    print!("{}", plan.graph.to_dot());
    Ok(())
}

pub(crate) async fn policy(args: &ArgMatches) -> anyhow::Result<()> {
    let synth = synthesizer(args)?;
    let plan = synth.plan(definition(args)?)?;
    let deployment = synth
        .apply(&plan, Arc::new(Simulator::new()), Checkpoint::default())
        .await?;

    let documents: serde_json::Map<String, serde_json::Value> = deployment
        .policies
        .iter()
        .map(|doc| (doc.actor.to_string(), doc.to_json()))
        .collect();
    print_json(&serde_json::Value::Object(documents))
}

fn print_outputs(deployment: &Deployment) {
    let width = deployment
        .outputs
        .iter()
        .map(|o| o.name.len())
        .max()
        .unwrap_or(0);
    println!("Outputs:");
    for output in &deployment.outputs {
        println!("  {:<width$}  {}", output.name, output.value);
        if !output.description.is_empty() {
            println!("  {:<width$}  {}", "", output.description);
        }
    }
}

pub(crate) async fn apply(args: &ArgMatches) -> anyhow::Result<()> {
    let parallel = args.get_one::<usize>("parallel").copied().unwrap_or(1);
    let synth = synthesizer(args)?
        .with_options(ProvisionOptions::default().with_max_parallel(parallel));
    let plan = synth.plan(definition(args)?)?;

    let checkpoint_path = args.get_one::<PathBuf>("checkpoint");
    let checkpoint = match checkpoint_path {
        Some(path) => read_checkpoint(path)?,
        None => Checkpoint::default(),
    };

    let simulator = Arc::new(Simulator::new());
    let deployment = match synth.apply(&plan, simulator.clone(), checkpoint).await {
        Ok(deployment) => deployment,
        Err(StackError::Provision(failure)) => {
            if let Some(path) = checkpoint_path {
                write_checkpoint(path, &failure.checkpoint)?;
                tracing::warn!("Re-run apply with --checkpoint {} to resume", path.display());
            }
            return Err(StackError::Provision(failure).into());
        }
        Err(err) => return Err(err.into()),
    };

    if let Some(path) = checkpoint_path {
        write_checkpoint(path, &deployment.report.checkpoint())?;
    }

    let pipeline = if args.get_flag("run-pipeline") {
        synth
            .run_pipeline(&plan, &deployment, simulator.as_ref())
            .await?
    } else {
        None
    };

    if args.get_flag("json") {
        return print_json(&json!({
            "created": deployment.report.created,
            "skipped": deployment.report.skipped,
            "elapsed_ms": deployment.report.elapsed_ms,
            "outputs": deployment.output_map(),
            "pipeline": pipeline,
        }));
    }

    println!(
        "Provisioned {} resources ({} created, {} from checkpoint) in {} ms",
        deployment.report.provisioned.len(),
        deployment.report.created.len(),
        deployment.report.skipped.len(),
        deployment.report.elapsed_ms
    );
    print_outputs(&deployment);
    if let Some(summary) = pipeline {
        println!("Pipeline:");
        for (stage, produced) in &summary.artifacts {
            println!("  {stage}: {} at {}", produced.artifact, produced.location);
        }
    }
    Ok(())
}
