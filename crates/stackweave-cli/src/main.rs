//! stackweave command line

mod commands;

use clap::{value_parser, Arg, ArgAction, Command};
use stackweave_core::catalog;
use stackweave_core::StackError;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Arguments shared by every subcommand: what to synthesize and where
fn stack_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("stack")
                .long("stack")
                .default_value(catalog::AI_ML)
                .conflicts_with("file")
                .help("Built-in stack to synthesize"),
        )
        .arg(
            Arg::new("file")
                .long("file")
                .short('f')
                .value_parser(value_parser!(PathBuf))
                .help("Stack definition file (.yaml, .yml or .json)"),
        )
        .arg(
            Arg::new("context")
                .long("context")
                .value_parser(value_parser!(PathBuf))
                .help("Deployment context TOML file"),
        )
        .arg(
            Arg::new("stack-name")
                .long("stack-name")
                .help("Logical stack name, used as prefix for physical names"),
        )
        .arg(
            Arg::new("account")
                .long("account")
                .env("STACKWEAVE_ACCOUNT")
                .help("Target account"),
        )
        .arg(
            Arg::new("region")
                .long("region")
                .env("STACKWEAVE_REGION")
                .help("Target region"),
        )
        .arg(
            Arg::new("environment")
                .long("environment")
                .help("Environment label (dev, staging, prod)"),
        )
        .arg(
            Arg::new("repository")
                .long("repository")
                .env("GITHUB_REPOSITORY")
                .default_value(catalog::DEFAULT_REPOSITORY)
                .help("Source repository of the built-in pipeline and deploy role"),
        )
        .arg(
            Arg::new("warn-wildcards")
                .long("warn-wildcards")
                .action(ArgAction::SetTrue)
                .help("Flag wildcard grants instead of rejecting them"),
        )
}

fn cli() -> Command {
    Command::new("stackweave")
        .version(stackweave_core::VERSION)
        .about("Declarative cloud-resource provisioning")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Debug logging"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(stack_args(
            Command::new("plan").about("Validate a stack and show what apply would do").arg(
                Arg::new("json")
                    .long("json")
                    .action(ArgAction::SetTrue)
                    .help("Output as JSON"),
            ),
        ))
        .subcommand(stack_args(
            Command::new("apply")
                .about("Provision a stack against the simulator and export its outputs")
                .arg(
                    Arg::new("checkpoint")
                        .long("checkpoint")
                        .value_parser(value_parser!(PathBuf))
                        .help("Checkpoint file to resume from and write back"),
                )
                .arg(
                    Arg::new("parallel")
                        .long("parallel")
                        .default_value("1")
                        .value_parser(value_parser!(usize))
                        .help("Maximum concurrent creations per wave"),
                )
                .arg(
                    Arg::new("run-pipeline")
                        .long("run-pipeline")
                        .action(ArgAction::SetTrue)
                        .help("Run the stack's pipeline after provisioning"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        ))
        .subcommand(stack_args(
            Command::new("graph").about("Print the dependency graph in DOT format"),
        ))
        .subcommand(stack_args(
            Command::new("policy").about("Print bound policy documents as IAM JSON"),
        ))
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("verbose"), matches.get_flag("log-json"));

    let result = match matches.subcommand() {
        Some(("plan", args)) => commands::plan(args),
        Some(("apply", args)) => commands::apply(args).await,
        Some(("graph", args)) => commands::graph(args),
        Some(("policy", args)) => commands::policy(args).await,
        _ => Ok(()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(stack) = err.downcast_ref::<StackError>() {
                eprintln!("error[{}]: {stack}", stack.class().as_str());
                ExitCode::from(stack.exit_code())
            } else {
                eprintln!("error: {err:#}");
                ExitCode::FAILURE
            }
        }
    }
}
