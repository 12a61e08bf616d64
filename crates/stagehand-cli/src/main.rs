//! `stagehand`: run blueprints and capabilities against simulated capabilities
//!
//! Prints the tool-surface envelope of each call as JSON on stdout; logs go
//! to stderr.

mod simulation;

use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde_json::Value;
use simulation::Simulation;
use stagehand_capability::{ExecutionContext, FileSecretStore, SecretRef};
use stagehand_saga::{
    BlueprintRegistry, InMemorySubstrate, Orchestrator, OrchestratorConfig, ToolSurface,
    CONFIG_ENV,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("stagehand")
        .version(stagehand_saga::VERSION)
        .about("Saga orchestration over sandboxed capabilities")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file (falls back to $STAGEHAND_CONFIG)"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("run")
                .about("Call a capability or start a blueprint by id")
                .arg(Arg::new("id").required(true).help("Capability or blueprint id"))
                .arg(
                    Arg::new("input")
                        .long("input")
                        .default_value("{}")
                        .help("JSON arguments, or @path to a JSON file"),
                )
                .arg(Arg::new("app").long("app").default_value("demo"))
                .arg(Arg::new("env").long("env").default_value("staging"))
                .arg(Arg::new("initiator").long("initiator").default_value("cli"))
                .arg(
                    Arg::new("secret")
                        .long("secret")
                        .action(ArgAction::Append)
                        .help("Secret reference as name=path; repeatable"),
                )
                .arg(
                    Arg::new("breach-at")
                        .long("breach-at")
                        .value_parser(value_parser!(u8))
                        .help("Simulated canary metrics breach from this percentage on"),
                )
                .arg(
                    Arg::new("drain-after")
                        .long("drain-after")
                        .default_value("0")
                        .value_parser(value_parser!(u32))
                        .help("Simulated polls before the previous build drains"),
                ),
        )
        .subcommand(
            Command::new("tools")
                .about("List capabilities and blueprints")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON, including input schemas"),
                ),
        )
        .subcommand(Command::new("config").about("Print the effective configuration"))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(explicit: Option<&PathBuf>) -> anyhow::Result<OrchestratorConfig> {
    let path = explicit
        .cloned()
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
    let config = match path {
        Some(path) => OrchestratorConfig::load(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn parse_secret(spec: &str) -> anyhow::Result<(String, SecretRef)> {
    match spec.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), SecretRef::new(path)))
        }
        _ => bail!("secret `{spec}` is not name=path"),
    }
}

fn parse_input(raw: &str) -> anyhow::Result<Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("input is not valid JSON")
}

fn surface(config: OrchestratorConfig, simulation: Simulation) -> anyhow::Result<ToolSurface> {
    let registry = simulation::registry(simulation)?;
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(registry),
        Arc::new(InMemorySubstrate::new()),
        Arc::new(FileSecretStore),
    );
    Ok(ToolSurface::new(orchestrator, BlueprintRegistry::with_defaults()))
}

async fn run(config: OrchestratorConfig, args: &ArgMatches) -> anyhow::Result<bool> {
    let id = args
        .get_one::<String>("id")
        .context("missing capability or blueprint id")?;
    let input = parse_input(args.get_one::<String>("input").map_or("{}", String::as_str))?;

    let mut context = ExecutionContext::new(
        args.get_one::<String>("app").map_or("demo", String::as_str),
        args.get_one::<String>("env").map_or("staging", String::as_str),
        args.get_one::<String>("initiator").map_or("cli", String::as_str),
    );
    for spec in args.get_many::<String>("secret").into_iter().flatten() {
        let (name, reference) = parse_secret(spec)?;
        context = context.with_secret_ref(name, reference);
    }

    let simulation = Simulation {
        breach_at: args.get_one::<u8>("breach-at").copied(),
        drain_after_polls: args.get_one::<u32>("drain-after").copied().unwrap_or(0),
    };
    let envelope = surface(config, simulation)?.call(id, input, context).await;
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(envelope.is_ok())
}

fn tools(config: OrchestratorConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let tools = surface(config, Simulation::default())?.tools();
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&tools)?);
    } else {
        for tool in tools {
            println!("{:<12} {}", format!("{:?}", tool.kind).to_lowercase(), tool.id);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));
    let config = load_config(matches.get_one::<PathBuf>("config"))?;

    match matches.subcommand() {
        Some(("run", args)) => {
            let ok = run(config, args).await?;
            std::process::exit(if ok { 0 } else { 1 });
        }
        Some(("tools", args)) => tools(config, args),
        Some(("config", _)) => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        _ => Ok(()),
    }
}
