//! Operational CLI over the Runtime API boundary (§6): intercept a sample
//! action, verify the audit chain, reload policies, export learner
//! suggestions, or inspect an agent's rate-limit stats.

#![deny(unsafe_code)]

use clap::{Parser, Subcommand};
use mediator_core::model::{ActionRequest, ActionType};
use mediator_runtime::{MediatorConfig, Runtime};
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mediator-cli", about = "Operate a runtime security mediator instance")]
struct Cli {
    /// Path to a `MediatorConfig` YAML file; defaults are used if omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build an `ActionRequest` from flags, intercept it, and print the
    /// resulting `Decision` as JSON.
    Intercept {
        #[arg(long)]
        agent_id: String,
        #[arg(long, value_enum)]
        action_type: CliActionType,
        #[arg(long)]
        target: String,
        /// JSON object of action parameters, e.g. `{"url":"https://x"}`.
        #[arg(long, default_value = "{}")]
        parameters: String,
        #[arg(long, default_value = "")]
        declared_goal: String,
    },
    /// Reload the policy set from `policy_file_path`.
    ReloadPolicies,
    /// Verify the audit log's hash chain; exits non-zero if broken.
    VerifyChain,
    /// Export learned policy suggestions above `min_confidence` as YAML.
    ExportSuggestions {
        #[arg(long, default_value_t = 0.5)]
        min_confidence: f64,
        #[arg(long)]
        out: PathBuf,
    },
    /// Print rate-limit statistics for one agent.
    AgentStats {
        #[arg(long)]
        agent_id: String,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CliActionType {
    ToolCall,
    ApiCall,
    NetworkRequest,
    DatabaseQuery,
    FileRead,
    FileWrite,
    MemoryRead,
    MemoryWrite,
}

impl From<CliActionType> for ActionType {
    fn from(v: CliActionType) -> Self {
        match v {
            CliActionType::ToolCall => ActionType::ToolCall,
            CliActionType::ApiCall => ActionType::ApiCall,
            CliActionType::NetworkRequest => ActionType::NetworkRequest,
            CliActionType::DatabaseQuery => ActionType::DatabaseQuery,
            CliActionType::FileRead => ActionType::FileRead,
            CliActionType::FileWrite => ActionType::FileWrite,
            CliActionType::MemoryRead => ActionType::MemoryRead,
            CliActionType::MemoryWrite => ActionType::MemoryWrite,
        }
    }
}

fn load_runtime(config_path: Option<&PathBuf>) -> Result<Runtime, Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(p) => MediatorConfig::load_from_yaml_path(p)?,
        None => MediatorConfig::default(),
    };
    Ok(Runtime::new(config)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_json_logging();
    let cli = Cli::parse();
    let runtime = load_runtime(cli.config.as_ref())?;

    match cli.cmd {
        Command::Intercept { agent_id, action_type, target, parameters, declared_goal } => {
            cmd_intercept(&runtime, agent_id, action_type.into(), target, &parameters, declared_goal)?
        }
        Command::ReloadPolicies => cmd_reload_policies(&runtime)?,
        Command::VerifyChain => cmd_verify_chain(&runtime)?,
        Command::ExportSuggestions { min_confidence, out } => {
            cmd_export_suggestions(&runtime, min_confidence, &out)?
        }
        Command::AgentStats { agent_id } => cmd_agent_stats(&runtime, &agent_id)?,
    }
    Ok(())
}

fn cmd_intercept(
    runtime: &Runtime,
    agent_id: String,
    action_type: ActionType,
    target: String,
    parameters_json: &str,
    declared_goal: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let parameters: std::collections::BTreeMap<String, Value> = serde_json::from_str(parameters_json)?;
    let action = ActionRequest::new(agent_id, action_type, target)
        .with_parameters(parameters)
        .with_declared_goal(declared_goal);
    let decision = runtime.intercept(action);
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

fn cmd_reload_policies(runtime: &Runtime) -> Result<(), Box<dyn std::error::Error>> {
    runtime.reload_policies()?;
    println!("{}", serde_json::to_string_pretty(&json!({"reloaded": true}))?);
    Ok(())
}

fn cmd_verify_chain(runtime: &Runtime) -> Result<(), Box<dyn std::error::Error>> {
    let ok = runtime.verify_audit_chain();
    println!("{}", serde_json::to_string_pretty(&json!({"chain_valid": ok}))?);
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_export_suggestions(
    runtime: &Runtime,
    min_confidence: f64,
    out: &std::path::Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let count = runtime.export_learner_suggestions(out, min_confidence)?;
    println!("{}", serde_json::to_string_pretty(&json!({"exported": count, "min_confidence": min_confidence, "path": out}))?);
    Ok(())
}

fn cmd_agent_stats(runtime: &Runtime, agent_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    match runtime.agent_rate_stats(agent_id) {
        Some(stats) => println!("{}", serde_json::to_string_pretty(&stats)?),
        None => println!("{}", serde_json::to_string_pretty(&json!({"agent_id": agent_id, "known": false}))?),
    }
    Ok(())
}
