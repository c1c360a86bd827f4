//! `conductor` command line: inspect and run plan files against simulated agents.

mod plan_file;
mod simulator;

use clap::{Parser, Subcommand};
use conductor_orchestrator::{
    ExecutionPlan, Orchestrator, OrchestratorConfig, PlanOptions, PlanReport,
};
use plan_file::PlanFile;
use simulator::SimulatedExecutor;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "conductor.toml";

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: multi-agent task orchestration")]
struct Cli {
    /// Path to config file (defaults to ./conductor.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs and reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show parallel groups and critical path of a plan file
    Plan {
        /// Plan file (TOML)
        file: PathBuf,
    },
    /// Execute a plan file against simulated agents
    Run {
        /// Plan file (TOML)
        file: PathBuf,
        /// Milliseconds of simulated work per second of estimated duration
        #[arg(long, default_value_t = 10)]
        time_scale_ms: u64,
    },
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

fn load_config(path: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    match path {
        Some(path) => Ok(OrchestratorConfig::load(path)?),
        None if Path::new(DEFAULT_CONFIG).exists() => Ok(OrchestratorConfig::load(DEFAULT_CONFIG)?),
        None => Ok(OrchestratorConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.json);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Plan { file } => {
            let plan_file = PlanFile::load(&file)?;
            let plan = ExecutionPlan::build(
                plan_file.name.clone(),
                plan_file.task_specs(),
                config.engine.default_max_retries,
                config.engine.default_timeout(),
            )?;
            print_plan(&plan, cli.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            file,
            time_scale_ms,
        } => {
            let plan_file = PlanFile::load(&file)?;
            let executor = Arc::new(SimulatedExecutor::new(
                Duration::from_millis(time_scale_ms),
                plan_file.failing_ids(),
            ));
            let orchestrator = Orchestrator::new(config, executor)?;
            for metadata in plan_file.agent_metadata() {
                orchestrator.register_agent(metadata).await?;
            }
            info!(
                plan = %plan_file.name,
                agents = plan_file.agents.len(),
                tasks = plan_file.tasks.len(),
                "Running plan"
            );

            let report = orchestrator
                .run_plan(plan_file.name.clone(), plan_file.task_specs(), PlanOptions::new())
                .await?;
            print_report(&report, cli.json)?;
            if report.succeeded() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

fn print_plan(plan: &ExecutionPlan, json: bool) -> anyhow::Result<()> {
    if json {
        let summary = serde_json::json!({
            "name": plan.name,
            "parallel_groups": plan.parallel_groups,
            "critical_path": plan.critical_path,
            "estimated_duration": plan.estimated_duration,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Plan: {}", plan.name);
    println!("Parallel groups:");
    for (index, group) in plan.parallel_groups.iter().enumerate() {
        println!("  {}: {}", index + 1, group.join(", "));
    }
    println!("Critical path: {}", plan.critical_path.join(" -> "));
    println!("Estimated duration: {}s", plan.estimated_duration);
    Ok(())
}

fn print_report(report: &PlanReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Plan '{}' finished: {:?}", report.name, report.status);
    println!("  completed: {}", report.completed.join(", "));
    if !report.failed.is_empty() {
        println!("  failed:    {}", report.failed.join(", "));
    }
    if !report.skipped.is_empty() {
        println!("  skipped:   {}", report.skipped.join(", "));
    }
    for id in &report.failed {
        if let Some(error) = report.errors.get(id) {
            println!("  {id}: {error}");
        }
    }
    println!("  elapsed:   {}ms", report.elapsed_ms);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_defaults_time_scale() {
        let cli = Cli::try_parse_from(["conductor", "run", "plan.toml"]).unwrap();
        match cli.command {
            Commands::Run { time_scale_ms, .. } => assert_eq!(time_scale_ms, 10),
            Commands::Plan { .. } => panic!("expected run"),
        }
        assert!(!cli.json);
    }

    #[test]
    fn test_global_json_flag() {
        let cli = Cli::try_parse_from(["conductor", "plan", "p.toml", "--json"]).unwrap();
        assert!(cli.json);
        assert!(cli.config.is_none());
    }

    #[tokio::test]
    async fn test_simulated_run_reports_failure() {
        let plan_file = PlanFile::parse(
            r#"
            name = "demo"
            [[agents]]
            id = "docs"
            capabilities = ["docs"]
            [[tasks]]
            id = "a"
            name = "a"
            required_capabilities = ["docs"]
            estimated_duration = 1
            [[tasks]]
            id = "b"
            name = "b"
            required_capabilities = ["docs"]
            dependencies = ["a"]
            estimated_duration = 1
            fail = true
            "#,
        )
        .unwrap();

        let mut config = OrchestratorConfig::default();
        config.engine.retry_delay_ms = 1;
        let executor = Arc::new(SimulatedExecutor::new(Duration::from_millis(1), plan_file.failing_ids()));
        let orchestrator = Orchestrator::new(config, executor).unwrap();
        for metadata in plan_file.agent_metadata() {
            orchestrator.register_agent(metadata).await.unwrap();
        }
        let report = orchestrator
            .run_plan("demo", plan_file.task_specs(), PlanOptions::new().with_max_retries(1))
            .await
            .unwrap();
        assert!(!report.succeeded());
        assert_eq!(report.completed, vec!["a"]);
        assert_eq!(report.failed, vec!["b"]);
    }
}
