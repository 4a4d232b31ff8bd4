//! Flowpilot - workflow copilot for creators.
//!
//! Describe a goal, review the AI-drafted plan, save it as a workflow and
//! run it step by step.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flowpilot::ai::AIManager;
use flowpilot::core::Config;
use flowpilot::store::open_stores;
use flowpilot::workflow::{
    render, Plan, PlanGenerator, RunExecutor, RunSnapshot, RunViewer, Workflow,
};
use flowpilot::{RunStore, WorkflowStore};

/// Workflow copilot for creators
#[derive(Parser)]
#[command(name = "flowpilot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Draft a plan for a goal without saving it
    Plan {
        /// What you want to achieve
        goal: String,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Draft a plan and save it as a workflow
    Create {
        /// What you want to achieve
        goal: String,

        /// Workflow name
        #[arg(short, long)]
        name: String,

        /// Save without asking for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// List saved workflows
    Workflows,

    /// Show a workflow and its steps
    Show {
        /// Workflow ID
        workflow_id: String,
    },

    /// Start a run of a workflow
    Run {
        /// Workflow ID
        workflow_id: String,

        /// Do not show live progress, only the final status
        #[arg(short, long)]
        detach: bool,
    },

    /// Follow an existing run until it finishes
    Watch {
        /// Run ID
        run_id: String,
    },

    /// List runs of a workflow
    Runs {
        /// Workflow ID
        workflow_id: String,
    },

    /// List emails sent by runs
    Emails,

    /// Show configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,

        /// Check which AI providers are reachable
        #[arg(long, conflicts_with = "path")]
        check: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Missing .env is fine
    let _ = dotenvy::dotenv();

    // Setup logging
    let filter = if cli.verbose { EnvFilter::new("debug") } else { EnvFilter::new("warn") };

    // Logs go to stderr so command output stays parseable
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Completions { shell } => {
            cmd_completions(shell);
            Ok(())
        }
        Commands::Config { path, check: false } => cmd_config(path),
        command => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(dispatch(command))
        }
    }
}

async fn dispatch(command: Commands) -> Result<()> {
    let services = Services::load()?;

    match command {
        Commands::Plan { goal, json } => cmd_plan(&services, &goal, json).await,
        Commands::Create { goal, name, yes } => cmd_create(&services, &goal, &name, yes).await,
        Commands::Workflows => cmd_workflows(&services).await,
        Commands::Show { workflow_id } => cmd_show(&services, &workflow_id).await,
        Commands::Run { workflow_id, detach } => cmd_run(&services, &workflow_id, detach).await,
        Commands::Watch { run_id } => cmd_watch(&services, &run_id).await,
        Commands::Runs { workflow_id } => cmd_runs(&services, &workflow_id).await,
        Commands::Emails => cmd_emails(&services).await,
        Commands::Config { check: true, .. } => cmd_config_check(&services).await,
        Commands::Config { .. } | Commands::Completions { .. } => Ok(()),
    }
}

/// Everything a command needs, built once from the configuration.
struct Services {
    config: Config,
    planner: PlanGenerator,
    workflows: WorkflowStore,
    runs: RunStore,
}

impl Services {
    fn load() -> Result<Self> {
        let config = Config::load()?;
        let ai = AIManager::from_config(&config.ai);
        let planner =
            PlanGenerator::new(Arc::new(ai)).with_demo_delay(config.executor.demo_delay());
        let (workflows, runs) = open_stores(&config)?;

        Ok(Self { config, planner, workflows, runs })
    }

    fn executor(&self) -> RunExecutor {
        RunExecutor::new(self.workflows.clone(), self.runs.clone(), self.planner.clone())
            .with_settings(self.config.executor.clone())
    }

    fn viewer(&self, run_id: &str) -> RunViewer {
        RunViewer::new(self.workflows.clone(), self.runs.clone(), run_id)
            .with_poll_interval(self.config.executor.poll_interval())
    }

    async fn workflow(&self, id: &str) -> Result<Workflow> {
        self.workflows
            .get_by_id(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Workflow not found: {id}"))
    }
}

/// Draft and print a plan.
async fn cmd_plan(services: &Services, goal: &str, json: bool) -> Result<()> {
    let plan = draft_plan(services, goal).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print_plan(&plan);
    }

    Ok(())
}

/// Draft a plan and save it after confirmation.
async fn cmd_create(services: &Services, goal: &str, name: &str, yes: bool) -> Result<()> {
    if name.trim().is_empty() {
        anyhow::bail!("Workflow name must not be empty");
    }

    let plan = draft_plan(services, goal).await?;
    print_plan(&plan);

    if !yes {
        print!("\nSave as workflow \"{}\"? [y/N] ", name.trim());
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Discarded.");
            return Ok(());
        }
    }

    let workflow = services.workflows.create(name, &plan).await?;
    println!("\nCreated workflow {} ({} steps)", workflow.id, workflow.steps.len());
    println!("Run it with: flowpilot run {}", workflow.id);

    Ok(())
}

async fn draft_plan(services: &Services, goal: &str) -> Result<Plan> {
    if services.planner.is_demo() {
        eprintln!("No AI provider configured - using the demo plan.");
    }
    eprintln!("Planning...");

    services.planner.generate_plan(goal).await.context("Failed to generate plan")
}

fn print_plan(plan: &Plan) {
    if !plan.summary.is_empty() {
        println!("{}\n", plan.summary);
    }

    for (i, step) in plan.steps.iter().enumerate() {
        println!("{:>2}. {} [{}]", i + 1, step.title, step.step_type);
        if !step.description.is_empty() {
            println!("    {}", step.description);
        }
    }
}

/// List saved workflows.
async fn cmd_workflows(services: &Services) -> Result<()> {
    let workflows = services.workflows.list_all().await?;

    if workflows.is_empty() {
        println!("No workflows yet. Create one with: flowpilot create <goal> --name <name>");
        return Ok(());
    }

    println!("{:<36}  {:<28}  {:>5}  CREATED", "ID", "NAME", "STEPS");
    for workflow in &workflows {
        println!(
            "{:<36}  {:<28}  {:>5}  {}",
            workflow.id,
            workflow.name,
            workflow.steps.len(),
            workflow.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}

/// Show one workflow.
async fn cmd_show(services: &Services, workflow_id: &str) -> Result<()> {
    let workflow = services.workflow(workflow_id).await?;

    println!("{}", workflow.name);
    println!("ID:      {}", workflow.id);
    println!("Status:  {:?}", workflow.status);
    println!("Created: {}", workflow.created_at.format("%Y-%m-%d %H:%M:%S"));
    if !workflow.description.is_empty() {
        println!("\n{}", workflow.description);
    }

    println!();
    for step in &workflow.steps {
        println!("{:>2}. {} [{}]", step.order + 1, step.title, step.step_type);
        if !step.description.is_empty() {
            println!("    {}", step.description);
        }
    }

    Ok(())
}

/// Start a run and follow it.
async fn cmd_run(services: &Services, workflow_id: &str, detach: bool) -> Result<()> {
    let workflow = services.workflow(workflow_id).await?;
    let handle = services.executor().start(&workflow.id).await?;
    let run_id = handle.run_id().to_string();
    eprintln!("Started run {run_id}");

    let status = if detach {
        tokio::select! {
            status = handle.join() => status?,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Interrupted; the run stays marked as running");
                return Ok(());
            }
        }
    } else {
        let canceller = handle.canceller();
        let mut viewer = services.viewer(&run_id);
        let follow = follow_run(&mut viewer);
        let join = handle.join();
        tokio::pin!(follow, join);

        tokio::select! {
            biased;
            result = &mut follow => {
                result?;
                join.await?
            }
            // The task can stop without the run ever becoming terminal
            status = &mut join => {
                let status = status?;
                follow.await?;
                status
            }
            _ = tokio::signal::ctrl_c() => {
                canceller.cancel();
                eprintln!("Cancelling...");
                join.await?
            }
        }
    };

    println!("Run {run_id} {status}");
    Ok(())
}

/// Follow an existing run.
async fn cmd_watch(services: &Services, run_id: &str) -> Result<()> {
    if services.runs.get_run_by_id(run_id).await?.is_none() {
        anyhow::bail!("Run not found: {run_id}");
    }

    let mut viewer = services.viewer(run_id);
    let last = follow_run(&mut viewer).await?;

    if let Some(run) = last.run() {
        println!("Run {} {}", run.id, run.status);
    }
    Ok(())
}

/// Print the rendered run every time it changes, until it is terminal.
async fn follow_run(viewer: &mut RunViewer) -> Result<RunSnapshot> {
    let mut last_render = String::new();
    let snapshot = viewer
        .follow(|snapshot| {
            let text = render(snapshot);
            if text != last_render {
                println!("{text}");
                last_render = text;
            }
        })
        .await?;
    Ok(snapshot)
}

/// List runs of a workflow.
async fn cmd_runs(services: &Services, workflow_id: &str) -> Result<()> {
    let workflow = services.workflow(workflow_id).await?;
    let runs = services.runs.list_runs(&workflow.id).await?;

    if runs.is_empty() {
        println!("No runs for {}.", workflow.name);
        return Ok(());
    }

    println!("{:<36}  {:<10}  {:>8}  STARTED", "ID", "STATUS", "STEPS");
    for run in &runs {
        let (done, total) = run.progress();
        println!(
            "{:<36}  {:<10}  {:>8}  {}",
            run.id,
            run.status,
            format!("{done}/{total}"),
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// List the sent email log.
async fn cmd_emails(services: &Services) -> Result<()> {
    let emails = services.runs.list_emails().await?;

    if emails.is_empty() {
        println!("No emails sent yet.");
        return Ok(());
    }

    for email in &emails {
        println!("{}  {}", email.sent_at.format("%Y-%m-%d %H:%M:%S"), email.recipient);
        println!("  Subject: {}", email.subject);
    }
    println!("\n{} email(s)", emails.len());

    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "flowpilot", &mut io::stdout());
}

/// Show configuration.
fn cmd_config(show_path: bool) -> Result<()> {
    if show_path {
        if let Some(path) = Config::config_path() {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let config = Config::load()?;
    let toml = toml::to_string_pretty(&config)?;
    println!("{toml}");

    Ok(())
}

/// Show the provider chain and whether each provider answers.
async fn cmd_config_check(services: &Services) -> Result<()> {
    let ai = AIManager::from_config(&services.config.ai);

    let Some(active) = ai.active_provider() else {
        println!("No AI provider configured - demo mode.");
        return Ok(());
    };
    println!("Active provider: {active}");

    for (name, available) in ai.provider_status().await {
        println!("  {:<8} {}", name, if available { "available" } else { "unreachable" });
    }

    Ok(())
}
