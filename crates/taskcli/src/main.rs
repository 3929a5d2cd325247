// crates/taskcli/src/main.rs

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use taskcore::{HumanTask, Status, WorkItemId};
use taskruntime::{ManagementConfig, RunRecord, RunStore, Script};

#[derive(Parser)]
#[command(name = "taskctl")]
#[command(about = "Inspect human tasks and manage process scripts", long_about = None)]
struct Cli {
    /// Server data directory
    #[arg(short, long, global = true, default_value = "data")]
    data_dir: PathBuf,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List persisted runs
    Runs,

    /// List human tasks
    Tasks {
        /// Only tasks of this job
        #[arg(short, long)]
        job: Option<String>,

        /// Only tasks in this status
        #[arg(short, long, value_enum)]
        status: Option<StatusFilter>,
    },

    /// Show one human task by work item id
    Show {
        work_item_id: WorkItemId,
    },

    /// Manage registered process scripts
    Scripts {
        #[command(subcommand)]
        command: ScriptCommands,
    },
}

#[derive(Subcommand)]
enum ScriptCommands {
    /// List registered scripts
    List,

    /// Register (or replace) a script
    Add {
        id: String,

        /// Path or URL of the process definition
        #[arg(short, long)]
        source: String,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// Unregister a script
    Remove {
        id: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusFilter {
    New,
    Completed,
    Canceled,
}

impl StatusFilter {
    fn matches(self, status: Status) -> bool {
        matches!(
            (self, status),
            (StatusFilter::New, Status::New)
                | (StatusFilter::Completed, Status::Completed)
                | (StatusFilter::Canceled, Status::Canceled)
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::Runs => list_runs(&cli.data_dir).await?,
        Commands::Tasks { job, status } => list_tasks(&cli.data_dir, job.as_deref(), status).await?,
        Commands::Show { work_item_id } => show_task(&cli.data_dir, work_item_id).await?,
        Commands::Scripts { command } => manage_scripts(&cli.data_dir, command)?,
    }

    Ok(())
}

async fn load_runs(data_dir: &Path) -> Result<Vec<RunRecord>> {
    Ok(RunStore::new(data_dir).load_all().await?)
}

async fn list_runs(data_dir: &Path) -> Result<()> {
    let runs = load_runs(data_dir).await?;
    if runs.is_empty() {
        println!("No runs in {}", data_dir.display());
        return Ok(());
    }
    for run in runs {
        let open = run.tasks.iter().filter(|t| t.is_new()).count();
        println!("{:<30} {:>3} tasks ({} open)", run.id.to_string(), run.tasks.len(), open);
    }
    Ok(())
}

fn select<'a>(
    runs: &'a [RunRecord],
    job: Option<&'a str>,
    status: Option<StatusFilter>,
) -> impl Iterator<Item = &'a HumanTask> + 'a {
    runs.iter()
        .filter(move |run| job.map_or(true, |j| run.id.job == j))
        // most recent runs first
        .rev()
        .flat_map(|run| run.tasks.iter())
        .filter(move |task| status.map_or(true, |s| s.matches(task.status())))
}

async fn list_tasks(data_dir: &Path, job: Option<&str>, status: Option<StatusFilter>) -> Result<()> {
    let runs = load_runs(data_dir).await?;
    for task in select(&runs, job, status) {
        println!(
            "{:>8}  {:<10} {:<20} {}",
            task.work_item_id(),
            task.status().to_string(),
            task.run().to_string(),
            task.display_name()
        );
    }
    Ok(())
}

async fn show_task(data_dir: &Path, work_item_id: WorkItemId) -> Result<()> {
    let runs = load_runs(data_dir).await?;
    let Some(task) = select(&runs, None, None).find(|t| t.work_item_id() == work_item_id) else {
        bail!("No human task for work item {}", work_item_id);
    };

    println!("📋 {}", task);
    println!("   Run:     {}", task.run());
    println!("   Status:  {}", task.status());
    println!("   Actor:   {}", task.actor_id().unwrap_or("(anyone with build permission)"));
    println!("   Private: {}", task.is_private());
    println!("   URL:     {}", task.url());
    if let Some(answers) = task.answers() {
        println!("   Answers:");
        for answer in answers {
            println!("     {}", answer);
        }
    }
    Ok(())
}

fn manage_scripts(data_dir: &Path, command: ScriptCommands) -> Result<()> {
    let mut config = ManagementConfig::load(ManagementConfig::config_path(data_dir))?;

    match command {
        ScriptCommands::List => {
            for script in config.list() {
                println!(
                    "{:<20} {:<40} {}",
                    script.id,
                    script.source,
                    script.description.as_deref().unwrap_or("")
                );
            }
        }
        ScriptCommands::Add {
            id,
            source,
            description,
        } => {
            let mut script = Script::new(id.clone(), source);
            if let Some(description) = description {
                script = script.with_description(description);
            }
            let mut scripts: Vec<Script> = config
                .list()
                .iter()
                .filter(|s| s.id != id)
                .cloned()
                .collect();
            scripts.push(script);
            config.replace_all(scripts)?;
            config.save()?;
            println!("✅ Registered script {}", id);
        }
        ScriptCommands::Remove { id } => {
            if config.find(&id).is_none() {
                bail!("No script registered as {}", id);
            }
            let scripts = config.list().iter().filter(|s| s.id != id).cloned().collect();
            config.replace_all(scripts)?;
            config.save()?;
            println!("🗑️  Removed script {}", id);
        }
    }

    Ok(())
}
