//! Cadence CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;
use tracing::debug;

mod commands;
mod handlers;
mod output;
mod workspace;

use cadence_scheduler::SchedulerConfig;
use commands::{Commands, OutputFormat};
use workspace::Workspace;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about = "Cadence scheduling core command-line interface", long_about = None)]
struct Cli {
    /// Workspace file with pipelines, history and known commits
    #[arg(short, long, global = true, default_value = "cadence.yaml")]
    workspace: PathBuf,

    /// Scheduler configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => SchedulerConfig::from_file(path)?,
        None => SchedulerConfig::default(),
    };
    cadence_trace::init_logging(&settings.logging)?;

    if let Commands::Schema = cli.command {
        return handlers::schema();
    }

    let workspace = Workspace::load(&cli.workspace)?;
    debug!(
        workspace = %cli.workspace.display(),
        pipelines = workspace.pipelines.len(),
        history = workspace.history.len(),
        "Workspace loaded"
    );
    let session = workspace.clone().into_session(settings).await;

    match cli.command {
        Commands::Resolve { pipeline } => handlers::resolve(&session, &pipeline, cli.output).await?,
        Commands::Schedule {
            pipeline,
            user,
            revisions,
            env,
        } => {
            handlers::schedule(&workspace, &session, &pipeline, &user, &revisions, &env, cli.output).await?
        }
        Commands::Vsm {
            pipeline,
            counter,
            user,
        } => handlers::vsm(&session, &pipeline, counter, &user, cli.output).await?,
        Commands::Schema => handlers::schema()?,
    }

    Ok(())
}
