mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use commands::{plan::PlanArgs, run::RunArgs, validate::ValidateArgs};

/// Run workflow definitions locally
#[derive(Parser, Debug)]
#[command(name = "gantry", version, about)]
struct Cli {
    /// Increase diagnostic logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deliver an event to a workflow and execute the resulting run
    Run(RunArgs),
    /// Parse a workflow and resolve its local actions without running it
    Validate(ValidateArgs),
    /// Show the trigger decision, concurrency key and job instances for an event
    Plan(PlanArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let ok = match cli.command {
        Command::Run(args) => commands::run::execute(args).await?,
        Command::Validate(args) => commands::validate::execute(args).await?,
        Command::Plan(args) => commands::plan::execute(args)?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = std::env::var("GANTRY_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
