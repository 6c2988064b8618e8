mod app;
mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gitcloud")]
#[command(about = "Provision cloud infrastructure for a repository, resumably", long_about = None)]
struct Cli {
    /// Home directory for config and sessions (default ~/.gitcloud)
    #[arg(long, global = true, env = "GITCLOUD_HOME")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the resources for a resource requirement
    Provision {
        /// Resource requirement (JSON); a single default compute service when omitted
        #[arg(long, value_name = "FILE")]
        spec: Option<PathBuf>,
        /// Region to provision in, overriding the requirement and config
        #[arg(long)]
        region: Option<String>,
    },
    /// Continue a partially provisioned session
    Resume {
        /// Session id (session_YYYYMMDD_HHMMSS)
        session: String,
    },
    /// Delete every resource of a session, newest first
    Teardown {
        /// Session id (session_YYYYMMDD_HHMMSS)
        session: String,
    },
    /// List known sessions
    Sessions {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one session with its ledger and outputs
    Status {
        /// Session id (session_YYYYMMDD_HHMMSS)
        session: String,
        /// Print the session record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the configuration, or change the default region
    Config {
        /// Save this region as the default in config.json
        #[arg(long)]
        region: Option<String>,
    },
    /// Show version information
    Version,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,aws_config=warn,aws_smithy_runtime=warn,aws_smithy_runtime_api=warn")
    });
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Version needs no home directory
    if matches!(cli.command, Commands::Version) {
        println!("gitcloud {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init_logging();
    let app = app::App::load(cli.home)?;

    match cli.command {
        Commands::Provision { spec, region } => {
            commands::provision::handle(&app, spec.as_deref(), region).await?;
        }
        Commands::Resume { session } => {
            commands::provision::resume(&app, &session).await?;
        }
        Commands::Teardown { session } => {
            commands::teardown::handle(&app, &session).await?;
        }
        Commands::Sessions { json } => {
            commands::sessions::list(&app, json).await?;
        }
        Commands::Status { session, json } => {
            commands::sessions::status(&app, &session, json).await?;
        }
        Commands::Config { region } => {
            commands::config::handle(&app, region)?;
        }
        Commands::Version => {
            unreachable!("Version is handled before loading the home directory");
        }
    }

    Ok(())
}
