use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "parchive")]
#[command(about = "Parameter archive backfiller", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backfiller and its admin API (default)
    Run,
    /// Rebuild one time range and exit
    Fill {
        /// RFC 3339 start, rounded down to a bucket boundary
        #[arg(long)]
        start: String,
        /// RFC 3339 stop, rounded up to a bucket boundary
        #[arg(long)]
        stop: String,
    },
    /// Show the calendar partition holding an instant
    Partition {
        instant: String,
        /// YYYY, YYYY/MM or YYYY/DOY
        #[arg(long)]
        schema: Option<String>,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parchive=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = parchive::config::resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run) | None => {
            parchive::cli::run::run(config_path).await?;
        }
        Some(Commands::Fill { start, stop }) => {
            parchive::cli::fill::fill(config_path, &start, &stop).await?;
        }
        Some(Commands::Partition { instant, schema }) => {
            parchive::cli::partition::show(config_path, &instant, schema.as_deref())?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                parchive::cli::config::init(stdout)?;
            }
            ConfigAction::Validate => {
                parchive::cli::config::validate(config_path)?;
            }
        },
    }

    Ok(())
}
