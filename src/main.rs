use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use logward::storage::model::LogFormat;

#[derive(Parser)]
#[command(name = "logward")]
#[command(about = "Log ingestion and analytics backend", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and worker pool.
    Run,
    /// Parse a single access-log file and print its summary.
    Parse {
        file: PathBuf,
        #[arg(long, default_value = "nginx_combined")]
        format: LogFormat,
        #[arg(long, default_value_t = 10)]
        top_n: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logward=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config);

    match cli.command {
        Some(Commands::Run) | None => {
            logward::cli::run::run(config_path).await?;
        }
        Some(Commands::Parse {
            file,
            format,
            top_n,
        }) => {
            logward::cli::parse::parse_file(&file, format, top_n)?;
        }
    }

    Ok(())
}

fn resolve_config_path(explicit_path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path);
    }

    // Check ~/.config/logward/config.yml
    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/logward/config.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    // Check /etc/logward/config.yml
    let system_config = PathBuf::from("/etc/logward/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}
