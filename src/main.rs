use clap::Parser;
use journald_cloudwatch::cli::run::RunError;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "journald-cloudwatch")]
#[command(about = "Ship the systemd journal to CloudWatch Logs", long_about = None)]
struct Cli {
    /// Config file (same as --config)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: Option<PathBuf>,

    #[arg(long, conflicts_with = "config_file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "journald_cloudwatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match journald_cloudwatch::cli::run::run(cli.config.or(cli.config_file)).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e @ RunError::ConfigNotFound) => {
            error!("{e}");
            error!("Use --config <path> to specify a config file");
            ExitCode::from(1)
        }
        Err(e) => {
            error!(error = %e, "Run failed");
            ExitCode::from(2)
        }
    }
}
