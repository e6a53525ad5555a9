//! BFD Pipeline - Main entry point

use anyhow::Result;
use bfd_common::logging::{init_logging, LogConfig};
use bfd_pipeline::{
    app::{self, EXIT_CODE_BAD_CONFIG},
    rda::ClaimType,
};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "bfd-pipeline")]
#[command(about = "Loads CCW and RDA claims data into the BFD database", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run every configured job until SIGINT/SIGTERM (default)
    Run,

    /// Run the RDA job for one claim type once and exit
    DirectRdaLoad {
        /// Claim type to load (fiss or mcs)
        #[arg(long, value_parser = parse_claim_type)]
        claim_type: ClaimType,
    },
}

fn parse_claim_type(value: &str) -> std::result::Result<ClaimType, String> {
    value.parse::<ClaimType>().map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .log_file_prefix("bfd-pipeline")
        .filter_directives("bfd_pipeline=info,bfd_common=info,sqlx=warn,aws_config=warn")
        .build()
        .merge_env();
    let log_config = match log_config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid logging configuration: {:#}", e);
            return ExitCode::from(EXIT_CODE_BAD_CONFIG);
        },
    };
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::from(EXIT_CODE_BAD_CONFIG);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting BFD Pipeline");

    match run(cli.command.unwrap_or(Command::Run)).await {
        Ok(()) => {
            info!("BFD Pipeline exited cleanly");
            ExitCode::SUCCESS
        },
        Err(e) => {
            let code = app::exit_code_for(&e);
            error!(exit_code = code, "BFD Pipeline terminated: {:#}", e);
            ExitCode::from(code)
        },
    }
}

async fn run(command: Command) -> Result<()> {
    let config = app::load_config()?;
    info!(
        ccw_enabled = config.ccw.is_some(),
        rda_enabled = config.rda.is_some(),
        "Configuration loaded"
    );

    let pool = app::connect_database(&config.database).await?;

    match command {
        Command::Run => {
            let jobs = app::build_jobs(&config, &pool).await?;
            app::run_jobs(config.scheduler.clone(), jobs, app::shutdown_signal()).await
        },
        Command::DirectRdaLoad { claim_type } => {
            let outcome = app::direct_rda_load(&config, &pool, claim_type).await?;
            info!(%claim_type, %outcome, "Direct RDA load finished");
            Ok(())
        },
    }
}
