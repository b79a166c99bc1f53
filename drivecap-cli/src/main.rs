mod cli;
mod commands;
mod home;

use clap::Parser;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let home_dir = cli.global.home_dir();
    let _log_guard = match drivecap::init_logging(
        Some(&home_dir.join(home::LOG_DIR)),
        cli.global.log_filter(),
    ) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Init(args) => commands::init::execute(args, &cli.global).await,
        Commands::Zero(args) => commands::zero::execute(args, &cli.global).await,
        Commands::Scrub(args) => commands::scrub::execute(args, &cli.global).await,
        Commands::VerifyInvalidate(args) => {
            commands::verify_invalidate::execute(args, &cli.global).await
        }
        Commands::Run(args) => commands::run::execute(args, &cli.global).await,
        Commands::Status(args) => commands::status::execute(args, &cli.global).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
