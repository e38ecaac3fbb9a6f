use anyhow::Result;
use clap::Parser;
use secret_warden::commands::{audit::handle_audit, monitor::handle_monitor, run::handle_run};
use secret_warden::commands::{Cli, Commands};
use secret_warden::config::GuardConfig;
use secret_warden::error::WardenError;
use secret_warden::utils::logger::init_logger;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logger(cli.log_level.as_deref(), cli.log_file.clone()) {
        eprintln!("Failed to initialize logging: {}", err);
        return ExitCode::from(1);
    }

    match main_impl(cli).await {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<WardenError>() {
                Some(warden) => eprintln!("{}", warden.user_message()),
                None => eprintln!("{:#}", err),
            }
            ExitCode::from(1)
        }
    }
}

async fn main_impl(cli: Cli) -> Result<ExitCode> {
    let config = GuardConfig::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Run(args) => handle_run(config, args).await,
        Commands::Monitor(args) => handle_monitor(config, args).await,
        Commands::Audit { action } => handle_audit(&config, action),
    }
}
