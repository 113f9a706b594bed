mod args;
mod commands;
mod init;
mod theme;

use args::{Cli, Commands};
use clap::Parser;
use labctl::{ErrorKind, LabError};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let level = match cli.command {
        Commands::Supervisor { .. } | Commands::RunNameserver { .. } | Commands::RunDaemon { .. } => {
            init::SERVICE_LOG_LEVEL
        }
        _ => init::CLI_LOG_LEVEL,
    };
    init::initialize_tracing(level);

    let result = match cli.command {
        Commands::Up { force } => commands::supervisor::cmd_up(force).await,
        Commands::Down => commands::supervisor::cmd_down().await,
        Commands::Start { kind, name } => commands::supervisor::cmd_start(kind, &name).await,
        Commands::Stop { kind, name } => commands::supervisor::cmd_stop(kind, &name).await,
        Commands::Status { target, name } => {
            commands::supervisor::cmd_status(target.as_deref(), name.as_deref()).await
        }
        Commands::Reload => commands::supervisor::cmd_reload().await,
        Commands::Rename { kind, old, new } => {
            commands::supervisor::cmd_rename(kind, &old, &new).await
        }
        Commands::Info { kind, name } => commands::config::cmd_info(kind, &name),
        Commands::Logs {
            command,
            kind,
            name,
            lines,
        } => commands::logs::cmd_logs(command, kind, name.as_deref(), lines).await,
        Commands::Config { command } => commands::config::cmd_config(command),
        Commands::Supervisor { force } => commands::internal::cmd_supervisor(force).await,
        Commands::RunNameserver { name, config } => {
            commands::internal::cmd_run_nameserver(&name, &config).await
        }
        Commands::RunDaemon { name, config } => {
            commands::internal::cmd_run_daemon(&name, &config).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {}", theme::icons::ERROR, theme::error(format!("{err:#}")));
            if lab_error(&err).map(LabError::kind) == Some(ErrorKind::TimedOut) {
                eprintln!("  {}", theme::muted("Check `lab status` for the outcome"));
            }
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Categorized exit code for a failed command.
fn exit_code(err: &anyhow::Error) -> u8 {
    lab_error(err).map(|lab| lab.kind().exit_code()).unwrap_or(1)
}

fn lab_error(err: &anyhow::Error) -> Option<&LabError> {
    err.chain().find_map(|cause| cause.downcast_ref::<LabError>())
}
