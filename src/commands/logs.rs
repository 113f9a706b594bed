use crate::args::LogsCommands;
use crate::commands::supervisor::client;
use crate::theme;
use anyhow::{Context, Result};
use labctl::supervisor::{log_files, Payload, Request};
use labctl::{clienv, LabError, ProfileKind};
use std::path::Path;

pub(crate) async fn cmd_logs(
    command: Option<LogsCommands>,
    kind: Option<ProfileKind>,
    name: Option<&str>,
    lines: u32,
) -> Result<()> {
    match (command, kind, name) {
        (Some(LogsCommands::Clean), _, _) => cmd_logs_clean(&clienv::logs_dir()),
        (Some(LogsCommands::Export { file }), _, _) => cmd_logs_export(&clienv::logs_dir(), &file),
        (None, Some(kind), Some(name)) => cmd_logs_tail(kind, name, lines).await,
        (None, _, _) => Err(LabError::InvalidArgument(
            "usage: `lab logs <kind> <name>`, `lab logs clean` or `lab logs export <file>`".into(),
        )
        .into()),
    }
}

async fn cmd_logs_tail(kind: ProfileKind, name: &str, lines: u32) -> Result<()> {
    let (client, _settings) = client()?;
    let response = client
        .call(&Request::Logs {
            kind,
            name: name.to_string(),
            lines,
        })
        .await?;

    match response.payload {
        Payload::Logs(lines) if !lines.is_empty() => {
            for line in lines {
                println!("{line}");
            }
        }
        _ => println!(
            "{} No output captured for {} {}",
            theme::icons::INFO,
            kind,
            theme::bold(name)
        ),
    }
    Ok(())
}

fn cmd_logs_clean(dir: &Path) -> Result<()> {
    let removed = log_files::clean(dir)
        .with_context(|| format!("Failed to clean {}", dir.display()))?;
    println!(
        "{} Removed {} log file(s) from {}",
        theme::icons::SUCCESS,
        removed,
        theme::muted(dir.display())
    );
    Ok(())
}

fn cmd_logs_export(dir: &Path, dest: &Path) -> Result<()> {
    let lines = log_files::export(dir, dest)
        .with_context(|| format!("Failed to export logs to {}", dest.display()))?;
    println!(
        "{} Exported {} line(s) to {}",
        theme::icons::SUCCESS,
        lines,
        theme::bold(dest.display())
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use labctl::ErrorKind;

    #[tokio::test]
    async fn kind_without_name_is_rejected() {
        let err = cmd_logs(None, Some(ProfileKind::Daemon), None, 10)
            .await
            .unwrap_err();
        let lab = err.downcast_ref::<LabError>().unwrap();
        assert_eq!(lab.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn export_then_clean() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(
            logs.join("daemon-lockable.log"),
            "2026-03-01T10:00:01Z [1:7] ready\n",
        )
        .unwrap();

        let dest = dir.path().join("combined.txt");
        cmd_logs_export(&logs, &dest).unwrap();
        assert!(std::fs::read_to_string(&dest)
            .unwrap()
            .contains("daemon-lockable | 2026-03-01T10:00:01Z [1:7] ready"));

        cmd_logs_clean(&logs).unwrap();
        assert!(!logs.join("daemon-lockable.log").exists());
        assert!(dest.exists());
    }
}
