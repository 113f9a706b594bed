use crate::theme;
use anyhow::Result;
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use labctl::config::{ConfigLoader, EntryKind, RESERVED_ALL};
use labctl::supervisor::{
    launch_detached, Lockfile, Payload, ProcessSnapshot, Request, Response, StatusTarget,
    SupervisorClient,
};
use labctl::{clienv, LabError, ProfileKind, SupervisorSettings};
use std::path::Path;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) fn client() -> Result<(SupervisorClient, SupervisorSettings)> {
    let settings = SupervisorSettings::load()?;
    Ok((SupervisorClient::from_env(&settings), settings))
}

pub async fn cmd_up(force: bool) -> Result<()> {
    let (client, settings) = client()?;
    preflight(&client, &clienv::lockfile_path(), force).await?;

    // Catch a bad document here, where the operator sees the error.
    ConfigLoader::new()
        .strict(settings.strict_config)
        .load_file_or_default(&clienv::user_config_path())?;

    println!("{} Starting supervisor...", theme::icons::INFO);
    let launched = launch_detached(force)?;

    let deadline = Instant::now() + settings.request_timeout();
    while Instant::now() < deadline {
        if let Some((_uptime, version, pid)) = ping(&client).await {
            println!(
                "{} Supervisor started (v{}, PID {})",
                theme::icons::SUCCESS,
                version,
                pid
            );
            println!(
                "  Log: {}",
                theme::muted(clienv::supervisor_log_path().display())
            );
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    println!(
        "{} Supervisor (PID {}) did not answer; see {}",
        theme::icons::WARNING,
        launched,
        theme::muted(clienv::supervisor_log_path().display())
    );
    Err(LabError::TimedOut {
        operation: "up".into(),
        secs: settings.request_timeout().as_secs(),
    }
    .into())
}

pub async fn cmd_down() -> Result<()> {
    let (client, _settings) = client()?;

    if !client.is_running().await {
        println!("{} Supervisor is not running", theme::icons::INFO);
        return Ok(());
    }

    println!("{} Stopping supervisor...", theme::icons::INFO);
    client.call(&Request::Shutdown).await?;

    let lockfile = clienv::lockfile_path();
    for _ in 0..50 {
        if !lockfile.exists() {
            println!("{} Supervisor stopped", theme::icons::SUCCESS);
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    println!(
        "{} Supervisor may still be stopping (check with `lab status`)",
        theme::icons::WARNING
    );
    Ok(())
}

pub async fn cmd_start(kind: ProfileKind, name: &str) -> Result<()> {
    let (client, _settings) = client()?;
    println!(
        "{} Starting {} {}...",
        theme::icons::INFO,
        kind,
        theme::bold(name)
    );
    let response = client
        .call(&Request::Start {
            kind,
            name: name.to_string(),
        })
        .await?;
    report(&response);
    Ok(())
}

pub async fn cmd_stop(kind: ProfileKind, name: &str) -> Result<()> {
    let (client, _settings) = client()?;
    println!(
        "{} Stopping {} {}...",
        theme::icons::INFO,
        kind,
        theme::bold(name)
    );
    let response = client
        .call(&Request::Stop {
            kind,
            name: name.to_string(),
        })
        .await?;
    report(&response);
    Ok(())
}

pub async fn cmd_status(target: Option<&str>, name: Option<&str>) -> Result<()> {
    let target = status_target(target, name)?;
    let (client, _settings) = client()?;

    let response = client.call(&Request::Status { target }).await?;
    let Payload::Records(records) = response.payload else {
        return Err(LabError::Internal("status response carried no records".into()).into());
    };

    if records.is_empty() {
        println!("{} No profiles configured", theme::icons::INFO);
        return Ok(());
    }

    println!("{}", status_table(&records));

    for record in &records {
        if let Some(error) = &record.last_error {
            let icon = if record.crash_looped {
                theme::icons::ERROR
            } else {
                theme::icons::WARNING
            };
            println!(
                "{} {} {}: {}",
                icon,
                record.kind,
                theme::bold(&record.name),
                error
            );
        }
    }
    Ok(())
}

pub async fn cmd_reload() -> Result<()> {
    let (client, _settings) = client()?;
    println!("{} Reloading configuration...", theme::icons::INFO);

    let response = client.call(&Request::Reload).await?;
    if let Payload::Reload(report) = &response.payload {
        for profile in &report.stopped {
            println!("  {} stopped    {}", theme::icons::INFO, profile);
        }
        for profile in &report.restarted {
            println!("  {} restarted  {}", theme::icons::INFO, profile);
        }
        if !report.unchanged.is_empty() {
            println!(
                "  {}",
                theme::muted(format!("{} profile(s) unchanged", report.unchanged.len()))
            );
        }
    }
    report(&response);
    Ok(())
}

pub async fn cmd_rename(kind: EntryKind, old: &str, new: &str) -> Result<()> {
    let (client, _settings) = client()?;
    let (old, new) = (old.to_string(), new.to_string());
    let request = match kind.profile() {
        Some(kind) => Request::Rename { kind, old, new },
        None => Request::RenameService { old, new },
    };
    let response = client.call(&request).await?;
    report(&response);
    Ok(())
}

/// Refuse a second `up`. A supervisor that answers is never taken over;
/// `--force` only overrides a lockfile whose holder does not answer.
async fn preflight(client: &SupervisorClient, lockfile: &Path, force: bool) -> Result<()> {
    if let Some((uptime, version, pid)) = ping(client).await {
        println!(
            "{} Supervisor already running (v{}, PID {}, uptime: {})",
            theme::icons::INFO,
            version,
            pid,
            format_duration(uptime)
        );
        return Err(LabError::AlreadyRunning { pid: Some(pid) }.into());
    }

    if !force {
        if let Some(holder) = Lockfile::holder(lockfile) {
            return Err(LabError::AlreadyRunning {
                pid: Some(holder.pid),
            }
            .into());
        }
    }
    Ok(())
}

async fn ping(client: &SupervisorClient) -> Option<(u64, String, u32)> {
    match client.call(&Request::Ping).await.ok()?.payload {
        Payload::Pong {
            uptime_secs,
            version,
            pid,
        } => Some((uptime_secs, version, pid)),
        _ => None,
    }
}

fn report(response: &Response) {
    for warning in &response.warnings {
        println!("{} {}", theme::icons::WARNING, theme::warning(warning));
    }
    println!("{} {}", theme::icons::SUCCESS, response.message);
}

fn status_target(target: Option<&str>, name: Option<&str>) -> Result<StatusTarget> {
    match (target, name) {
        (None, None) => Ok(StatusTarget::All),
        (Some(all), None) if all.eq_ignore_ascii_case(RESERVED_ALL) => Ok(StatusTarget::All),
        (Some(kind), Some(name)) => {
            let kind = kind.parse::<ProfileKind>().map_err(LabError::InvalidArgument)?;
            Ok(StatusTarget::One {
                kind,
                name: name.to_string(),
            })
        }
        (Some(kind), None) => Err(LabError::InvalidArgument(format!(
            "`status {kind}` needs a profile name"
        ))
        .into()),
        (None, Some(_)) => Err(LabError::InvalidArgument("missing profile kind".into()).into()),
    }
}

fn status_table(records: &[ProcessSnapshot]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        "kind", "name", "state", "pid", "started", "uptime", "restarts", "flags",
    ]);

    for record in records {
        let pid = record
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let started = record
            .started_at_ms
            .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
            .map(|at| {
                at.with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_else(|| "-".to_string());
        let uptime = record
            .uptime_secs
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            record.kind.to_string(),
            record.name.clone(),
            record.state.as_str().to_string(),
            pid,
            started,
            uptime,
            record.restarts.to_string(),
            flags(record),
        ]);
    }
    table
}

fn flags(record: &ProcessSnapshot) -> String {
    let mut flags = Vec::new();
    if record.crash_looped {
        flags.push("crash_loop");
    }
    if record.adopted {
        flags.push("adopted");
    }
    flags.join(",")
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labctl::supervisor::ProcessState;

    #[test]
    fn status_target_forms() {
        assert_eq!(status_target(None, None).unwrap(), StatusTarget::All);
        assert_eq!(status_target(Some("ALL"), None).unwrap(), StatusTarget::All);
        assert_eq!(
            status_target(Some("daemon"), Some("lockable")).unwrap(),
            StatusTarget::One {
                kind: ProfileKind::Daemon,
                name: "lockable".into()
            }
        );
        assert!(status_target(Some("daemon"), None).is_err());
        assert!(status_target(Some("robot"), Some("x")).is_err());
    }

    #[test]
    fn durations_are_compact() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(7260), "2h 1m");
        assert_eq!(format_duration(90_000), "1d 1h");
    }

    #[test]
    fn table_shows_flags_and_placeholders() {
        let mut looped = ProcessSnapshot::stopped(ProfileKind::Daemon, "lockable");
        looped.crash_looped = true;
        looped.restarts = 5;
        let mut running = ProcessSnapshot::stopped(ProfileKind::Nameserver, "default");
        running.state = ProcessState::Running;
        running.pid = Some(4242);
        running.adopted = true;

        let rendered = status_table(&[running, looped]).to_string();
        assert!(rendered.contains("crash_loop"));
        assert!(rendered.contains("adopted"));
        assert!(rendered.contains("4242"));
        assert!(rendered.contains("stopped"));
    }

    #[cfg(unix)]
    struct SleepLauncher;

    #[cfg(unix)]
    impl labctl::supervisor::Launcher for SleepLauncher {
        fn command(&self, _kind: ProfileKind, _name: &str, _config: &Path) -> tokio::process::Command {
            let mut cmd = tokio::process::Command::new("sleep");
            cmd.arg("30");
            cmd
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_up_is_refused_and_leaves_records_alone() {
        use labctl::supervisor::{ProcessPaths, Supervisor, SupervisorOptions};
        use labctl::ErrorKind;
        use std::sync::Arc;
        use tokio_util::sync::CancellationToken;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(
            root.join("config.yaml"),
            "version: 1\nautolaunch:\n  nameservers: [default]\n",
        )
        .unwrap();
        let options = SupervisorOptions {
            socket_path: root.join("supervisor.sock"),
            lockfile_path: root.join("supervisor.lock"),
            user_config_path: root.join("config.yaml"),
            paths: ProcessPaths::under(root),
            settings: SupervisorSettings {
                stop_grace_secs: 2,
                ..Default::default()
            },
            force: false,
        };
        let lockfile = options.lockfile_path.clone();
        let client = SupervisorClient::new(&options.socket_path, Duration::from_secs(10));

        let supervisor = Supervisor::start(options, Arc::new(SleepLauncher), CancellationToken::new())
            .await
            .unwrap();
        let served = tokio::spawn(supervisor.serve());
        for _ in 0..50 {
            if client.is_running().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let status = Request::Status {
            target: StatusTarget::All,
        };
        let before = client.call(&status).await.unwrap().payload;

        for force in [false, true] {
            let err = preflight(&client, &lockfile, force).await.unwrap_err();
            let lab = err.downcast_ref::<LabError>().unwrap();
            assert_eq!(lab.kind(), ErrorKind::AlreadyRunning);
            assert!(matches!(lab, LabError::AlreadyRunning { pid: Some(pid) } if *pid == std::process::id()));
        }

        let after = client.call(&status).await.unwrap().payload;
        match (before, after) {
            (Payload::Records(before), Payload::Records(after)) => {
                assert_eq!(before.len(), after.len());
                for (b, a) in before.iter().zip(&after) {
                    assert_eq!((b.state, b.pid, b.restarts), (a.state, a.pid, a.restarts));
                }
            }
            other => panic!("unexpected payloads: {other:?}"),
        }

        client.call(&Request::Shutdown).await.unwrap();
        served.await.unwrap().unwrap();
        assert!(!lockfile.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lockfile_without_answering_supervisor_needs_force() {
        let dir = tempfile::tempdir().unwrap();
        let lockfile = dir.path().join("supervisor.lock");
        let client = SupervisorClient::new(&dir.path().join("absent.sock"), Duration::from_secs(1));

        let mut holder = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(
            &lockfile,
            serde_json::json!({
                "pid": holder.id(),
                "started_at": "2026-01-01T00:00:00Z",
                "socket": "/nowhere"
            })
            .to_string(),
        )
        .unwrap();

        let err = preflight(&client, &lockfile, false).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LabError>(),
            Some(LabError::AlreadyRunning { pid: Some(_) })
        ));
        preflight(&client, &lockfile, true).await.unwrap();

        holder.kill().unwrap();
        holder.wait().unwrap();
    }
}
