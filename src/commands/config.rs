use crate::args::ConfigCommands;
use crate::theme;
use anyhow::{Context, Result};
use dialoguer::{theme::ColorfulTheme, Confirm};
use labctl::config::{ConfigLoader, EntryKind, RenderView};
use labctl::{clienv, LabConfig, SupervisorSettings};
use std::path::Path;

pub(crate) fn cmd_config(command: ConfigCommands) -> Result<()> {
    let user_path = clienv::user_config_path();
    match command {
        ConfigCommands::Show { diff } => {
            let view = if diff { RenderView::Diff } else { RenderView::Merged };
            print!("{}", render_user_config(&user_path, view)?);
            Ok(())
        }
        ConfigCommands::Check { file, strict } => {
            let config = ConfigLoader::new().strict(strict).load_file(&file)?;
            println!(
                "{} {} is valid ({})",
                theme::icons::SUCCESS,
                theme::bold(file.display()),
                summary(&config)
            );
            Ok(())
        }
        ConfigCommands::Update { file } => {
            let strict = SupervisorSettings::load()?.strict_config;
            let config = install(&file, &user_path, strict)?;
            println!(
                "{} Installed {} as {} ({})",
                theme::icons::SUCCESS,
                file.display(),
                theme::muted(user_path.display()),
                summary(&config)
            );
            println!(
                "  {}",
                theme::muted("Run `lab reload` to apply it to a running supervisor")
            );
            Ok(())
        }
        ConfigCommands::Export { file } => {
            export(&user_path, &file)?;
            println!(
                "{} Exported configuration to {}",
                theme::icons::SUCCESS,
                theme::bold(file.display())
            );
            Ok(())
        }
        ConfigCommands::Reset { yes } => cmd_config_reset(&user_path, yes),
    }
}

pub(crate) fn cmd_info(kind: EntryKind, name: &str) -> Result<()> {
    let entry = describe(
        &clienv::runtime_config_path(),
        &clienv::user_config_path(),
        kind,
        name,
    )?;
    print!("{entry}");
    Ok(())
}

/// Render one entry from the committed snapshot when a supervisor has
/// written one, otherwise from the user configuration.
fn describe(runtime_path: &Path, user_path: &Path, kind: EntryKind, name: &str) -> Result<String> {
    let source = if runtime_path.exists() {
        runtime_path
    } else {
        user_path
    };
    let config = ConfigLoader::new().load_file_or_default(source)?;
    Ok(config.render_entry(kind, name)?)
}

fn cmd_config_reset(user_path: &Path, yes: bool) -> Result<()> {
    if !user_path.exists() {
        println!("{} No user configuration to reset", theme::icons::INFO);
        return Ok(());
    }

    if !yes {
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "Delete {} and fall back to the built-in profiles?",
                user_path.display()
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            println!("{} Reset cancelled", theme::icons::INFO);
            return Ok(());
        }
    }

    std::fs::remove_file(user_path)
        .with_context(|| format!("Failed to remove {}", user_path.display()))?;
    println!("{} Configuration reset", theme::icons::SUCCESS);
    Ok(())
}

fn render_user_config(path: &Path, view: RenderView) -> Result<String> {
    let config = ConfigLoader::new().load_file_or_default(path)?;
    Ok(config.render(view)?)
}

/// Validate `source` whole, then copy it over the user configuration.
fn install(source: &Path, dest: &Path, strict: bool) -> Result<LabConfig> {
    let config = ConfigLoader::new().strict(strict).load_file(source)?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::copy(source, dest)
        .with_context(|| format!("Failed to install {}", dest.display()))?;
    Ok(config)
}

fn export(user_path: &Path, dest: &Path) -> Result<()> {
    let config = ConfigLoader::new().load_file_or_default(user_path)?;
    config.save(dest, RenderView::Diff)?;
    Ok(())
}

fn summary(config: &LabConfig) -> String {
    format!(
        "{} nameserver(s), {} daemon(s), {} service(s)",
        config.nameservers.len(),
        config.daemons.len(),
        config.services.len()
    )
}
