//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::{Cli, CliError};

fn render(shell: Shell, out: &mut dyn io::Write) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, out);
}

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    render(shell, &mut io::stdout());
}

/// Shell named by a `$SHELL`-style path.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    match Path::new(shell_path).file_name()?.to_str()? {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// Where completions for `shell` are picked up automatically.
fn install_path(shell: Shell, dirs: &BaseDirs) -> Option<PathBuf> {
    match shell {
        Shell::Bash => Some(
            dirs.data_dir()
                .join("bash-completion/completions/espcert"),
        ),
        Shell::Zsh => Some(dirs.home_dir().join(".zfunc/_espcert")),
        Shell::Fish => Some(dirs.config_dir().join("fish/completions/espcert.fish")),
        Shell::Elvish => Some(dirs.config_dir().join("elvish/lib/espcert.elv")),
        _ => None,
    }
}

/// Install shell completions.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(shell) => shell,
        None => env::var("SHELL")
            .ok()
            .as_deref()
            .and_then(shell_from_path)
            .ok_or_else(|| {
                CliError::Usage(
                    "could not detect your shell; run e.g. `espcert completions --install bash`"
                        .to_string(),
                )
            })?,
    };

    let dirs = BaseDirs::new().context("Could not determine the home directory")?;
    let path = install_path(shell, &dirs).ok_or_else(|| {
        CliError::Usage(format!(
            "automatic install is not supported for {shell}; redirect `espcert completions {shell}` instead"
        ))
    })?;

    let mut script = Vec::new();
    render(shell, &mut script);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &script)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {shell} completions to {}",
        style("✓").green().bold(),
        style(path.display()).yellow()
    );
    if shell == Shell::Zsh {
        eprintln!(
            "Add {} to ~/.zshrc before compinit if it is not there yet.",
            style("fpath=(~/.zfunc $fpath)").cyan()
        );
    }
    Ok(())
}
