//! Commands that talk to a device.

use anyhow::{Context, Result, bail};
use console::style;
use espcert::{
    ChipKind, LogSink, NativePort, SerialConfig, Session, SessionConfig, auto_detect_port, detect,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use std::fs;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use crate::commands::certs;
use crate::stub::resolve_stub;
use crate::{CliError, Settings, use_fancy_output};

fn progress_bar(quiet: bool, len: u64, unit_bytes: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let template = if unit_bytes {
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}"
    } else {
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}"
    };
    let pb = ProgressBar::new(len);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template(template)
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Open the port, reset the chip into its bootloader and start a session.
fn open_session(settings: &Settings) -> Result<Session> {
    let port_name = match &settings.port {
        Some(port) => port.clone(),
        None => {
            auto_detect_port()
                .context("No serial port found; pass --port")?
                .name
        },
    };
    if !settings.quiet {
        eprintln!(
            "{} Using {} at {} baud",
            style("🔌").cyan(),
            style(&port_name).cyan(),
            settings.baud
        );
    }

    let mut port = NativePort::open(&SerialConfig::new(&port_name, settings.baud))
        .with_context(|| format!("Failed to open {port_name}"))?;
    if !settings.no_reset {
        port.reset_into_bootloader()?;
    }

    let config = SessionConfig {
        baud_rate: settings.baud,
        flash_size: settings.flash_size,
        ..SessionConfig::default()
    };
    Ok(Session::open(port, config, Arc::new(LogSink))?)
}

/// Synchronize and report the chip; returns the chip to load a stub for.
async fn identify(session: &Session, settings: &Settings) -> Result<ChipKind> {
    if !settings.quiet {
        eprintln!("{} Waiting for the bootloader...", style("⏳").yellow());
    }
    let detected = session.sync().await?;

    match (settings.chip, detected) {
        (Some(expected), _) => session.expect_chip(expected)?,
        (None, None) => bail!("Unknown chip; pass --chip to select a stub"),
        (None, Some(_)) => {},
    }
    let chip = detected.or(settings.chip).context("Chip not identified")?;

    if !settings.quiet {
        eprintln!("{} Connected to {}", style("✓").green(), style(chip).bold());
    }
    Ok(chip)
}

/// Upload the stub for `chip` and configure the flash.
async fn start_stub(session: &Session, settings: &Settings, chip: ChipKind) -> Result<()> {
    let stub = resolve_stub(settings.stub_dir.as_deref(), chip)?;
    session.download_stub(&stub).await?;
    if !settings.quiet {
        eprintln!(
            "{} Stub running, flash configured as {}",
            style("✓").green(),
            settings.flash_size
        );
    }
    Ok(())
}

/// Run `op` until it finishes or Ctrl-C arrives, then close the session.
async fn with_session<T>(
    session: &Session,
    op: impl Future<Output = Result<T>>,
) -> Result<T> {
    let result = tokio::select! {
        result = op => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, closing the port");
            Err(CliError::Cancelled.into())
        },
    };
    session.disconnect().await;
    result
}

/// Info command implementation.
pub(crate) async fn cmd_info(settings: &Settings, reliability: bool) -> Result<()> {
    let session = open_session(settings)?;
    with_session(&session, async {
        let chip = identify(&session, settings).await?;
        let mac = session.read_mac().await?;

        println!("Chip: {chip}");
        match mac {
            Some(mac) => println!("MAC:  {mac}"),
            None => println!("MAC:  (not programmed)"),
        }

        if reliability {
            let pb = progress_bar(settings.quiet, 100, false);
            pb.set_message("Testing link");
            let reads = session
                .test_reliability(|fraction| pb.set_position((fraction * 100.0) as u64))
                .await?;
            pb.finish_and_clear();
            println!("Link: ok ({reads} register reads)");
        }
        Ok(())
    })
    .await
}

/// Read-flash command implementation.
pub(crate) async fn cmd_read_flash(
    settings: &Settings,
    address: u32,
    size: u32,
    output: &Path,
    verify: bool,
) -> Result<()> {
    let session = open_session(settings)?;
    let data = with_session(&session, async {
        let chip = identify(&session, settings).await?;
        start_stub(&session, settings, chip).await?;

        let pb = progress_bar(settings.quiet, u64::from(size), true);
        let progress = |done: usize, _total: usize| pb.set_position(done as u64);
        let data = if verify {
            session.read_flash(address, size, progress).await?
        } else {
            session.read_flash_plain(address, size, progress).await?
        };
        pb.finish_and_clear();
        Ok(data)
    })
    .await?;

    fs::write(output, &data).with_context(|| format!("Failed to write {}", output.display()))?;
    if !settings.quiet {
        eprintln!(
            "{} Read {} bytes at 0x{address:08X} into {}",
            style("✓").green().bold(),
            data.len(),
            output.display()
        );
    }
    Ok(())
}

/// Write-flash command implementation.
pub(crate) async fn cmd_write_flash(
    settings: &Settings,
    address: u32,
    file: &Path,
    verify: bool,
    reboot: bool,
) -> Result<()> {
    let data = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    if data.is_empty() {
        return Err(CliError::Usage(format!("{} is empty", file.display())).into());
    }

    let session = open_session(settings)?;
    with_session(&session, async {
        let chip = identify(&session, settings).await?;
        start_stub(&session, settings, chip).await?;

        let pb = progress_bar(settings.quiet, data.len() as u64, true);
        let progress = |done: usize, _total: usize| pb.set_position(done as u64);
        if verify {
            let outcome = session.write_flash(address, &data, progress).await?;
            pb.finish_and_clear();
            if !settings.quiet {
                eprintln!(
                    "{} Wrote {} bytes at 0x{:08X} (md5 {})",
                    style("✓").green().bold(),
                    outcome.length,
                    outcome.address,
                    outcome.digest
                );
            }
        } else {
            session.write_flash_plain(address, &data, progress).await?;
            pb.finish_and_clear();
            if !settings.quiet {
                eprintln!(
                    "{} Wrote {} bytes at 0x{address:08X} (unverified)",
                    style("✓").green().bold(),
                    data.len()
                );
            }
        }

        session.flash_finish(reboot).await?;
        Ok(())
    })
    .await
}

/// Backup command implementation: full verified read, then the detector.
pub(crate) async fn cmd_backup(settings: &Settings, output: &Path, json: bool) -> Result<()> {
    let size = settings.flash_size.bytes();
    let session = open_session(settings)?;
    let data = with_session(&session, async {
        let chip = identify(&session, settings).await?;
        start_stub(&session, settings, chip).await?;

        let pb = progress_bar(settings.quiet, u64::from(size), true);
        pb.set_message("Reading flash");
        let data = session
            .read_flash(0, size, |done, _| pb.set_position(done as u64))
            .await?;
        pb.finish_and_clear();
        Ok(data)
    })
    .await?;

    fs::write(output, &data).with_context(|| format!("Failed to write {}", output.display()))?;
    if !settings.quiet {
        eprintln!(
            "{} Saved {} bytes to {}",
            style("✓").green().bold(),
            data.len(),
            output.display()
        );
    }

    let outcome = detect(&data, &settings.detect, &LogSink);
    certs::conclude(&outcome, json, settings.quiet)
}
