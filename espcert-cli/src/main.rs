//! espcert CLI - back up ESP32 flash and check device certificates.
//!
//! ## Features
//!
//! - Identify the chip and read its MAC over the serial bootloader
//! - MD5-verified flash reads and writes through the RAM stub
//! - Full-flash backup followed by a certificate check
//! - Offline certificate check of an existing dump
//! - Shell completion generation

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use env_logger::Env;
use espcert::{ChipKind, DetectOptions, FlashSize};
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod stub;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Whether progress bars and colors should be drawn.
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Failures with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation.
    #[error("{0}")]
    Usage(String),
    /// Interrupted by Ctrl-C.
    #[error("interrupted")]
    Cancelled,
    /// The dump was checked and certificates are absent or unreadable.
    #[error("{0}")]
    CertificatesMissing(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled => 130,
            Self::CertificatesMissing(_) => 3,
        }
    }
}

/// espcert - back up ESP32 flash over the serial bootloader and check that
/// it carries the device certificates.
///
/// Environment variables:
///   ESPCERT_PORT  - Default serial port
///   ESPCERT_BAUD  - Default baud rate (default: 115200)
///   ESPCERT_CHIP  - Expected chip (esp32, esp32s2, esp32s3, esp32c3)
#[derive(Parser)]
#[command(name = "espcert")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "ESPCERT_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, env = "ESPCERT_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Expected chip; the connection fails if another chip answers.
    #[arg(short, long, global = true, env = "ESPCERT_CHIP", value_parser = parse_chip)]
    pub(crate) chip: Option<ChipKind>,

    /// Flash size (1MB, 2MB, 4MB, 8MB, 16MB).
    #[arg(long, global = true, value_parser = parse_flash_size)]
    pub(crate) flash_size: Option<FlashSize>,

    /// Do not toggle DTR/RTS to enter the bootloader.
    #[arg(long, global = true)]
    pub(crate) no_reset: bool,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Connect, identify the chip and print its MAC address.
    Info {
        /// Also run the link reliability test.
        #[arg(long)]
        reliability: bool,
    },

    /// Read a flash region into a file.
    ReadFlash {
        /// Start address (decimal or 0x-prefixed hex).
        #[arg(value_parser = parse_int)]
        address: u32,

        /// Number of bytes to read.
        #[arg(value_parser = parse_int)]
        size: u32,

        /// Output file.
        #[arg(short, long)]
        output: PathBuf,

        /// Skip the device MD5 comparison.
        #[arg(long)]
        no_verify: bool,
    },

    /// Write a file to flash.
    WriteFlash {
        /// Start address (decimal or 0x-prefixed hex).
        #[arg(value_parser = parse_int)]
        address: u32,

        /// File to write.
        file: PathBuf,

        /// Skip the device MD5 comparison.
        #[arg(long)]
        no_verify: bool,

        /// Reboot into the application afterwards.
        #[arg(long)]
        reboot: bool,
    },

    /// Read the whole flash into a file and check it for certificates.
    Backup {
        /// Output file.
        #[arg(short, long)]
        output: PathBuf,

        /// Output the certificate report as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Check a flash dump for the certificate files.
    CheckCerts {
        /// Raw flash dump.
        dump: PathBuf,

        /// Output the report as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Label of the partition holding the certificates.
        #[arg(long)]
        label: Option<String>,

        /// Offset of the partition table.
        #[arg(long, value_parser = parse_int)]
        table_offset: Option<u32>,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (auto-detected with --install if not specified).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install completions into your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Parse a number: `0x`-prefixed hex or decimal, underscores allowed.
pub(crate) fn parse_int(s: &str) -> Result<u32, String> {
    let s: String = s.trim().chars().filter(|c| *c != '_').collect();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}

fn parse_chip(s: &str) -> Result<ChipKind, String> {
    s.parse::<ChipKind>().map_err(|e| e.to_string())
}

fn parse_flash_size(s: &str) -> Result<FlashSize, String> {
    FlashSize::from_name(s).ok_or_else(|| format!("unknown flash size '{s}'"))
}

/// Settings after merging the command line over the config files.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) port: Option<String>,
    pub(crate) baud: u32,
    pub(crate) chip: Option<ChipKind>,
    pub(crate) flash_size: FlashSize,
    pub(crate) no_reset: bool,
    pub(crate) quiet: bool,
    pub(crate) stub_dir: Option<PathBuf>,
    pub(crate) detect: DetectOptions,
}

impl Settings {
    fn resolve(cli: &Cli, config: &Config) -> Self {
        let mut detect = DetectOptions::default();
        if let Some(label) = &config.detect.label {
            detect.label.clone_from(label);
        }
        if let Some(offset) = config.detect.table_offset {
            detect.table_offset = offset;
        }

        Self {
            port: cli.port.clone().or_else(|| config.connection.serial.clone()),
            baud: cli.baud.or(config.connection.baud).unwrap_or(115_200),
            chip: cli.chip.or(config.flash.chip),
            flash_size: cli.flash_size.or(config.flash.size).unwrap_or_default(),
            no_reset: cli.no_reset || config.connection.no_reset,
            quiet: cli.quiet,
            stub_dir: config.stub_dir(),
            detect,
        }
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    init_logging(&cli);
    debug!(
        "espcert v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err.downcast_ref::<CliError>().map_or(1, CliError::exit_code);
            eprintln!("{} {err:#}", console::style("Error:").red().bold());
            ExitCode::from(code)
        },
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };
    let settings = Settings::resolve(cli, &config);

    match &cli.command {
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Info { reliability } => commands::device::cmd_info(&settings, *reliability).await,
        Commands::ReadFlash {
            address,
            size,
            output,
            no_verify,
        } => commands::device::cmd_read_flash(&settings, *address, *size, output, !*no_verify).await,
        Commands::WriteFlash {
            address,
            file,
            no_verify,
            reboot,
        } => {
            commands::device::cmd_write_flash(&settings, *address, file, !*no_verify, *reboot)
                .await
        },
        Commands::Backup { output, json } => {
            commands::device::cmd_backup(&settings, output, *json).await
        },
        Commands::CheckCerts {
            dump,
            json,
            label,
            table_offset,
        } => {
            let mut options = settings.detect.clone();
            if let Some(label) = label {
                options.label.clone_from(label);
            }
            if let Some(offset) = table_offset {
                options.table_offset = *offset as usize;
            }
            commands::certs::cmd_check_certs(dump, &options, *json, settings.quiet)
        },
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell, e.g. `espcert completions bash`, or use --install"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}
