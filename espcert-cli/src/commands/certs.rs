//! Certificate check of flash dumps.

use anyhow::{Context, Result};
use console::style;
use espcert::fs::{CERTIFICATE_DIR, CertificateReport};
use espcert::{DetectOptions, LogSink, RecognitionFailure, detect};
use std::fs;
use std::path::Path;

use crate::CliError;

/// JSON form of a detector outcome.
pub(crate) fn report_json(outcome: &Result<CertificateReport, RecognitionFailure>) -> serde_json::Value {
    match outcome {
        Ok(report) => serde_json::json!({
            "ok": report.ok,
            "data": {
                "partition": {
                    "label": report.partition.label,
                    "offset": report.partition.offset,
                    "size": report.partition.size,
                },
                "wear_leveled": report.wear_leveled,
                "cert_directory": report.cert_directory,
                "files": report.files.iter().map(|f| serde_json::json!({
                    "name": f.name,
                    "present": f.present,
                    "size": f.size,
                })).collect::<Vec<_>>(),
                "missing": report.missing(),
            }
        }),
        Err(reason) => serde_json::json!({
            "ok": false,
            "error": reason.to_string(),
        }),
    }
}

fn print_report(report: &CertificateReport) {
    eprintln!(
        "{} Partition '{}' at 0x{:X} ({} bytes){}",
        style("ℹ").blue(),
        report.partition.label,
        report.partition.offset,
        report.partition.size,
        if report.wear_leveled {
            ", wear leveled"
        } else {
            ""
        }
    );

    if !report.cert_directory {
        eprintln!(
            "  {} {CERTIFICATE_DIR}/ directory not found",
            style("✗").red()
        );
        return;
    }

    for file in &report.files {
        match file.size {
            Some(size) if file.present => eprintln!(
                "  {} {CERTIFICATE_DIR}/{} ({size} bytes)",
                style("✓").green(),
                file.name
            ),
            _ => eprintln!(
                "  {} {CERTIFICATE_DIR}/{} missing",
                style("✗").red(),
                file.name
            ),
        }
    }
}

/// Report an outcome and turn "not ok" into [`CliError::CertificatesMissing`].
pub(crate) fn conclude(
    outcome: &Result<CertificateReport, RecognitionFailure>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&report_json(outcome))?);
    } else if !quiet {
        if let Ok(report) = outcome {
            print_report(report);
        }
    }

    match outcome {
        Ok(report) if report.ok => {
            if !json && !quiet {
                eprintln!("{} All certificates present", style("✓").green().bold());
            }
            Ok(())
        },
        Ok(report) if !report.cert_directory => Err(CliError::CertificatesMissing(format!(
            "no {CERTIFICATE_DIR} directory in partition '{}'",
            report.partition.label
        ))
        .into()),
        Ok(report) => Err(CliError::CertificatesMissing(format!(
            "missing certificates: {}",
            report.missing().join(", ")
        ))
        .into()),
        Err(reason) => Err(CliError::CertificatesMissing(format!(
            "dump not recognized: {reason}"
        ))
        .into()),
    }
}

/// Check-certs command implementation.
pub(crate) fn cmd_check_certs(
    dump: &Path,
    options: &DetectOptions,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let flash =
        fs::read(dump).with_context(|| format!("Failed to read dump {}", dump.display()))?;
    let outcome = detect(&flash, options, &LogSink);
    conclude(&outcome, json, quiet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_json_failure() {
        let outcome = Err(RecognitionFailure::PartitionNotFound {
            label: "assets".to_string(),
            count: 2,
        });
        let value = report_json(&outcome);
        assert_eq!(value["ok"], false);
        assert!(value["error"].as_str().unwrap().contains("assets"));
    }

    #[test]
    fn test_conclude_failure_exit_code() {
        let outcome = Err(RecognitionFailure::TableOutOfRange {
            offset: 0x9000,
            len: 16,
        });
        let err = conclude(&outcome, false, true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::CertificatesMissing(_))
        ));
    }

    #[test]
    fn test_check_certs_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = cmd_check_certs(
            &dir.path().join("missing.bin"),
            &DetectOptions::default(),
            false,
            true,
        )
        .unwrap_err();
        assert!(err.downcast_ref::<CliError>().is_none());
    }
}
