//! `lscan verify`: re-check a finished run.

use std::io::Write;
use std::path::Path;

use ledgerscan_io::verify_report_file;

use crate::exit_codes::EXIT_VERIFY_FAILED;
use crate::CliError;

pub fn cmd_verify(file: &Path, strict: bool, json: bool, quiet: bool) -> Result<(), CliError> {
    let verification = verify_report_file(file, strict)?;

    if json {
        let out = serde_json::json!({
            "run_id": verification.run_id,
            "strict": strict,
            "passed": verification.passed(),
            "checks": verification.checks,
        });
        let text = serde_json::to_string_pretty(&out).map_err(|e| CliError::io(e.to_string()))?;
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        writeln!(handle, "{text}").map_err(|e| CliError::io(e.to_string()))?;
    } else if !quiet {
        for check in &verification.checks {
            let tag = if check.passed { "ok  " } else { "FAIL" };
            eprintln!("{tag} {:<18} {}", check.name, check.detail);
        }
    }

    if verification.passed() {
        return Ok(());
    }
    let failed: Vec<&str> = verification.failures().map(|c| c.name).collect();
    Err(CliError::new(
        EXIT_VERIFY_FAILED,
        format!("run {} failed verification: {}", verification.run_id, failed.join(", ")),
    ))
}
