//! Shared tail of `extract` and `recover`: plan, drive the orchestrator,
//! write outputs and the report, map the outcome to an exit code.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use ledgerscan_analysis::{HttpAnalysisClient, TOKEN_ENV};
use ledgerscan_io::{
    output_path, report_path, write_output, write_report, FileCheckpointStore, JsonlLogSink, Manifest,
    ReportDocument, RunDir, WorkbookSource,
};
use ledgerscan_pipeline::accounts::AccountKind;
use ledgerscan_pipeline::analysis::RetryPolicy;
use ledgerscan_pipeline::orchestrator::{plan_tasks, TaskFilter};
use ledgerscan_pipeline::report::RunStatus;
use ledgerscan_pipeline::{FinalReport, PipelineConfig, RunLog, SheetSource, StreamingOrchestrator};
use tracing::{info, warn};

use crate::exit_codes::{EXIT_CONFIG, EXIT_CONTAMINATION, EXIT_STRUCTURAL};
use crate::CliError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Fresh,
    Resume,
}

pub fn task_filter(manifest: &Manifest) -> Result<TaskFilter, CliError> {
    let kind = match manifest.account_type.as_deref() {
        Some(t) => AccountKind::parse_filter(t).map_err(CliError::args)?,
        None => None,
    };
    Ok(TaskFilter {
        accounts: manifest.accounts.clone(),
        kind,
    })
}

fn analysis_client(config: &PipelineConfig) -> Result<Option<HttpAnalysisClient>, CliError> {
    let Some(endpoint) = &config.analysis.endpoint else {
        info!("no analysis endpoint configured; VAT month-ends will be marked analysis_unavailable");
        return Ok(None);
    };
    let client = HttpAnalysisClient::new(endpoint.clone(), Duration::from_secs(config.analysis.timeout_secs))
        .map_err(|e| CliError::new(EXIT_CONFIG, format!("analysis client: {e}")))?
        .with_token(std::env::var(TOKEN_ENV).ok());
    info!(endpoint = client.endpoint(), "analysis client ready");
    Ok(Some(client))
}

/// Run (or resume) the pipeline for `manifest` inside `run`.
pub fn execute(
    config: &PipelineConfig,
    run: &RunDir,
    manifest: &Manifest,
    mode: Mode,
    quiet: bool,
) -> Result<(), CliError> {
    let filter = task_filter(manifest)?;
    let mut source = WorkbookSource::new(manifest.sources.clone());
    let entries = source.inventory(&manifest.years)?;
    let plan = plan_tasks(&entries, &manifest.years, &filter, &config.accounts);
    info!(
        run_id = run.run_id(),
        tasks = plan.tasks.len(),
        sheet_errors = plan.sheet_errors.len(),
        "tasks planned"
    );

    let client = analysis_client(config)?;
    let mut store = FileCheckpointStore::new(run);
    let mut log = RunLog::new(Box::new(JsonlLogSink::new(run.log_path())))?;

    let report = {
        let mut orchestrator = StreamingOrchestrator::new(config, &mut source, &mut store, &mut log)
            .with_retry(RetryPolicy::from_config(&config.analysis));
        if let Some(client) = &client {
            orchestrator = orchestrator.with_analysis(client);
        }
        match mode {
            Mode::Fresh => orchestrator.run(run.run_id(), &plan)?,
            Mode::Resume => orchestrator.resume(run.run_id(), &plan)?,
        }
    };

    let outputs = write_outputs(&report, manifest)?;
    let doc = ReportDocument::new(
        report,
        run.root(),
        &run.log_path(),
        manifest.sources.clone(),
        outputs,
    );
    let path = report_path(&manifest.output_dir, run.run_id());
    write_report(&path, &doc)?;
    info!(path = %path.display(), "report written");

    if !quiet {
        print_summary(&doc.report, &path);
    }
    outcome(&doc.report, run, &path)
}

/// Outputs exist only for completed runs; a halted run's results are not
/// trustworthy enough to hand to a reviewer.
fn write_outputs(report: &FinalReport, manifest: &Manifest) -> Result<BTreeMap<i32, PathBuf>, CliError> {
    let mut outputs = BTreeMap::new();
    if report.status != RunStatus::Completed {
        warn!("run halted; no output workbooks written");
        return Ok(outputs);
    }
    for (&year, source) in &manifest.sources {
        let dest = output_path(&manifest.output_dir, source, year);
        let stats = write_output(report, year, source, &dest)?;
        info!(
            year,
            path = %dest.display(),
            sheets = stats.sheets,
            certain = stats.certain_written,
            marked = stats.marked,
            "output written"
        );
        outputs.insert(year, dest);
    }
    Ok(outputs)
}

fn print_summary(report: &FinalReport, path: &std::path::Path) {
    let s = &report.summary;
    let status = match report.status {
        RunStatus::Completed => "completed",
        RunStatus::Halted => "HALTED",
    };
    eprintln!("run {}: {}", report.run_id, status);
    eprintln!(
        "  tasks     {} planned, {} processed, {} failed, {} not started",
        s.tasks_planned, s.tasks_processed, s.tasks_failed, s.tasks_not_started
    );
    eprintln!(
        "  values    {} certain, {} marked in {} account(s)",
        s.certain_values, s.marked_cells, s.accounts_with_marks
    );
    eprintln!(
        "  quality   {} ({}), integrity {:?}",
        report.quality.score, report.quality.grade, report.quality.integrity
    );
    for rec in &report.recommendations {
        eprintln!("  - {rec}");
    }
    println!("{}", path.display());
}

fn outcome(report: &FinalReport, run: &RunDir, path: &std::path::Path) -> Result<(), CliError> {
    if let Some(alert) = &report.contamination.alert {
        return Err(CliError::new(
            EXIT_CONTAMINATION,
            format!(
                "run halted: {} in account {} ({}-{:02}): {}",
                alert.kind, alert.account_code, alert.year, alert.month, alert.evidence
            ),
        )
        .with_hint(format!(
            "source backups are in {}; no output workbooks were written",
            run.backup_dir().display()
        )));
    }
    if !report.structural_errors.is_empty() {
        return Err(CliError::new(
            EXIT_STRUCTURAL,
            format!(
                "{} structural error(s); affected accounts are missing from the output",
                report.structural_errors.len()
            ),
        )
        .with_hint(format!("see structural_errors in {}", path.display())));
    }
    Ok(())
}
