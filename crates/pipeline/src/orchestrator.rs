//! Streaming orchestration over the (year x account) task set.
//!
//! One sheet is loaded per task and dropped once extracted. With
//! `run.workers > 1` a chunk of consecutive same-year tasks (distinct account
//! codes) is extracted on a rayon pool, but monitoring, logging and
//! checkpointing still happen serially in task order.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use tracing::{info, warn};

use crate::accounts::{classify_account, is_ledger_sheet, parse_account_code, AccountKind};
use crate::analysis::{PatternAnalysisClient, RetryPolicy};
use crate::checkpoint::{CheckpointRecoveryManager, CheckpointStore};
use crate::config::{AccountsConfig, PipelineConfig};
use crate::error::PipelineError;
use crate::extract::ExtractionEngine;
use crate::model::{
    AccountTask, ContaminationAlert, IssueKind, LedgerSheet, StructuralErrorRecord, StructuralKind, TaskOutcome,
    TaskResult,
};
use crate::monitor::ContaminationMonitor;
use crate::report::{FinalReport, ReportInput};
use crate::runlog::RunLog;

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetEntry {
    pub year: i32,
    pub name: String,
}

/// Where sheets come from. Implementations must not keep loaded sheets alive
/// after handing them out.
pub trait SheetSource {
    /// Every sheet name of the requested years.
    fn inventory(&mut self, years: &[i32]) -> Result<Vec<SheetEntry>, PipelineError>;

    fn load(&mut self, year: i32, sheet_name: &str) -> Result<LedgerSheet, PipelineError>;

    /// Stable digest of the source contents, recorded in checkpoints.
    fn fingerprint(&mut self) -> Result<String, PipelineError>;
}

/// Sheets held in memory. Records every load for inspection.
#[derive(Debug, Default)]
pub struct MemorySheetSource {
    sheets: BTreeMap<(i32, String), LedgerSheet>,
    loads: Vec<(i32, String)>,
}

impl MemorySheetSource {
    pub fn new(sheets: impl IntoIterator<Item = LedgerSheet>) -> Self {
        Self {
            sheets: sheets
                .into_iter()
                .map(|s| ((s.year(), s.name().to_string()), s))
                .collect(),
            loads: Vec::new(),
        }
    }

    pub fn loads(&self) -> &[(i32, String)] {
        &self.loads
    }

    /// Replace a sheet, e.g. to inject a bad value between sessions.
    pub fn replace(&mut self, sheet: LedgerSheet) {
        self.sheets.insert((sheet.year(), sheet.name().to_string()), sheet);
    }
}

impl SheetSource for MemorySheetSource {
    fn inventory(&mut self, years: &[i32]) -> Result<Vec<SheetEntry>, PipelineError> {
        Ok(self
            .sheets
            .keys()
            .filter(|(y, _)| years.contains(y))
            .map(|(year, name)| SheetEntry {
                year: *year,
                name: name.clone(),
            })
            .collect())
    }

    fn load(&mut self, year: i32, sheet_name: &str) -> Result<LedgerSheet, PipelineError> {
        self.loads.push((year, sheet_name.to_string()));
        self.sheets
            .get(&(year, sheet_name.to_string()))
            .cloned()
            .ok_or_else(|| PipelineError::Source(format!("no sheet '{sheet_name}' in {year}")))
    }

    fn fingerprint(&mut self) -> Result<String, PipelineError> {
        Ok(format!("memory:{}", self.sheets.len()))
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// `None` = every account found.
    pub accounts: Option<Vec<u32>>,
    pub kind: Option<AccountKind>,
}

impl TaskFilter {
    fn is_unrestricted(&self) -> bool {
        self.accounts.is_none() && self.kind.is_none()
    }

    fn admits(&self, code: u32, accounts: &AccountsConfig) -> bool {
        let by_code = self.accounts.as_ref().map_or(true, |list| list.contains(&code));
        let by_kind = self
            .kind
            .map_or(true, |k| classify_account(code, accounts).matches(k));
        by_code && by_kind
    }
}

/// Ordered tasks plus what the monitor and the loader need to know about
/// the source.
#[derive(Debug, Clone, Default)]
pub struct TaskPlan {
    pub tasks: Vec<AccountTask>,
    pub sheet_errors: Vec<StructuralErrorRecord>,
    sheets: BTreeMap<AccountTask, String>,
    inventory: BTreeSet<(i32, u32)>,
}

impl TaskPlan {
    pub fn sheet_for(&self, task: AccountTask) -> Option<&str> {
        self.sheets.get(&task).map(String::as_str)
    }

    pub fn inventory(&self) -> impl Iterator<Item = (i32, u32)> + '_ {
        self.inventory.iter().copied()
    }
}

/// Build the sorted task list from a source inventory. Requested accounts
/// with no sheet in a year still become tasks and fail as `missing_sheet`.
pub fn plan_tasks(entries: &[SheetEntry], years: &[i32], filter: &TaskFilter, accounts: &AccountsConfig) -> TaskPlan {
    let mut plan = TaskPlan::default();

    for entry in entries {
        if !years.contains(&entry.year) || !is_ledger_sheet(&entry.name, accounts) {
            continue;
        }
        let Some(code) = parse_account_code(&entry.name) else {
            if filter.is_unrestricted() {
                plan.sheet_errors.push(StructuralErrorRecord {
                    task: None,
                    sheet: Some(entry.name.clone()),
                    kind: StructuralKind::UnparseableAccountCode,
                    detail: format!("no '(digits)' group in sheet name '{}' ({})", entry.name, entry.year),
                });
            }
            continue;
        };
        plan.inventory.insert((entry.year, code));
        if !filter.admits(code, accounts) {
            continue;
        }

        let task = AccountTask::new(entry.year, code);
        if let Some(first) = plan.sheets.get(&task) {
            plan.sheet_errors.push(StructuralErrorRecord {
                task: Some(task),
                sheet: Some(entry.name.clone()),
                kind: StructuralKind::DuplicateSheet,
                detail: format!("account {code} already read from sheet '{first}'"),
            });
            continue;
        }
        plan.sheets.insert(task, entry.name.clone());
    }

    let mut tasks: BTreeSet<AccountTask> = plan.sheets.keys().copied().collect();
    if let Some(requested) = &filter.accounts {
        for &year in years {
            for &code in requested {
                tasks.insert(AccountTask::new(year, code));
            }
        }
    }
    plan.tasks = tasks.into_iter().collect();
    plan
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct StreamingOrchestrator<'a> {
    config: &'a PipelineConfig,
    source: &'a mut dyn SheetSource,
    store: &'a mut dyn CheckpointStore,
    log: &'a mut RunLog,
    analysis: Option<&'a dyn PatternAnalysisClient>,
    retry: Option<RetryPolicy>,
}

impl<'a> StreamingOrchestrator<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        source: &'a mut dyn SheetSource,
        store: &'a mut dyn CheckpointStore,
        log: &'a mut RunLog,
    ) -> Self {
        Self {
            config,
            source,
            store,
            log,
            analysis: None,
            retry: None,
        }
    }

    pub fn with_analysis(mut self, client: &'a dyn PatternAnalysisClient) -> Self {
        self.analysis = Some(client);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Process every task from index 0.
    pub fn run(&mut self, run_id: &str, plan: &TaskPlan) -> Result<FinalReport, PipelineError> {
        self.drive(run_id, plan, false)
    }

    /// Continue after the last durable checkpoint of `run_id`.
    pub fn resume(&mut self, run_id: &str, plan: &TaskPlan) -> Result<FinalReport, PipelineError> {
        self.drive(run_id, plan, true)
    }

    fn drive(&mut self, run_id: &str, plan: &TaskPlan, resume: bool) -> Result<FinalReport, PipelineError> {
        if let Some(w) = plan.tasks.windows(2).find(|w| w[0] >= w[1]) {
            return Err(PipelineError::UnorderedTasks(w[1]));
        }

        let config = self.config;
        let fingerprint = self.source.fingerprint()?;
        let mut engine = ExtractionEngine::new(config, self.analysis);
        if let Some(retry) = self.retry {
            engine = engine.with_retry(retry);
        }
        let mut monitor = ContaminationMonitor::new(config.accounts.revenue.clone(), plan.inventory());

        if !resume && self.store.load()?.is_some() {
            return Err(PipelineError::Checkpoint(format!(
                "run {run_id} already has a checkpoint; resume it instead"
            )));
        }

        let mut manager = CheckpointRecoveryManager::new(&mut *self.store, run_id, &fingerprint, &plan.tasks);
        let start = if resume {
            let completed = manager.resume()?;
            self.log.rewind_to(Some(completed))?;
            for result in manager.results() {
                if let TaskOutcome::Extracted(x) = &result.outcome {
                    monitor.seed(&x.balance);
                }
            }
            self.log
                .run_event(format!("resumed run {run_id} after task {completed} of {}", plan.tasks.len()))?;
            completed + 1
        } else {
            // No checkpoint exists, so no task entry in the log is backed by one.
            self.log.rewind_to(None)?;
            self.log.run_event(format!("started run {run_id} with {} task(s)", plan.tasks.len()))?;
            for record in &plan.sheet_errors {
                warn!(sheet = record.sheet.as_deref().unwrap_or(""), kind = %record.kind, "{}", record.detail);
            }
            0
        };

        let workers = config.run.workers.max(1);
        let pool = if workers > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .build()
                    .map_err(|e| PipelineError::WorkerPool(e.to_string()))?,
            )
        } else {
            None
        };

        let mut alert: Option<ContaminationAlert> = None;
        let mut index = start;

        'chunks: while index < plan.tasks.len() {
            let end = chunk_end(&plan.tasks, index, workers);

            let mut loaded = Vec::with_capacity(end - index);
            for i in index..end {
                let task = plan.tasks[i];
                loaded.push((i, task, load_sheet(&mut *self.source, plan, task)));
            }

            let outcomes: Vec<(usize, AccountTask, TaskOutcome)> = match &pool {
                Some(pool) => pool.install(|| {
                    loaded
                        .into_par_iter()
                        .map(|(i, task, sheet)| (i, task, extract_task(&engine, task, sheet)))
                        .collect()
                }),
                None => loaded
                    .into_iter()
                    .map(|(i, task, sheet)| (i, task, extract_task(&engine, task, sheet)))
                    .collect(),
            };

            for (i, task, outcome) in outcomes {
                if let TaskOutcome::Extracted(x) = &outcome {
                    if let Some(found) = monitor.observe(i, &x.balance)? {
                        self.log.discard_pending();
                        self.log.contamination(&found);
                        self.log.commit()?;
                        manager.record_halt(&found)?;
                        alert = Some(found);
                        break 'chunks;
                    }
                }

                record_outcome(self.log, i, &outcome);
                self.log.commit()?;
                manager.save(i, TaskResult { index: i, task, outcome })?;
                info!(task = i, year = task.year, account = task.account_code, "task complete");
            }

            index = end;
        }

        let entries = self.log.entries()?;
        let report = FinalReport::build(ReportInput {
            run_id,
            source_fingerprint: &fingerprint,
            tasks_planned: plan.tasks.len(),
            results: manager.results(),
            sheet_errors: &plan.sheet_errors,
            alert: alert.as_ref(),
            log: &entries,
        });

        self.log.run_event(format!(
            "finished run {run_id}: status={:?} processed={} marked={} structural_errors={}",
            report.status,
            report.summary.tasks_processed,
            report.summary.marked_cells,
            report.structural_errors.len()
        ))?;
        Ok(report)
    }
}

/// End (exclusive) of the chunk starting at `start`: at most `workers`
/// consecutive tasks of one year with distinct account codes.
fn chunk_end(tasks: &[AccountTask], start: usize, workers: usize) -> usize {
    let year = tasks[start].year;
    let mut codes = BTreeSet::new();
    let mut end = start;
    while end < tasks.len() && end - start < workers && tasks[end].year == year && codes.insert(tasks[end].account_code) {
        end += 1;
    }
    end
}

fn load_sheet(
    source: &mut dyn SheetSource,
    plan: &TaskPlan,
    task: AccountTask,
) -> Result<LedgerSheet, StructuralErrorRecord> {
    let Some(name) = plan.sheet_for(task) else {
        return Err(StructuralErrorRecord {
            task: Some(task),
            sheet: None,
            kind: StructuralKind::MissingSheet,
            detail: format!("no sheet for account {} in {}", task.account_code, task.year),
        });
    };
    source.load(task.year, name).map_err(|e| StructuralErrorRecord {
        task: Some(task),
        sheet: Some(name.to_string()),
        kind: StructuralKind::SheetUnreadable,
        detail: e.to_string(),
    })
}

/// The sheet is consumed and dropped here.
fn extract_task(
    engine: &ExtractionEngine<'_>,
    task: AccountTask,
    sheet: Result<LedgerSheet, StructuralErrorRecord>,
) -> TaskOutcome {
    let sheet = match sheet {
        Ok(sheet) => sheet,
        Err(record) => return TaskOutcome::Failed(record),
    };
    match engine.extract(&sheet) {
        Ok(extraction) => TaskOutcome::Extracted(extraction),
        Err(mut record) => {
            record.task = Some(task);
            TaskOutcome::Failed(record)
        }
    }
}

fn record_outcome(log: &mut RunLog, index: usize, outcome: &TaskOutcome) {
    match outcome {
        TaskOutcome::Extracted(x) => {
            log.extracted(index, x);
            for mark in &x.marks {
                log.marked(index, mark);
            }
            let unavailable = x
                .marks
                .iter()
                .filter(|m| m.issue == IssueKind::AnalysisUnavailable)
                .count();
            if unavailable > 0 {
                log.analysis(
                    index,
                    x.balance.year,
                    x.balance.account_code,
                    format!("pattern analysis unavailable; {unavailable} value(s) marked"),
                );
            }
        }
        TaskOutcome::Failed(record) => log.structural(index, record),
    }
}
