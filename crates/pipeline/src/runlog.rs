//! Per-run audit log.
//!
//! A [`RunLog`] is created for one run and owns its sink; there is no
//! process-wide log destination. Entries for a task are buffered and only
//! committed together with that task, so the log never describes work the
//! checkpoint does not contain. Committed entries are mirrored to `tracing`.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::model::{ContaminationAlert, MarkedCell, SheetExtraction, StructuralErrorRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogTag {
    Run,
    Extracted,
    Marked,
    StructuralError,
    Contamination,
    Analysis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub at: String,
    pub tag: LogTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub message: String,
}

impl LogEntry {
    fn new(tag: LogTag, message: String) -> Self {
        Self {
            seq: 0,
            at: chrono::Utc::now().to_rfc3339(),
            tag,
            task_index: None,
            year: None,
            account_code: None,
            sheet: None,
            location: None,
            message,
        }
    }

    /// Entries without a task index (run start / finish) survive rewinds.
    fn belongs_after(&self, last_completed: Option<usize>) -> bool {
        match (self.task_index, last_completed) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(i), Some(last)) => i > last,
        }
    }

    #[cfg(test)]
    pub(crate) fn marked_for_test(year: i32, sheet: &str, location: &str) -> Self {
        let mut e = Self::new(LogTag::Marked, "test".into());
        e.year = Some(year);
        e.sheet = Some(sheet.into());
        e.location = Some(location.into());
        e
    }
}

/// Durable destination for committed entries.
pub trait LogSink: Send {
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), PipelineError>;

    fn read_all(&self) -> Result<Vec<LogEntry>, PipelineError>;

    /// Replace the stored entries with `entries`.
    fn rewrite(&mut self, entries: &[LogEntry]) -> Result<(), PipelineError>;

    /// Human-readable location for reports (file path, or `None` in memory).
    fn location(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryLogSink {
    entries: Vec<LogEntry>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogSink for MemoryLogSink {
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), PipelineError> {
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<LogEntry>, PipelineError> {
        Ok(self.entries.clone())
    }

    fn rewrite(&mut self, entries: &[LogEntry]) -> Result<(), PipelineError> {
        self.entries = entries.to_vec();
        Ok(())
    }
}

pub struct RunLog {
    sink: Box<dyn LogSink>,
    pending: Vec<LogEntry>,
    next_seq: u64,
}

impl RunLog {
    pub fn new(sink: Box<dyn LogSink>) -> Result<Self, PipelineError> {
        let next_seq = sink.read_all()?.last().map(|e| e.seq + 1).unwrap_or(0);
        Ok(Self {
            sink,
            pending: Vec::new(),
            next_seq,
        })
    }

    fn push(&mut self, mut entry: LogEntry) {
        entry.seq = self.next_seq + self.pending.len() as u64;
        self.pending.push(entry);
    }

    /// Run-level event, committed immediately.
    pub fn run_event(&mut self, message: impl Into<String>) -> Result<(), PipelineError> {
        self.push(LogEntry::new(LogTag::Run, message.into()));
        self.commit()
    }

    pub fn extracted(&mut self, task_index: usize, extraction: &SheetExtraction) {
        let b = &extraction.balance;
        let mut e = LogEntry::new(
            LogTag::Extracted,
            format!(
                "carry_forward={} months={} activity={} certain={} marked={}",
                b.carry_forward.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
                b.monthly.len(),
                b.activity.len(),
                extraction.certain.len(),
                extraction.marks.len()
            ),
        );
        e.task_index = Some(task_index);
        e.year = Some(b.year);
        e.account_code = Some(b.account_code);
        e.sheet = Some(extraction.sheet.clone());
        self.push(e);
    }

    pub fn marked(&mut self, task_index: usize, mark: &MarkedCell) {
        let mut e = LogEntry::new(LogTag::Marked, format!("{}: {}", mark.issue, mark.detail));
        e.task_index = Some(task_index);
        e.year = Some(mark.year);
        e.account_code = Some(mark.account_code);
        e.sheet = Some(mark.sheet.clone());
        e.location = Some(mark.cell.to_string());
        self.push(e);
    }

    pub fn structural(&mut self, task_index: usize, record: &StructuralErrorRecord) {
        let mut e = LogEntry::new(LogTag::StructuralError, format!("{}: {}", record.kind, record.detail));
        e.task_index = Some(task_index);
        e.year = record.task.map(|t| t.year);
        e.account_code = record.task.map(|t| t.account_code);
        e.sheet = record.sheet.clone();
        self.push(e);
    }

    pub fn contamination(&mut self, alert: &ContaminationAlert) {
        let mut e = LogEntry::new(
            LogTag::Contamination,
            format!("{} month {}: {}", alert.kind, alert.month, alert.evidence),
        );
        e.task_index = Some(alert.task_index);
        e.year = Some(alert.year);
        e.account_code = Some(alert.account_code);
        self.push(e);
    }

    pub fn analysis(&mut self, task_index: usize, year: i32, account_code: u32, message: impl Into<String>) {
        let mut e = LogEntry::new(LogTag::Analysis, message.into());
        e.task_index = Some(task_index);
        e.year = Some(year);
        e.account_code = Some(account_code);
        self.push(e);
    }

    /// Persist buffered entries.
    pub fn commit(&mut self) -> Result<(), PipelineError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.sink.append(&self.pending)?;
        for e in &self.pending {
            mirror(e);
        }
        self.next_seq += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    /// Drop buffered entries of a task that will not be committed.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }

    /// Remove committed entries of tasks after `last_completed`, so the log
    /// agrees with the checkpoint a resume starts from.
    pub fn rewind_to(&mut self, last_completed: Option<usize>) -> Result<(), PipelineError> {
        self.pending.clear();
        let entries = self.sink.read_all()?;
        let before = entries.len();
        let kept: Vec<LogEntry> = entries
            .into_iter()
            .filter(|e| !e.belongs_after(last_completed))
            .collect();
        if kept.len() != before {
            warn!(dropped = before - kept.len(), "rewound run log to last checkpoint");
            self.sink.rewrite(&kept)?;
        }
        self.next_seq = kept.last().map(|e| e.seq + 1).unwrap_or(0);
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<LogEntry>, PipelineError> {
        self.sink.read_all()
    }

    pub fn location(&self) -> Option<String> {
        self.sink.location()
    }
}

fn mirror(e: &LogEntry) {
    let account = e.account_code.unwrap_or_default();
    match e.tag {
        LogTag::Run => info!(seq = e.seq, "{}", e.message),
        LogTag::Extracted => info!(task = ?e.task_index, account, "{}", e.message),
        LogTag::Marked => warn!(
            task = ?e.task_index,
            account,
            location = e.location.as_deref().unwrap_or(""),
            "marked uncertain: {}",
            e.message
        ),
        LogTag::StructuralError => error!(task = ?e.task_index, account, "structural error: {}", e.message),
        LogTag::Contamination => error!(task = ?e.task_index, account, "CONTAMINATION: {}", e.message),
        LogTag::Analysis => warn!(task = ?e.task_index, account, "{}", e.message),
    }
}
