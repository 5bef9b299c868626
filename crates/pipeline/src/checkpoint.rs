//! Checkpoint / recovery.
//!
//! A checkpoint is written after every task, replacing the previous one. It
//! is the only source of truth on resume: tasks with index <= the recorded
//! `completed_task_index` are skipped, failed ones included.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PipelineError, RecoveryError};
use crate::model::{AccountTask, ContaminationAlert, TaskResult};

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub run_id: String,
    pub source_fingerprint: String,
    /// Planned task order; resume refuses a different plan.
    pub tasks: Vec<AccountTask>,
    pub completed_task_index: usize,
    /// One entry per task `0..=completed_task_index`, in order.
    pub partial_results: Vec<TaskResult>,
    pub saved_at: String,
}

impl Checkpoint {
    /// Structural self-consistency, independent of the current plan.
    pub fn check(&self) -> Result<(), RecoveryError> {
        if self.version != CHECKPOINT_VERSION {
            return Err(RecoveryError::Corrupt(format!(
                "unsupported checkpoint version {}",
                self.version
            )));
        }
        if self.completed_task_index >= self.tasks.len() {
            return Err(RecoveryError::Corrupt(format!(
                "completed index {} beyond {} planned tasks",
                self.completed_task_index,
                self.tasks.len()
            )));
        }
        if self.partial_results.len() != self.completed_task_index + 1 {
            return Err(RecoveryError::Corrupt(format!(
                "{} results recorded for {} completed tasks",
                self.partial_results.len(),
                self.completed_task_index + 1
            )));
        }
        for (i, r) in self.partial_results.iter().enumerate() {
            if r.index != i || self.tasks[i] != r.task {
                return Err(RecoveryError::Corrupt(format!("result {i} does not match task {}", self.tasks[i])));
            }
        }
        Ok(())
    }
}

/// Durable home of one run's checkpoint and halt marker.
pub trait CheckpointStore {
    /// Replace the stored checkpoint. Must be durable when it returns.
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), PipelineError>;

    /// `Ok(None)` when nothing was saved yet; unreadable data is a
    /// [`RecoveryError::Corrupt`].
    fn load(&self) -> Result<Option<Checkpoint>, PipelineError>;

    fn record_halt(&mut self, alert: &ContaminationAlert) -> Result<(), PipelineError>;

    fn halt(&self) -> Result<Option<ContaminationAlert>, PipelineError>;
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoint: Option<Checkpoint>,
    halt: Option<ContaminationAlert>,
    saves: usize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves so far.
    pub fn saves(&self) -> usize {
        self.saves
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        self.checkpoint = Some(checkpoint.clone());
        self.saves += 1;
        Ok(())
    }

    fn load(&self) -> Result<Option<Checkpoint>, PipelineError> {
        Ok(self.checkpoint.clone())
    }

    fn record_halt(&mut self, alert: &ContaminationAlert) -> Result<(), PipelineError> {
        self.halt = Some(alert.clone());
        Ok(())
    }

    fn halt(&self) -> Result<Option<ContaminationAlert>, PipelineError> {
        Ok(self.halt.clone())
    }
}

pub struct CheckpointRecoveryManager<'s> {
    store: &'s mut dyn CheckpointStore,
    run_id: String,
    fingerprint: String,
    tasks: Vec<AccountTask>,
    completed: Option<usize>,
    results: Vec<TaskResult>,
}

impl<'s> CheckpointRecoveryManager<'s> {
    pub fn new(
        store: &'s mut dyn CheckpointStore,
        run_id: &str,
        fingerprint: &str,
        tasks: &[AccountTask],
    ) -> Self {
        Self {
            store,
            run_id: run_id.to_string(),
            fingerprint: fingerprint.to_string(),
            tasks: tasks.to_vec(),
            completed: None,
            results: Vec::new(),
        }
    }

    /// Persist `result` as task `task_index`. Tasks must be saved in order.
    pub fn save(&mut self, task_index: usize, result: TaskResult) -> Result<(), PipelineError> {
        let expected = self.completed.map_or(0, |c| c + 1);
        if task_index != expected || result.index != task_index {
            return Err(PipelineError::Checkpoint(format!(
                "task {task_index} saved out of order (expected {expected})"
            )));
        }

        self.results.push(result);
        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            run_id: self.run_id.clone(),
            source_fingerprint: self.fingerprint.clone(),
            tasks: self.tasks.clone(),
            completed_task_index: task_index,
            partial_results: self.results.clone(),
            saved_at: chrono::Utc::now().to_rfc3339(),
        };

        if let Err(e) = self.store.save(&checkpoint) {
            self.results.pop();
            return Err(e);
        }
        self.completed = Some(task_index);
        debug!(task = task_index, "checkpoint saved");
        Ok(())
    }

    /// Load and validate the stored checkpoint against the current plan.
    /// Returns the last completed task index.
    pub fn resume(&mut self) -> Result<usize, PipelineError> {
        if let Some(alert) = self.store.halt()? {
            return Err(RecoveryError::Halted {
                run_id: self.run_id.clone(),
                account_code: alert.account_code,
                kind: alert.kind.to_string(),
            }
            .into());
        }

        let checkpoint = self.store.load()?.ok_or_else(|| RecoveryError::Missing {
            run_id: self.run_id.clone(),
        })?;
        checkpoint.check()?;

        if checkpoint.run_id != self.run_id {
            return Err(RecoveryError::RunMismatch {
                expected: self.run_id.clone(),
                found: checkpoint.run_id,
            }
            .into());
        }
        if checkpoint.tasks != self.tasks {
            return Err(RecoveryError::TaskListMismatch.into());
        }
        if checkpoint.source_fingerprint != self.fingerprint {
            return Err(RecoveryError::FingerprintMismatch {
                stored: checkpoint.source_fingerprint,
                current: self.fingerprint.clone(),
            }
            .into());
        }

        info!(
            run_id = %self.run_id,
            completed = checkpoint.completed_task_index,
            total = self.tasks.len(),
            "resuming from checkpoint"
        );
        self.completed = Some(checkpoint.completed_task_index);
        self.results = checkpoint.partial_results;
        Ok(checkpoint.completed_task_index)
    }

    pub fn should_skip(&self, task_index: usize) -> bool {
        self.completed.is_some_and(|c| task_index <= c)
    }

    pub fn completed(&self) -> Option<usize> {
        self.completed
    }

    pub fn results(&self) -> &[TaskResult] {
        &self.results
    }

    pub fn record_halt(&mut self, alert: &ContaminationAlert) -> Result<(), PipelineError> {
        self.store.record_halt(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertKind, StructuralErrorRecord, StructuralKind, TaskOutcome};

    fn tasks() -> Vec<AccountTask> {
        vec![
            AccountTask::new(2023, 10300),
            AccountTask::new(2023, 10800),
            AccountTask::new(2023, 40100),
        ]
    }

    fn failed(index: usize, task: AccountTask) -> TaskResult {
        TaskResult {
            index,
            task,
            outcome: TaskOutcome::Failed(StructuralErrorRecord {
                task: Some(task),
                sheet: None,
                kind: StructuralKind::MissingSheet,
                detail: "no sheet".into(),
            }),
        }
    }

    #[test]
    fn save_overwrites_and_resume_skips() {
        let mut store = MemoryCheckpointStore::new();
        let t = tasks();
        {
            let mut mgr = CheckpointRecoveryManager::new(&mut store, "run-1", "fp", &t);
            mgr.save(0, failed(0, t[0])).unwrap();
            mgr.save(1, failed(1, t[1])).unwrap();
        }
        assert_eq!(store.saves(), 2);
        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.completed_task_index, 1);
        assert_eq!(saved.partial_results.len(), 2);

        let mut mgr = CheckpointRecoveryManager::new(&mut store, "run-1", "fp", &t);
        assert_eq!(mgr.resume().unwrap(), 1);
        assert!(mgr.should_skip(0));
        assert!(mgr.should_skip(1));
        assert!(!mgr.should_skip(2));
        assert_eq!(mgr.results().len(), 2);
        mgr.save(2, failed(2, t[2])).unwrap();
    }

    #[test]
    fn out_of_order_save_rejected() {
        let mut store = MemoryCheckpointStore::new();
        let t = tasks();
        let mut mgr = CheckpointRecoveryManager::new(&mut store, "run-1", "fp", &t);
        assert!(mgr.save(1, failed(1, t[1])).is_err());
    }

    #[test]
    fn resume_without_checkpoint_is_missing() {
        let mut store = MemoryCheckpointStore::new();
        let t = tasks();
        let mut mgr = CheckpointRecoveryManager::new(&mut store, "run-1", "fp", &t);
        let err = mgr.resume().unwrap_err();
        assert!(matches!(err, PipelineError::Recovery(RecoveryError::Missing { .. })));
    }

    #[test]
    fn resume_rejects_changed_plan_or_source() {
        let mut store = MemoryCheckpointStore::new();
        let t = tasks();
        CheckpointRecoveryManager::new(&mut store, "run-1", "fp", &t)
            .save(0, failed(0, t[0]))
            .unwrap();

        let err = CheckpointRecoveryManager::new(&mut store, "run-1", "fp", &t[..2])
            .resume()
            .unwrap_err();
        assert!(matches!(err, PipelineError::Recovery(RecoveryError::TaskListMismatch)));

        let err = CheckpointRecoveryManager::new(&mut store, "run-1", "other", &t)
            .resume()
            .unwrap_err();
        assert!(matches!(err, PipelineError::Recovery(RecoveryError::FingerprintMismatch { .. })));
    }

    #[test]
    fn inconsistent_checkpoint_is_corrupt() {
        let mut store = MemoryCheckpointStore::new();
        let t = tasks();
        let bad = Checkpoint {
            version: CHECKPOINT_VERSION,
            run_id: "run-1".into(),
            source_fingerprint: "fp".into(),
            tasks: t.clone(),
            completed_task_index: 1,
            partial_results: vec![failed(0, t[0])],
            saved_at: String::new(),
        };
        store.save(&bad).unwrap();
        let err = CheckpointRecoveryManager::new(&mut store, "run-1", "fp", &t)
            .resume()
            .unwrap_err();
        assert!(matches!(err, PipelineError::Recovery(RecoveryError::Corrupt(_))));
    }

    #[test]
    fn halted_run_cannot_resume() {
        let mut store = MemoryCheckpointStore::new();
        let t = tasks();
        let mut mgr = CheckpointRecoveryManager::new(&mut store, "run-1", "fp", &t);
        mgr.save(0, failed(0, t[0])).unwrap();
        mgr.record_halt(&ContaminationAlert {
            task_index: 1,
            account_code: 10800,
            year: 2023,
            month: 1,
            kind: AlertKind::DuplicateAmount,
            evidence: String::new(),
        })
        .unwrap();
        let err = mgr.resume().unwrap_err();
        assert!(err.to_string().contains("halted"));
    }
}
