//! Run directory layout and the file-backed checkpoint store and log sink.
//!
//! ```text
//! <work_dir>/<run_id>/
//!     manifest.json      what the run was asked to do
//!     checkpoint.json    last durable task (atomic replace)
//!     run.log.jsonl      audit log, one JSON entry per line
//!     halt.json          present only after a contamination halt
//!     backup/            byte copies of the source workbooks
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use ledgerscan_pipeline::checkpoint::{Checkpoint, CheckpointStore};
use ledgerscan_pipeline::model::ContaminationAlert;
use ledgerscan_pipeline::runlog::{LogEntry, LogSink};
use ledgerscan_pipeline::{PipelineError, RecoveryError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::IoError;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const LOG_FILE: &str = "run.log.jsonl";
pub const HALT_FILE: &str = "halt.json";
pub const BACKUP_DIR: &str = "backup";

/// New run ids are UTC timestamps, e.g. `20240131_235959`.
pub fn new_run_id() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
    run_id: String,
}

impl RunDir {
    pub fn create(work_dir: &Path, run_id: &str) -> Result<Self, IoError> {
        let root = work_dir.join(run_id);
        fs::create_dir_all(&root).map_err(|e| IoError::file(&root, e))?;
        Ok(Self {
            root,
            run_id: run_id.to_string(),
        })
    }

    /// Open an existing run directory, e.g. from a checkpoint path.
    pub fn open(root: &Path) -> Result<Self, IoError> {
        if !root.is_dir() {
            return Err(IoError::file(
                root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "run directory not found"),
            ));
        }
        let run_id = root
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            root: root.to_path_buf(),
            run_id,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    pub fn halt_path(&self) -> PathBuf {
        self.root.join(HALT_FILE)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join(BACKUP_DIR)
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> Result<(), IoError> {
        write_json_atomic(&self.manifest_path(), manifest)
    }

    pub fn read_manifest(&self) -> Result<Manifest, IoError> {
        read_json(&self.manifest_path())
    }

    /// Copy every source workbook into `backup/<year>_<file name>`.
    pub fn backup_sources(&self, sources: &BTreeMap<i32, PathBuf>) -> Result<Vec<PathBuf>, IoError> {
        let dir = self.backup_dir();
        fs::create_dir_all(&dir).map_err(|e| IoError::file(&dir, e))?;
        let mut copies = Vec::new();
        for (year, path) in sources {
            let name = path
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "workbook".to_string());
            let dest = dir.join(format!("{year}_{name}"));
            fs::copy(path, &dest).map_err(|e| IoError::file(path, e))?;
            debug!(year, from = %path.display(), to = %dest.display(), "source backed up");
            copies.push(dest);
        }
        info!(count = copies.len(), dir = %dir.display(), "source workbooks backed up");
        Ok(copies)
    }
}

/// What a run was asked to do; read back by `recover`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub created_at: String,
    pub years: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accounts: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_type: Option<String>,
    pub sources: BTreeMap<i32, PathBuf>,
    pub output_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
}

// ============================================================================
// JSON helpers
// ============================================================================

/// Write via a temp file in the same directory, fsync, then rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), IoError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| IoError::json(path, e))?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp).map_err(|e| IoError::file(&tmp, e))?;
        file.write_all(&json).map_err(|e| IoError::file(&tmp, e))?;
        file.sync_all().map_err(|e| IoError::file(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| IoError::file(path, e))
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, IoError> {
    let bytes = fs::read(path).map_err(|e| IoError::file(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| IoError::json(path, e))
}

// ============================================================================
// Checkpoint store
// ============================================================================

pub struct FileCheckpointStore {
    checkpoint: PathBuf,
    halt: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(run: &RunDir) -> Self {
        Self {
            checkpoint: run.checkpoint_path(),
            halt: run.halt_path(),
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
        write_json_atomic(&self.checkpoint, checkpoint).map_err(|e| PipelineError::Checkpoint(e.to_string()))
    }

    fn load(&self) -> Result<Option<Checkpoint>, PipelineError> {
        if !self.checkpoint.exists() {
            return Ok(None);
        }
        match read_json(&self.checkpoint) {
            Ok(cp) => Ok(Some(cp)),
            Err(e @ IoError::Json { .. }) => Err(RecoveryError::Corrupt(e.to_string()).into()),
            Err(e) => Err(PipelineError::Checkpoint(e.to_string())),
        }
    }

    fn record_halt(&mut self, alert: &ContaminationAlert) -> Result<(), PipelineError> {
        write_json_atomic(&self.halt, alert).map_err(|e| PipelineError::Checkpoint(e.to_string()))
    }

    fn halt(&self) -> Result<Option<ContaminationAlert>, PipelineError> {
        if !self.halt.exists() {
            return Ok(None);
        }
        read_json(&self.halt)
            .map(Some)
            .map_err(|e| PipelineError::Checkpoint(e.to_string()))
    }
}

// ============================================================================
// Run log sink
// ============================================================================

/// Append-only JSON lines. Each append is fsynced before returning.
pub struct JsonlLogSink {
    path: PathBuf,
}

impl JsonlLogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn log_err(&self, e: impl std::fmt::Display) -> PipelineError {
        PipelineError::Log(format!("{}: {e}", self.path.display()))
    }
}

pub fn read_log(path: &Path) -> Result<Vec<LogEntry>, IoError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).map_err(|e| IoError::file(path, e))?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| IoError::file(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line).map_err(|e| IoError::json(path, e))?);
    }
    Ok(entries)
}

fn encode(entries: &[LogEntry]) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut buf, entry)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

impl LogSink for JsonlLogSink {
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), PipelineError> {
        let buf = encode(entries).map_err(|e| self.log_err(e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.log_err(e))?;
        file.write_all(&buf).map_err(|e| self.log_err(e))?;
        file.sync_all().map_err(|e| self.log_err(e))
    }

    fn read_all(&self) -> Result<Vec<LogEntry>, PipelineError> {
        read_log(&self.path).map_err(|e| PipelineError::Log(e.to_string()))
    }

    fn rewrite(&mut self, entries: &[LogEntry]) -> Result<(), PipelineError> {
        let buf = encode(entries).map_err(|e| self.log_err(e))?;
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| self.log_err(e))?;
            file.write_all(&buf).map_err(|e| self.log_err(e))?;
            file.sync_all().map_err(|e| self.log_err(e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| self.log_err(e))
    }

    fn location(&self) -> Option<String> {
        Some(self.path.display().to_string())
    }
}
