use std::path::Path;

use ledgerscan_io::rundir::CHECKPOINT_FILE;
use ledgerscan_io::RunDir;
use tracing::info;

use crate::config;
use crate::exit_codes::EXIT_RECOVERY_MISSING;
use crate::run::{execute, Mode};
use crate::CliError;

/// `checkpoint` is either `<run dir>/checkpoint.json` or the run directory.
pub fn cmd_recover(checkpoint: &Path, config_path: Option<&Path>, quiet: bool) -> Result<(), CliError> {
    let root = if checkpoint.is_dir() {
        checkpoint.to_path_buf()
    } else {
        checkpoint
            .parent()
            .filter(|_| checkpoint.file_name().is_some_and(|n| n == CHECKPOINT_FILE))
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                CliError::args(format!("{} is not a checkpoint file or run directory", checkpoint.display()))
            })?
    };

    let run = RunDir::open(&root)?;
    if !run.checkpoint_path().exists() {
        return Err(CliError::new(
            EXIT_RECOVERY_MISSING,
            format!("no checkpoint in {}", run.root().display()),
        )
        .with_hint("the run never completed a task; start it again with `lscan extract`"));
    }
    let manifest = run.read_manifest()?;

    // The config the run started with, unless one is given explicitly.
    let explicit = config_path.or(manifest.config_path.as_deref());
    let loaded = config::load(explicit)?;
    info!(run_id = run.run_id(), dir = %run.root().display(), "resuming run");

    execute(&loaded.config, &run, &manifest, Mode::Resume, quiet)
}
