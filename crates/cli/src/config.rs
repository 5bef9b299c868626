//! Config file lookup.
//!
//! Order: `--config`, then `$LEDGERSCAN_CONFIG` (both handled by clap), then
//! `<user config dir>/ledgerscan/ledgerscan.toml`, then built-in defaults.
//! Relative source workbook paths resolve against the config file's
//! directory.

use std::path::{Path, PathBuf};

use ledgerscan_pipeline::PipelineConfig;
use tracing::debug;

use crate::CliError;

pub const CONFIG_ENV: &str = "LEDGERSCAN_CONFIG";

#[derive(Debug)]
pub struct LoadedConfig {
    pub config: PipelineConfig,
    /// `None` when running on defaults.
    pub path: Option<PathBuf>,
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("ledgerscan").join("ledgerscan.toml"))
}

/// An explicit path must exist; the user config file is optional.
pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig, CliError> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path().filter(|p| p.is_file()),
    };
    let Some(path) = path else {
        debug!("no config file, using defaults");
        return Ok(LoadedConfig {
            config: PipelineConfig::default(),
            path: None,
        });
    };

    let text = std::fs::read_to_string(&path).map_err(|e| {
        CliError::args(format!("cannot read config {}: {e}", path.display()))
            .with_hint(format!("pass an existing file with --config or unset ${CONFIG_ENV}"))
    })?;
    let mut config = PipelineConfig::from_toml(&text)?;
    if let Some(dir) = path.parent() {
        resolve_sources(&mut config, dir);
    }
    debug!(path = %path.display(), sources = config.sources.len(), "config loaded");
    Ok(LoadedConfig {
        config,
        path: Some(path),
    })
}

fn resolve_sources(config: &mut PipelineConfig, base: &Path) {
    for source in &mut config.sources {
        if source.workbook.is_relative() {
            source.workbook = base.join(&source.workbook);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_sources_follow_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledgerscan.toml");
        std::fs::write(
            &path,
            r#"
[[sources]]
year = 2023
workbook = "books/ledger_2023.xlsx"

[[sources]]
year = 2024
workbook = "/data/ledger_2024.xlsx"
"#,
        )
        .unwrap();

        let loaded = load(Some(&path)).unwrap();
        assert_eq!(loaded.path.as_deref(), Some(path.as_path()));
        assert_eq!(
            loaded.config.source_for(2023).unwrap().workbook,
            dir.path().join("books/ledger_2023.xlsx")
        );
        assert_eq!(
            loaded.config.source_for(2024).unwrap().workbook,
            PathBuf::from("/data/ledger_2024.xlsx")
        );
    }

    #[test]
    fn missing_explicit_config_is_a_usage_error() {
        let err = load(Some(Path::new("/nonexistent/ledgerscan.toml"))).unwrap_err();
        assert_eq!(err.code, crate::exit_codes::EXIT_USAGE);
        assert!(err.hint.is_some());
    }

    #[test]
    fn invalid_config_maps_to_config_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[run]\nworkers = 0\n").unwrap();
        let err = load(Some(&path)).unwrap_err();
        assert_eq!(err.code, crate::exit_codes::EXIT_CONFIG);
    }
}
