// ledgerscan CLI - ledger extraction, recovery and verification

mod config;
mod exit_codes;
mod extract;
mod logging;
mod recover;
mod run;
mod verify;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use ledgerscan_io::IoError;
use ledgerscan_pipeline::PipelineError;

use exit_codes::{pipeline_exit_code, EXIT_IO, EXIT_SUCCESS, EXIT_USAGE};

#[derive(Parser)]
#[command(name = "lscan")]
#[command(about = "Extract and validate monthly ledger balances without guessing")]
#[command(long_version = long_version())]
#[command(version)]
struct Cli {
    /// Config file (falls back to the user config dir, then built-in defaults)
    #[arg(long, global = true, env = config::CONFIG_ENV)]
    config: Option<PathBuf>,

    /// More diagnostics on stderr (-v debug, -vv trace)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only errors on stderr
    #[arg(long, short = 'q', global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract carry-forward and month-end balances into marked output workbooks
    #[command(after_help = "\
Sources come from [[sources]] in the config file; --source overrides a year.

Exit codes:
  0   Completed, no contamination, no structural errors
  10  Completed with structural errors (see the report)
  11  Halted on cross-account contamination

Examples:
  lscan extract --years 2023,2024 --output out/
  lscan extract --years 2024 --accounts 10300,10800 --output out/
  lscan extract --years 2024 --type PL --output out/ --source 2024=ledger_2024.xlsx
  lscan extract --years 2023 --output out/ --run-id nightly_2023 --workers 4")]
    Extract(extract::ExtractArgs),

    /// Resume an interrupted run from its checkpoint
    #[command(after_help = "\
--checkpoint accepts the checkpoint.json file or its run directory.

Examples:
  lscan recover --checkpoint .ledgerscan/20240131_235959/checkpoint.json
  lscan recover --checkpoint .ledgerscan/20240131_235959")]
    Recover {
        /// Checkpoint file or run directory
        #[arg(long)]
        checkpoint: PathBuf,
    },

    /// Re-check a finished run from its report, run log and output workbooks
    #[command(after_help = "\
Exit codes:
  0   All checks passed
  30  One or more checks failed

Examples:
  lscan verify --file out/ledgerscan_report_20240131_235959.json
  lscan verify --file out/ledgerscan_report_20240131_235959.json --strict --json")]
    Verify {
        /// Report JSON written by `extract` or `recover`
        #[arg(long)]
        file: PathBuf,

        /// Also fail on unresolved structural errors
        #[arg(long)]
        strict: bool,

        /// Print the checks as JSON on stdout
        #[arg(long)]
        json: bool,
    },
}

fn long_version() -> &'static str {
    if cfg!(debug_assertions) {
        concat!(
            env!("CARGO_PKG_VERSION"),
            " (", env!("GIT_COMMIT_HASH"), ")",
            "\nbuild:   debug",
            "\ntarget:  ", env!("TARGET"),
            "\nreport:  ledgerscan-report/1",
        )
    } else {
        concat!(
            env!("CARGO_PKG_VERSION"),
            " (", env!("GIT_COMMIT_HASH"), ")",
            "\nbuild:   release",
            "\ntarget:  ", env!("TARGET"),
            "\nreport:  ledgerscan-report/1",
        )
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose, cli.quiet);

    let result = match cli.command {
        Commands::Extract(args) => extract::cmd_extract(args, cli.config.as_deref(), cli.quiet),
        Commands::Recover { checkpoint } => recover::cmd_recover(&checkpoint, cli.config.as_deref(), cli.quiet),
        Commands::Verify { file, strict, json } => verify::cmd_verify(&file, strict, json, cli.quiet),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn new(code: u8, msg: impl Into<String>) -> Self {
        Self { code, message: msg.into(), hint: None }
    }

    pub fn args(msg: impl Into<String>) -> Self {
        Self::new(EXIT_USAGE, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(EXIT_IO, msg)
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl From<PipelineError> for CliError {
    fn from(err: PipelineError) -> Self {
        let code = pipeline_exit_code(&err);
        let hint = match &err {
            PipelineError::Recovery(ledgerscan_pipeline::RecoveryError::Halted { .. }) => {
                Some("restore the source workbooks from the run's backup/ directory and start a new extract".to_string())
            }
            PipelineError::Recovery(_) => {
                Some("this run cannot be resumed; start over with `lscan extract` and a new run id".to_string())
            }
            PipelineError::ConfigParse(_) | PipelineError::ConfigValidation(_) => {
                Some(format!("check the file given by --config or ${}", config::CONFIG_ENV))
            }
            _ => None,
        };
        Self { code, message: err.to_string(), hint }
    }
}

impl From<IoError> for CliError {
    fn from(err: IoError) -> Self {
        match err {
            IoError::WorkbookRead { .. } | IoError::UnknownYear(_) => {
                Self::new(exit_codes::EXIT_SOURCE, err.to_string())
            }
            other => Self::io(other.to_string()),
        }
    }
}
