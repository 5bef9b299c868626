use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::Args;
use ledgerscan_io::{new_run_id, Manifest, RunDir};
use ledgerscan_pipeline::accounts::AccountKind;
use tracing::info;

use crate::config;
use crate::exit_codes::EXIT_RUN_EXISTS;
use crate::run::{execute, Mode};
use crate::CliError;

#[derive(Args)]
pub struct ExtractArgs {
    /// Fiscal years to process, comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    years: Vec<i32>,

    /// Account codes, comma separated, or `none` for every account found
    #[arg(long, default_value = "none")]
    accounts: String,

    /// Account type filter: BS, PL, VAT or none
    #[arg(long = "type", default_value = "none")]
    account_type: String,

    /// Directory for marked workbooks and the report
    #[arg(long)]
    output: PathBuf,

    /// Source workbook for a year, overriding the config (repeatable)
    #[arg(long, value_name = "YEAR=PATH")]
    source: Vec<String>,

    /// Root for run directories (default: run.work_dir from the config)
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Run id (default: current UTC timestamp)
    #[arg(long)]
    run_id: Option<String>,

    /// Extraction workers (default: run.workers from the config)
    #[arg(long)]
    workers: Option<usize>,
}

pub fn cmd_extract(args: ExtractArgs, config_path: Option<&Path>, quiet: bool) -> Result<(), CliError> {
    let loaded = config::load(config_path)?;
    let mut config = loaded.config;
    if let Some(workers) = args.workers {
        if workers == 0 {
            return Err(CliError::args("--workers must be at least 1"));
        }
        config.run.workers = workers;
    }

    let mut years = args.years.clone();
    years.sort_unstable();
    years.dedup();

    let accounts = parse_accounts(&args.accounts)?;
    let kind = AccountKind::parse_filter(&args.account_type).map_err(CliError::args)?;
    let overrides = parse_sources(&args.source)?;

    let mut sources = BTreeMap::new();
    for &year in &years {
        let path = match overrides.get(&year) {
            Some(p) => p.clone(),
            None => config
                .source_for(year)
                .map(|s| s.workbook.clone())
                .ok_or_else(|| {
                    CliError::args(format!("no source workbook for {year}"))
                        .with_hint(format!("add [[sources]] year = {year} to the config or pass --source {year}=PATH"))
                })?,
        };
        if !path.is_file() {
            return Err(CliError::args(format!(
                "source workbook for {year} not found: {}",
                path.display()
            )));
        }
        sources.insert(year, absolute(path));
    }

    let run_id = args.run_id.unwrap_or_else(new_run_id);
    let work_dir = absolute(args.work_dir.unwrap_or_else(|| config.run.work_dir.clone()));
    let run = RunDir::create(&work_dir, &run_id)?;
    if run.checkpoint_path().exists() {
        return Err(CliError::new(
            EXIT_RUN_EXISTS,
            format!("run {run_id} already has a checkpoint"),
        )
        .with_hint(format!(
            "resume it with `lscan recover --checkpoint {}` or pick a new --run-id",
            run.checkpoint_path().display()
        )));
    }

    let manifest = Manifest {
        run_id: run_id.clone(),
        created_at: chrono::Utc::now().to_rfc3339(),
        years,
        accounts,
        account_type: kind.map(|k| k.to_string()),
        sources,
        output_dir: absolute(args.output),
        config_path: loaded.path.map(absolute),
    };
    run.write_manifest(&manifest)?;
    run.backup_sources(&manifest.sources)?;
    info!(run_id = %run_id, dir = %run.root().display(), years = ?manifest.years, "run started");

    execute(&config, &run, &manifest, Mode::Fresh, quiet)
}

/// Manifest paths must survive `recover` from another working directory.
fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

/// `none` (any case) means every account found.
fn parse_accounts(s: &str) -> Result<Option<Vec<u32>>, CliError> {
    if s.trim().eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let mut codes = s
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| {
            c.parse::<u32>()
                .map_err(|_| CliError::args(format!("invalid account code '{c}'")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if codes.is_empty() {
        return Err(CliError::args("--accounts needs at least one code or `none`"));
    }
    codes.sort_unstable();
    codes.dedup();
    Ok(Some(codes))
}

fn parse_sources(specs: &[String]) -> Result<BTreeMap<i32, PathBuf>, CliError> {
    let mut map = BTreeMap::new();
    for spec in specs {
        let (year, path) = spec
            .split_once('=')
            .ok_or_else(|| CliError::args(format!("--source expects YEAR=PATH, got '{spec}'")))?;
        let year: i32 = year
            .trim()
            .parse()
            .map_err(|_| CliError::args(format!("invalid year in --source '{spec}'")))?;
        if map.insert(year, PathBuf::from(path.trim())).is_some() {
            return Err(CliError::args(format!("--source given twice for {year}")));
        }
    }
    Ok(map)
}
