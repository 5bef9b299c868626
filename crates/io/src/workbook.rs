// Ledger workbook import (xlsx, xls, xlsb, ods) via calamine.
//
// One workbook per fiscal year. Sheets are converted into the pipeline's
// LedgerSheet grid with absolute positions (A1 = row 1, col 0), so a cell
// reference taken from a LedgerSheet addresses the same cell in the file.
// Date cells become MM-DD text in that grid only; the output copy reads the
// untouched calamine range.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Range, Reader, Sheets};
use chrono::{Days, NaiveDate, NaiveDateTime};
use ledgerscan_pipeline::orchestrator::{SheetEntry, SheetSource};
use ledgerscan_pipeline::{LedgerSheet, PipelineError, RawCell};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::IoError;

pub type OpenWorkbook = Sheets<BufReader<File>>;

pub fn open(path: &Path) -> Result<OpenWorkbook, IoError> {
    open_workbook_auto(path).map_err(|e| IoError::WorkbookRead {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// One sheet's cells as calamine returns them.
pub fn read_range(workbook: &mut OpenWorkbook, path: &Path, sheet_name: &str) -> Result<Range<Data>, IoError> {
    workbook
        .worksheet_range(sheet_name)
        .map_err(|e| IoError::WorkbookRead {
            path: path.to_path_buf(),
            message: format!("sheet '{sheet_name}': {e}"),
        })
}

/// Read one sheet as a dense grid anchored at A1.
pub fn read_sheet(workbook: &mut OpenWorkbook, path: &Path, sheet_name: &str) -> Result<Vec<Vec<RawCell>>, IoError> {
    Ok(range_to_rows(&read_range(workbook, path, sheet_name)?))
}

fn range_to_rows(range: &Range<Data>) -> Vec<Vec<RawCell>> {
    // Range start offset (data may not begin at A1)
    let Some((start_row, start_col)) = range.start() else {
        return Vec::new();
    };
    let mut rows: Vec<Vec<RawCell>> = vec![Vec::new(); start_row as usize];
    for row in range.rows() {
        let mut out = vec![RawCell::Empty; start_col as usize];
        out.extend(row.iter().map(convert_cell));
        rows.push(out);
    }
    rows
}

fn convert_cell(cell: &Data) -> RawCell {
    match cell {
        Data::Empty => RawCell::Empty,
        Data::String(s) if s.is_empty() => RawCell::Empty,
        Data::String(s) => RawCell::Text(s.clone()),
        Data::Float(n) => RawCell::Number(*n),
        Data::Int(n) => RawCell::Number(*n as f64),
        Data::Bool(b) => RawCell::Bool(*b),
        Data::Error(e) => RawCell::Error(e.to_string().trim_start_matches('#').to_string()),
        // Ledger dates are month-day; keep them in the MM-DD text form the
        // exporting software writes when it does not use date cells.
        Data::DateTime(dt) => match serial_to_month_day(dt.as_f64()) {
            Some(text) => RawCell::Text(text),
            None => RawCell::Number(dt.as_f64()),
        },
        Data::DateTimeIso(s) => match NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d") {
            Ok(date) => RawCell::Text(date.format("%m-%d").to_string()),
            Err(_) => RawCell::Text(s.clone()),
        },
        Data::DurationIso(s) => RawCell::Text(s.clone()),
    }
}

/// 1900 date system serial -> "MM-DD".
fn serial_to_month_day(serial: f64) -> Option<String> {
    if !(1.0..2_958_466.0).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    let date = epoch.checked_add_days(Days::new(serial.floor() as u64))?;
    Some(date.format("%m-%d").to_string())
}

/// ISO date or date-time (as ODS stores them) -> 1900 date system serial.
pub(crate) fn iso_to_serial(s: &str) -> Option<f64> {
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let at = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d")
                .ok()?
                .and_hms_opt(0, 0, 0)
        })?;
    let seconds = (at - epoch).num_seconds();
    Some(seconds as f64 / 86_400.0)
}

/// SHA-256 over every configured workbook in year order → "sha256:<64 hex>".
pub fn fingerprint_sources(sources: &BTreeMap<i32, PathBuf>) -> Result<String, IoError> {
    let mut hasher = Sha256::new();
    for (year, path) in sources {
        hasher.update(year.to_string().as_bytes());
        hasher.update(b"\n");
        let mut file = File::open(path).map_err(|e| IoError::file(path, e))?;
        std::io::copy(&mut file, &mut hasher).map_err(|e| IoError::file(path, e))?;
        hasher.update(b"\n");
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// [`SheetSource`] over one workbook per year. At most one workbook is open
/// at a time; a loaded sheet is handed out and not retained.
pub struct WorkbookSource {
    paths: BTreeMap<i32, PathBuf>,
    current: Option<(i32, OpenWorkbook)>,
    fingerprint: Option<String>,
}

impl WorkbookSource {
    pub fn new(paths: BTreeMap<i32, PathBuf>) -> Self {
        Self {
            paths,
            current: None,
            fingerprint: None,
        }
    }

    pub fn paths(&self) -> &BTreeMap<i32, PathBuf> {
        &self.paths
    }

    fn path_for(&self, year: i32) -> Result<&Path, IoError> {
        self.paths
            .get(&year)
            .map(PathBuf::as_path)
            .ok_or(IoError::UnknownYear(year))
    }

    fn workbook_for(&mut self, year: i32) -> Result<&mut OpenWorkbook, IoError> {
        if self.current.as_ref().map(|(y, _)| *y) != Some(year) {
            let path = self.path_for(year)?.to_path_buf();
            debug!(year, path = %path.display(), "opening workbook");
            // Drop the previous year's workbook before opening the next.
            self.current = None;
            self.current = Some((year, open(&path)?));
        }
        match &mut self.current {
            Some((_, workbook)) => Ok(workbook),
            None => Err(IoError::UnknownYear(year)),
        }
    }
}

impl SheetSource for WorkbookSource {
    fn inventory(&mut self, years: &[i32]) -> Result<Vec<SheetEntry>, PipelineError> {
        let mut entries = Vec::new();
        for &year in years {
            let names = self.workbook_for(year)?.sheet_names();
            entries.extend(names.into_iter().map(|name| SheetEntry { year, name }));
        }
        Ok(entries)
    }

    fn load(&mut self, year: i32, sheet_name: &str) -> Result<LedgerSheet, PipelineError> {
        let path = self.path_for(year)?.to_path_buf();
        let workbook = self.workbook_for(year)?;
        let rows = read_sheet(workbook, &path, sheet_name)?;
        Ok(LedgerSheet::new(sheet_name, year, rows))
    }

    fn fingerprint(&mut self) -> Result<String, PipelineError> {
        if let Some(fp) = &self.fingerprint {
            return Ok(fp.clone());
        }
        let fp = fingerprint_sources(&self.paths)?;
        self.fingerprint = Some(fp.clone());
        Ok(fp)
    }
}
