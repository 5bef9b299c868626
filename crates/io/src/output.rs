// Output workbook export via rust_xlsxwriter.
//
// The output is a value copy of the source workbook. CERTAIN values from the
// decision trace are written as numbers; marked cells are left blank with a
// yellow fill and a note naming the issue. A `marking_summary` sheet lists
// every mark. Formatting of the source is not carried over, except that date
// cells are written back as dates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use calamine::{Data, Range, Reader};
use ledgerscan_pipeline::model::{CertainCell, MarkedCell};
use ledgerscan_pipeline::FinalReport;
use rust_xlsxwriter::{Color, Format, Note, Workbook as XlsxWorkbook, Worksheet};
use tracing::{info, warn};

use crate::error::IoError;
use crate::workbook;

pub const SUMMARY_SHEET: &str = "marking_summary";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OutputStats {
    pub sheets: usize,
    pub certain_written: usize,
    pub marked: usize,
    /// Name the mark listing was written under.
    pub summary_sheet: String,
}

/// `<output_dir>/<source stem>_<year>_marked.xlsx`
pub fn output_path(output_dir: &Path, source: &Path, year: i32) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ledger".to_string());
    output_dir.join(format!("{stem}_{year}_marked.xlsx"))
}

struct Overlay<'r> {
    certain: Vec<&'r CertainCell>,
    marks: Vec<&'r MarkedCell>,
}

/// Write the marked copy of one year's workbook.
pub fn write_output(report: &FinalReport, year: i32, source: &Path, dest: &Path) -> Result<OutputStats, IoError> {
    let write_err = |e: rust_xlsxwriter::XlsxError| IoError::WorkbookWrite {
        path: dest.to_path_buf(),
        message: e.to_string(),
    };

    let mut overlays: BTreeMap<&str, Overlay<'_>> = BTreeMap::new();
    for c in report.certain.iter().filter(|c| c.year == year) {
        overlays
            .entry(c.sheet.as_str())
            .or_insert_with(|| Overlay {
                certain: Vec::new(),
                marks: Vec::new(),
            })
            .certain
            .push(c);
    }
    for m in report.marks.iter().filter(|m| m.year == year) {
        overlays
            .entry(m.sheet.as_str())
            .or_insert_with(|| Overlay {
                certain: Vec::new(),
                marks: Vec::new(),
            })
            .marks
            .push(m);
    }

    let mut source_book = workbook::open(source)?;
    let sheet_names = source_book.sheet_names();
    let mark_format = Format::new().set_background_color(Color::Yellow);
    let dates = DateFormats::new();
    let mut stats = OutputStats::default();
    let mut xlsx = XlsxWorkbook::new();

    for name in &sheet_names {
        let range = workbook::read_range(&mut source_book, source, name)?;
        let worksheet = xlsx.add_worksheet().set_name(name).map_err(write_err)?;
        copy_values(worksheet, &range, &dates).map_err(write_err)?;

        if let Some(overlay) = overlays.get(name.as_str()) {
            for c in &overlay.certain {
                worksheet
                    .write_number(c.cell.row - 1, c.cell.col, c.value as f64)
                    .map_err(write_err)?;
                stats.certain_written += 1;
            }
            for m in &overlay.marks {
                let (row, col) = (m.cell.row - 1, m.cell.col);
                worksheet.write_blank(row, col, &mark_format).map_err(write_err)?;
                let note = Note::new(format!("{}: {}", m.issue, m.detail)).set_author("ledgerscan");
                worksheet.insert_note(row, col, &note).map_err(write_err)?;
                stats.marked += 1;
            }
        }
        stats.sheets += 1;
    }

    let summary = summary_sheet_name(&sheet_names);
    if summary != SUMMARY_SHEET {
        warn!(year, sheet = %summary, "source already has a sheet named like the summary; renamed");
    }
    let marks: Vec<&MarkedCell> = report.marks.iter().filter(|m| m.year == year).collect();
    write_summary(xlsx.add_worksheet(), &summary, &marks).map_err(write_err)?;
    stats.summary_sheet = summary;

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| IoError::file(parent, e))?;
    }
    xlsx.save(dest).map_err(write_err)?;

    info!(
        year,
        path = %dest.display(),
        certain = stats.certain_written,
        marked = stats.marked,
        "output workbook written"
    );
    Ok(stats)
}

/// Number formats for date cells. Excel stores dates as serials, so the
/// copy keeps the serial and only the format has to come back.
struct DateFormats {
    date: Format,
    datetime: Format,
    duration: Format,
}

impl DateFormats {
    fn new() -> Self {
        Self {
            date: Format::new().set_num_format("yyyy-mm-dd"),
            datetime: Format::new().set_num_format("yyyy-mm-dd hh:mm:ss"),
            duration: Format::new().set_num_format("[h]:mm:ss"),
        }
    }

    fn for_cell(&self, dt: &calamine::ExcelDateTime) -> &Format {
        if dt.is_duration() {
            &self.duration
        } else if dt.as_f64().fract() == 0.0 {
            &self.date
        } else {
            &self.datetime
        }
    }
}

fn copy_values(
    worksheet: &mut Worksheet,
    range: &Range<Data>,
    dates: &DateFormats,
) -> Result<(), rust_xlsxwriter::XlsxError> {
    let Some((start_row, start_col)) = range.start() else {
        return Ok(());
    };
    for (r, c, cell) in range.used_cells() {
        let r = start_row + r as u32;
        let c = (start_col as usize + c) as u16;
        match cell {
            Data::Empty => {}
            Data::String(s) if s.is_empty() => {}
            Data::String(s) | Data::DurationIso(s) => {
                worksheet.write_string(r, c, s)?;
            }
            Data::Float(n) => {
                worksheet.write_number(r, c, *n)?;
            }
            Data::Int(n) => {
                worksheet.write_number(r, c, *n as f64)?;
            }
            Data::Bool(b) => {
                worksheet.write_boolean(r, c, *b)?;
            }
            Data::Error(e) => {
                worksheet.write_string(r, c, e.to_string())?;
            }
            Data::DateTime(dt) => {
                worksheet.write_number_with_format(r, c, dt.as_f64(), dates.for_cell(dt))?;
            }
            Data::DateTimeIso(s) => match workbook::iso_to_serial(s) {
                Some(serial) => {
                    let format = if serial.fract() == 0.0 { &dates.date } else { &dates.datetime };
                    worksheet.write_number_with_format(r, c, serial, format)?;
                }
                None => {
                    worksheet.write_string(r, c, s)?;
                }
            },
        }
    }
    Ok(())
}

/// `marking_summary`, or the first free `marking_summary_N`. Sheet names
/// compare case-insensitively.
fn summary_sheet_name(taken: &[String]) -> String {
    let free = |candidate: &str| !taken.iter().any(|t| t.to_lowercase() == candidate.to_lowercase());
    if free(SUMMARY_SHEET) {
        return SUMMARY_SHEET.to_string();
    }
    (2..)
        .map(|n| format!("{SUMMARY_SHEET}_{n}"))
        .find(|name| free(name))
        .unwrap_or_else(|| SUMMARY_SHEET.to_string())
}

fn write_summary(
    worksheet: &mut Worksheet,
    name: &str,
    marks: &[&MarkedCell],
) -> Result<(), rust_xlsxwriter::XlsxError> {
    worksheet.set_name(name)?;
    let bold = Format::new().set_bold();
    let headers = ["sheet", "cell", "account", "month", "issue", "detail", "original_value"];
    for (c, h) in headers.iter().enumerate() {
        worksheet.write_string_with_format(0, c as u16, *h, &bold)?;
    }
    for (i, m) in marks.iter().enumerate() {
        let r = i as u32 + 1;
        worksheet.write_string(r, 0, &m.sheet)?;
        worksheet.write_string(r, 1, m.cell.to_string())?;
        worksheet.write_number(r, 2, m.account_code as f64)?;
        if let Some(month) = m.month {
            worksheet.write_number(r, 3, month as f64)?;
        }
        worksheet.write_string(r, 4, m.issue.as_str())?;
        worksheet.write_string(r, 5, &m.detail)?;
        worksheet.write_string(r, 6, &m.original_value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_name_avoids_source_sheets() {
        let names = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(summary_sheet_name(&names(&["(10300) 보통예금"])), "marking_summary");
        assert_eq!(summary_sheet_name(&names(&["Marking_Summary"])), "marking_summary_2");
        assert_eq!(
            summary_sheet_name(&names(&["marking_summary", "marking_summary_2"])),
            "marking_summary_3"
        );
    }
}
