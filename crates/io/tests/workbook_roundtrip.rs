use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use calamine::{Data, Reader};
use ledgerscan_io::output::SUMMARY_SHEET;
use ledgerscan_io::{
    output_path, report_path, verify_report_file, write_output, write_report, FileCheckpointStore, JsonlLogSink,
    ReportDocument, RunDir, WorkbookSource,
};
use ledgerscan_pipeline::model::IssueKind;
use ledgerscan_pipeline::orchestrator::{plan_tasks, SheetSource, TaskFilter};
use ledgerscan_pipeline::report::RunStatus;
use ledgerscan_pipeline::{FinalReport, PipelineConfig, RunLog, StreamingOrchestrator};
use rust_xlsxwriter::{Format, Workbook};

enum Cell<'a> {
    T(&'a str),
    N(f64),
    /// Date serial stored as a real date cell.
    D(f64),
}

use Cell::{D, N, T};

// 2023-01-05
const JAN_5: f64 = 44931.0;

/// Header block on rows 1-4, carry-forward on row 5, body from row 6.
fn write_ledger(book: &mut Workbook, name: &str, label: &str, carry: f64, body: &[Vec<Cell<'_>>]) {
    let ws = book.add_worksheet().set_name(name).unwrap();
    for (c, h) in ["일자", "적요", "코드", "거래처", "차변", "대변", "잔액"].iter().enumerate() {
        ws.write_string(0, c as u16, *h).unwrap();
    }
    ws.write_string(4, 1, label).unwrap();
    ws.write_number(4, 6, carry).unwrap();
    for (r, row) in body.iter().enumerate() {
        for (c, cell) in row.iter().enumerate() {
            let (r, c) = (5 + r as u32, c as u16);
            match cell {
                T("") => {}
                T(s) => {
                    ws.write_string(r, c, *s).unwrap();
                }
                N(n) => {
                    ws.write_number(r, c, *n).unwrap();
                }
                D(serial) => {
                    let date = Format::new().set_num_format("yyyy-mm-dd");
                    ws.write_number_with_format(r, c, *serial, &date).unwrap();
                }
            }
        }
    }
}

fn txn(date: &'static str, balance: f64) -> Vec<Cell<'static>> {
    vec![T(date), T("거래"), T(""), T("(주)상대처"), N(100.0), T(""), N(balance)]
}

fn month_total() -> Vec<Cell<'static>> {
    vec![T(""), T("[ 월    계 ]"), T(""), T(""), N(100.0)]
}

fn build_source(dir: &Path) -> PathBuf {
    let path = dir.join("ledger_2023.xlsx");
    let mut book = Workbook::new();
    write_ledger(
        &mut book,
        "(10300) 보통예금",
        "전기이월",
        371554641.0,
        &[
            vec![D(JAN_5), T("거래"), T(""), T("(주)상대처"), N(100.0), T(""), N(16000000.0)],
            txn("01-28", 17015929.0),
            month_total(),
        ],
    );
    write_ledger(
        &mut book,
        "(10800) 외상매출금",
        "이월잔액",
        5000.0,
        &[txn("01-10", 7000.0), month_total(), txn("02-10", 0.0), month_total()],
    );
    // overwrite February's balance with text
    book.worksheet_from_name("(10800) 외상매출금")
        .unwrap()
        .write_string(7, 6, "확인필요")
        .unwrap();
    write_ledger(&mut book, "요약", "", 0.0, &[]);
    book.save(&path).unwrap();
    path
}

fn run_pipeline(dir: &Path, source_path: &Path) -> (RunDir, FinalReport, BTreeMap<i32, PathBuf>) {
    let config = PipelineConfig::default();
    let sources = BTreeMap::from([(2023, source_path.to_path_buf())]);
    let run = RunDir::create(&dir.join("work"), "20240101_000000").unwrap();
    run.backup_sources(&sources).unwrap();

    let mut source = WorkbookSource::new(sources.clone());
    let entries = source.inventory(&[2023]).unwrap();
    let plan = plan_tasks(&entries, &[2023], &TaskFilter::default(), &config.accounts);
    let mut store = FileCheckpointStore::new(&run);
    let mut log = RunLog::new(Box::new(JsonlLogSink::new(run.log_path()))).unwrap();
    let report = StreamingOrchestrator::new(&config, &mut source, &mut store, &mut log)
        .run(run.run_id(), &plan)
        .unwrap();
    (run, report, sources)
}

#[test]
fn extract_write_and_verify() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = build_source(dir.path());
    let (run, report, sources) = run_pipeline(dir.path(), &source_path);

    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.source_fingerprint.starts_with("sha256:"));
    assert_eq!(report.balances.len(), 2);
    assert_eq!(report.balances[0].carry_forward, Some(371554641));
    assert_eq!(report.balances[0].monthly.get(&1), Some(&17015929));
    let issues: Vec<IssueKind> = report.marks.iter().map(|m| m.issue).collect();
    assert_eq!(issues, vec![IssueKind::LabelMismatch, IssueKind::NonNumeric]);
    assert!(report.parity.consistent);
    assert!(run.backup_dir().join("2023_ledger_2023.xlsx").exists());
    assert!(run.checkpoint_path().exists());

    let out_dir = dir.path().join("out");
    let out = output_path(&out_dir, &source_path, 2023);
    let stats = write_output(&report, 2023, &source_path, &out).unwrap();
    assert_eq!(stats.sheets, 3);
    assert_eq!(stats.marked, 2);
    assert_eq!(stats.certain_written, report.certain.len());

    let doc = ReportDocument::new(
        report.clone(),
        run.root(),
        &run.log_path(),
        sources,
        BTreeMap::from([(2023, out.clone())]),
    );
    let path = report_path(&out_dir, run.run_id());
    write_report(&path, &doc).unwrap();

    let verification = verify_report_file(&path, true).unwrap();
    assert!(verification.passed(), "{:?}", verification.checks);

    // the summary sheet lists both marks below its header
    let mut book = ledgerscan_io::workbook::open(&out).unwrap();
    let rows = ledgerscan_io::workbook::read_sheet(&mut book, &out, SUMMARY_SHEET).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(stats.summary_sheet, SUMMARY_SHEET);

    // a real date cell is copied as a date, not as its month-day text
    let copy = book.worksheet_range("(10300) 보통예금").unwrap();
    match copy.get_value((5, 0)) {
        Some(Data::DateTime(dt)) => assert_eq!(dt.as_f64(), JAN_5),
        other => panic!("expected a date cell, got {other:?}"),
    }
}

#[test]
fn existing_summary_sheet_name_is_not_reused() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("ledger_2023.xlsx");
    let mut book = Workbook::new();
    write_ledger(
        &mut book,
        "(10300) 보통예금",
        "전기이월",
        1000.0,
        &[txn("01-05", 1100.0), month_total()],
    );
    write_ledger(&mut book, SUMMARY_SHEET, "", 0.0, &[]);
    book.save(&source_path).unwrap();

    let (_run, report, _sources) = run_pipeline(dir.path(), &source_path);
    let out = dir.path().join("out.xlsx");
    let stats = write_output(&report, 2023, &source_path, &out).unwrap();
    assert_eq!(stats.summary_sheet, "marking_summary_2");
    assert_eq!(stats.sheets, 2);

    let copy = ledgerscan_io::workbook::open(&out).unwrap();
    assert_eq!(
        copy.sheet_names(),
        vec!["(10300) 보통예금", SUMMARY_SHEET, "marking_summary_2"]
    );
}

#[test]
fn tampered_output_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = build_source(dir.path());
    let (run, report, sources) = run_pipeline(dir.path(), &source_path);

    // an output that is just the untouched source: marked cells still hold values
    let out = dir.path().join("copy.xlsx");
    std::fs::copy(&source_path, &out).unwrap();
    let doc = ReportDocument::new(report, run.root(), &run.log_path(), sources, BTreeMap::from([(2023, out)]));
    let path = dir.path().join("report.json");
    write_report(&path, &doc).unwrap();

    let verification = verify_report_file(&path, false).unwrap();
    assert!(!verification.passed());
    assert_eq!(verification.failures().next().unwrap().name, "output_cells");
}

#[test]
fn missing_log_breaks_parity() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = build_source(dir.path());
    let (run, report, sources) = run_pipeline(dir.path(), &source_path);
    std::fs::remove_file(run.log_path()).unwrap();

    let doc = ReportDocument::new(report, run.root(), &run.log_path(), sources, BTreeMap::new());
    let path = dir.path().join("report.json");
    write_report(&path, &doc).unwrap();
    let verification = verify_report_file(&path, false).unwrap();
    assert!(verification.failures().any(|c| c.name == "log_parity"));
}
