use std::path::{Path, PathBuf};

use shiftbook_adapters::{export_rows, parse_csv_rows, write_csv, write_schedule_workbook};
use shiftbook_core::{group_by_site, sort_by_weekday};
use shiftbook_storage::{FileStore, MemoryStore};
use shiftbook_sync::{import_upload, import_upload_file, IngestionPipeline, SkippedRow};
use tempfile::tempdir;

fn fixture_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join("sample")
        .join("schedule.csv")
}

#[test]
fn csv_fixture_imports_and_survives_reopen() {
    let dir = tempdir().expect("tempdir");
    let mut pipeline = IngestionPipeline::open(FileStore::new(dir.path()));

    let report = import_upload_file(&mut pipeline, &fixture_path(), Some("text/csv"))
        .expect("fixture import");
    assert_eq!(report.rows_seen, 6);
    assert_eq!(report.shifts_added, 5);
    assert_eq!(report.employees_created, 3);
    assert_eq!(report.schedules, 3);
    assert_eq!(
        report.skipped,
        vec![SkippedRow {
            row_index: 4,
            missing: vec!["EndTime"]
        }]
    );

    let schedules = pipeline.schedules();
    let ids: Vec<_> = schedules
        .list_all()
        .iter()
        .map(|r| r.employee_id.as_str())
        .collect();
    assert_eq!(ids, ["smith,_jr.", "maria_lopez", "barret"]);

    let maria = schedules.get("maria_lopez").expect("maria");
    assert_eq!(maria.employee_name, "Maria Lopez");
    assert_eq!(maria.total_hours(), 25.0);
    assert_eq!(maria.sites(), ["Site 2", "Site 1", "Site 3"]);
    let sorted = sort_by_weekday(&maria.shifts);
    let days: Vec<_> = sorted
        .iter()
        .map(|s| s.day.as_str())
        .collect();
    assert_eq!(days, ["Tuesday", "Friday", "Sunday"]);
    assert_eq!(group_by_site(&maria.shifts).len(), 3);

    // seeded employees keep their accounts but lose their schedules
    assert!(pipeline.employees().contains("test"));
    assert!(schedules.get("test").is_none());

    let reopened = IngestionPipeline::open(FileStore::new(dir.path()));
    assert_eq!(reopened.context(), pipeline.context());
}

#[test]
fn exported_csv_and_workbook_reimport_to_the_same_store() {
    let mut source = IngestionPipeline::open(MemoryStore::new());
    import_upload_file(&mut source, &fixture_path(), None).expect("fixture import");
    let expected = source.schedules().clone();

    let csv = write_csv(&export_rows(&expected));
    let mut from_csv = IngestionPipeline::open(MemoryStore::new());
    from_csv.ingest_full(&parse_csv_rows(&csv));
    assert_eq!(from_csv.schedules(), &expected);

    let workbook = write_schedule_workbook(&expected).expect("workbook");
    let mut from_workbook = IngestionPipeline::open(MemoryStore::new());
    let report = import_upload(&mut from_workbook, "schedule.xlsx", None, &workbook)
        .expect("workbook import");
    assert!(report.skipped.is_empty());
    assert_eq!(from_workbook.schedules(), &expected);
}

#[test]
fn rejected_upload_leaves_store_untouched() {
    let mut pipeline = IngestionPipeline::open(MemoryStore::new());
    let before = pipeline.context().clone();
    let csv = std::fs::read(fixture_path()).expect("fixture");

    assert!(import_upload(&mut pipeline, "schedule.txt", Some("text/plain"), &csv).is_err());
    assert_eq!(pipeline.context(), &before);
}
