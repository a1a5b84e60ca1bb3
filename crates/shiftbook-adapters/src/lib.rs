//! Row sources (remote sheet, CSV, workbook uploads) and schedule export.

use std::borrow::Cow;
use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{NaiveTime, Timelike};
use rust_xlsxwriter::{Workbook, Worksheet, XlsxError};
use serde_json::Value as JsonValue;
use shiftbook_core::{RawRow, ScheduleStore, SheetConfig, DEFAULT_WORKSHEET, MINUTES_PER_DAY, ROW_HEADERS};
use shiftbook_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "shiftbook-adapters";

pub const ACCEPTED_MIME_TYPES: [&str; 3] = [
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-excel",
    "text/csv",
];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected payload shape: {0}")]
    UnexpectedShape(String),
}

/// A remote producer of header-keyed schedule rows.
#[async_trait]
pub trait RowSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_rows(&self, http: &HttpFetcher) -> Result<Vec<RawRow>, SourceError>;
}

pub fn opensheet_json_url(config: &SheetConfig) -> String {
    format!(
        "https://opensheet.elk.sh/{}/{}",
        config.sheet_id,
        urlencoding::encode(&config.worksheet)
    )
}

pub fn published_csv_url(config: &SheetConfig) -> String {
    format!(
        "https://docs.google.com/spreadsheets/d/{}/gviz/tq?tqx=out:csv&sheet={}",
        config.sheet_id,
        urlencoding::encode(&config.worksheet)
    )
}

/// Row-array JSON document served by opensheet.
#[derive(Debug, Clone)]
pub struct OpenSheetJsonSource {
    url: String,
}

impl OpenSheetJsonSource {
    pub fn new(config: &SheetConfig) -> Self {
        Self::with_url(opensheet_json_url(config))
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RowSource for OpenSheetJsonSource {
    fn source_id(&self) -> &'static str {
        "opensheet_json"
    }

    async fn fetch_rows(&self, http: &HttpFetcher) -> Result<Vec<RawRow>, SourceError> {
        let response = http.fetch_bytes(self.source_id(), &self.url).await?;
        parse_json_rows(&response.text())
    }
}

/// CSV export of a published sheet.
#[derive(Debug, Clone)]
pub struct PublishedCsvSource {
    url: String,
}

impl PublishedCsvSource {
    pub fn new(config: &SheetConfig) -> Self {
        Self::with_url(published_csv_url(config))
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RowSource for PublishedCsvSource {
    fn source_id(&self) -> &'static str {
        "published_csv"
    }

    async fn fetch_rows(&self, http: &HttpFetcher) -> Result<Vec<RawRow>, SourceError> {
        let response = http.fetch_bytes(self.source_id(), &self.url).await?;
        Ok(parse_csv_rows(&response.text()))
    }
}

/// Decode an array of row objects. Scalars are stringified, nulls dropped.
/// Non-object entries become empty rows so row positions stay stable.
pub fn parse_json_rows(text: &str) -> Result<Vec<RawRow>, SourceError> {
    let value: JsonValue = serde_json::from_str(text)?;
    let JsonValue::Array(entries) = value else {
        return Err(SourceError::UnexpectedShape(
            "expected a JSON array of row objects".to_string(),
        ));
    };

    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            JsonValue::Object(map) => RawRow::from_fields(map.into_iter().filter_map(
                |(header, value)| {
                    let text = match value {
                        JsonValue::String(s) => s,
                        JsonValue::Number(n) => n.to_string(),
                        JsonValue::Bool(b) => b.to_string(),
                        _ => return None,
                    };
                    Some((header, text))
                },
            )),
            _ => RawRow::default(),
        })
        .collect())
}

/// Split one CSV line on unquoted commas. `""` inside quotes is a literal quote.
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Parse CSV text whose first non-blank line is the header. Values are trimmed;
/// cells past the end of a short line read as empty.
pub fn parse_csv_rows(text: &str) -> Vec<RawRow> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut lines = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.trim().is_empty());

    let Some(header_line) = lines.next() else {
        return Vec::new();
    };
    let headers: Vec<String> = split_csv_line(header_line)
        .into_iter()
        .map(|h| h.trim().to_string())
        .collect();

    lines
        .map(|line| {
            let cols = split_csv_line(line);
            RawRow::from_fields(headers.iter().enumerate().map(|(idx, header)| {
                let value = cols.get(idx).map(|v| v.trim()).unwrap_or_default();
                (header.as_str(), value.to_string())
            }))
        })
        .collect()
}

fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// Render rows as CSV with the five-column header.
pub fn write_csv(rows: &[RawRow]) -> String {
    let mut out = ROW_HEADERS.join(",");
    out.push('\n');
    for row in rows {
        let line: Vec<Cow<'_, str>> = row.values().into_iter().map(csv_field).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Workbook,
    Csv,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("unsupported upload {file_name:?} (type {mime:?}); expected .xlsx, .xls or .csv")]
    Unsupported { file_name: String, mime: String },
    #[error("unreadable workbook: {0}")]
    Workbook(#[from] calamine::Error),
    #[error("workbook has no sheets")]
    NoSheets,
}

/// Decide how to read an upload from its name and declared MIME type.
/// The extension wins when both are present.
pub fn classify_upload(file_name: &str, mime: Option<&str>) -> Result<UploadKind, UploadError> {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".csv") {
        return Ok(UploadKind::Csv);
    }
    if lower.ends_with(".xlsx") || lower.ends_with(".xls") {
        return Ok(UploadKind::Workbook);
    }

    let mime = mime.map(str::trim).unwrap_or_default();
    match mime {
        "text/csv" => Ok(UploadKind::Csv),
        m if ACCEPTED_MIME_TYPES.contains(&m) => Ok(UploadKind::Workbook),
        _ => Err(UploadError::Unsupported {
            file_name: file_name.to_string(),
            mime: mime.to_string(),
        }),
    }
}

/// Validate then read an upload into raw rows. Rejected files are never parsed.
pub fn read_upload(
    file_name: &str,
    mime: Option<&str>,
    bytes: &[u8],
) -> Result<Vec<RawRow>, UploadError> {
    let kind = classify_upload(file_name, mime)?;
    debug!(file_name, ?kind, bytes = bytes.len(), "reading upload");
    match kind {
        UploadKind::Csv => Ok(parse_csv_rows(&String::from_utf8_lossy(bytes))),
        UploadKind::Workbook => read_workbook_rows(bytes),
    }
}

pub fn read_upload_path(path: &Path, mime: Option<&str>) -> anyhow::Result<Vec<RawRow>> {
    let bytes = fs::read(path).with_context(|| format!("reading upload {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    read_upload(&file_name, mime, &bytes).with_context(|| format!("importing {}", path.display()))
}

/// First sheet only; its first row is the header. Fully blank rows are skipped.
pub fn read_workbook_rows(bytes: &[u8]) -> Result<Vec<RawRow>, UploadError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(UploadError::NoSheets)?;
    let range = workbook.worksheet_range(&sheet_name)?;

    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Ok(Vec::new());
    };
    let headers: Vec<String> = header_row
        .iter()
        .map(|cell| cell_text(cell).trim().to_string())
        .collect();

    Ok(rows
        .map(|cells| cells.iter().map(cell_text).collect::<Vec<_>>())
        .filter(|values| values.iter().any(|v| !v.trim().is_empty()))
        .map(|values| {
            RawRow::from_fields(
                headers
                    .iter()
                    .zip(values)
                    .filter(|(header, _)| !header.is_empty()),
            )
        })
        .collect())
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(stamp) if dt.as_f64() < 1.0 => clock_label(stamp.time()),
            Some(stamp) if stamp.time() == NaiveTime::MIN => stamp.format("%Y-%m-%d").to_string(),
            Some(stamp) => format!("{} {}", stamp.format("%Y-%m-%d"), clock_label(stamp.time())),
            None => dt.as_f64().to_string(),
        },
        Data::DateTimeIso(s) => NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
            .map(clock_label)
            .unwrap_or_else(|_| s.clone()),
        Data::DurationIso(s) => s.clone(),
        _ => String::new(),
    }
}

/// `H:MM AM|PM`, rounded to the nearest minute.
fn clock_label(time: NaiveTime) -> String {
    let seconds = time.num_seconds_from_midnight() + u32::from(time.nanosecond() >= 500_000_000);
    let minutes = ((seconds + 30) / 60) % MINUTES_PER_DAY;
    let (hour, minute) = (minutes / 60, minutes % 60);
    let meridiem = if hour < 12 { "AM" } else { "PM" };
    let hour12 = match hour % 12 {
        0 => 12,
        h => h,
    };
    format!("{hour12}:{minute:02} {meridiem}")
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("workbook generation failed: {0}")]
    Xlsx(#[from] XlsxError),
}

/// One row per shift, records in store order, named by the record's employee name.
pub fn export_rows(store: &ScheduleStore) -> Vec<RawRow> {
    store
        .list_all()
        .iter()
        .flat_map(|record| {
            record
                .shifts
                .iter()
                .map(|shift| RawRow::from_shift(&record.employee_name, shift))
        })
        .collect()
}

/// Single-sheet workbook named `Schedule` holding `export_rows`.
pub fn write_schedule_workbook(store: &ScheduleStore) -> Result<Vec<u8>, ExportError> {
    let mut workbook = Workbook::new();
    let mut worksheet = Worksheet::new();
    worksheet.set_name(DEFAULT_WORKSHEET)?;

    for (col, header) in ROW_HEADERS.iter().enumerate() {
        worksheet.write_string(0, col as u16, *header)?;
    }
    for (idx, row) in export_rows(store).iter().enumerate() {
        for (col, value) in row.values().into_iter().enumerate() {
            worksheet.write_string(idx as u32 + 1, col as u16, value)?;
        }
    }

    workbook.push_worksheet(worksheet);
    Ok(workbook.save_to_buffer()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shiftbook_core::{seed_data, Shift};
    use shiftbook_storage::HttpClientConfig;

    #[test]
    fn quoted_commas_and_doubled_quotes_survive_splitting() {
        assert_eq!(
            split_csv_line(r#""Smith, Jr.",Site 1,"say ""hi""",,x"#),
            vec!["Smith, Jr.", "Site 1", r#"say "hi""#, "", "x"]
        );
    }

    #[test]
    fn csv_rows_keep_embedded_commas() {
        let rows = parse_csv_rows(
            "Employee,Site,Day,StartTime,EndTime\n\"Smith, Jr.\",Site 1,Monday,9:00 AM,5:00 PM",
        );
        assert_eq!(
            rows,
            vec![RawRow::new("Smith, Jr.", "Site 1", "Monday", "9:00 AM", "5:00 PM")]
        );
    }

    #[test]
    fn csv_ignores_blank_lines_and_handles_crlf() {
        let text = "\"Employee\",\"Site\",\"Day\",\"StartTime\",\"EndTime\"\r\n\r\n  \r\n Ana , Site 2 ,Friday,9:00 AM,1:00 PM\r\nBo,Site 3,Monday\r\n";
        let rows = parse_csv_rows(text);
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            RawRow::new("Ana", "Site 2", "Friday", "9:00 AM", "1:00 PM")
        );
        assert_eq!(rows[1].missing_fields(), vec!["StartTime", "EndTime"]);
        assert!(parse_csv_rows("\n\n").is_empty());
    }

    #[test]
    fn json_rows_stringify_scalars_and_drop_nulls() {
        let rows = parse_json_rows(
            r#"[{"Employee":"Ana","Site":7,"Day":"Monday","StartTime":"9:00 AM","EndTime":null,"Notes":"x"}, 3]"#,
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].site.as_deref(), Some("7"));
        assert_eq!(rows[0].end_time, None);
        assert_eq!(rows[1], RawRow::default());

        assert!(matches!(
            parse_json_rows(r#"{"error":"not found"}"#),
            Err(SourceError::UnexpectedShape(_))
        ));
        assert!(matches!(parse_json_rows("<html>"), Err(SourceError::Json(_))));
    }

    #[test]
    fn sheet_urls_encode_worksheet_name() {
        let config = SheetConfig::new("abc123", "Week 1/2");
        assert_eq!(
            opensheet_json_url(&config),
            "https://opensheet.elk.sh/abc123/Week%201%2F2"
        );
        assert_eq!(
            published_csv_url(&config),
            "https://docs.google.com/spreadsheets/d/abc123/gviz/tq?tqx=out:csv&sheet=Week%201%2F2"
        );
    }

    #[test]
    fn uploads_are_classified_before_parsing() {
        assert_eq!(classify_upload("roster.CSV", None).unwrap(), UploadKind::Csv);
        assert_eq!(classify_upload("roster.xls", None).unwrap(), UploadKind::Workbook);
        assert_eq!(
            classify_upload("blob", Some("text/csv")).unwrap(),
            UploadKind::Csv
        );
        assert_eq!(
            classify_upload("blob", Some(ACCEPTED_MIME_TYPES[0])).unwrap(),
            UploadKind::Workbook
        );
        assert!(matches!(
            read_upload("notes.txt", Some("text/plain"), b"Employee\nAna"),
            Err(UploadError::Unsupported { .. })
        ));
    }

    #[test]
    fn csv_writer_quotes_only_when_needed() {
        let rows = vec![RawRow::new("Smith, Jr.", "Site \"A\"", "Monday", "9:00 AM", "5:00 PM")];
        let text = write_csv(&rows);
        assert_eq!(
            text,
            "Employee,Site,Day,StartTime,EndTime\n\"Smith, Jr.\",\"Site \"\"A\"\"\",Monday,9:00 AM,5:00 PM\n"
        );
        assert_eq!(parse_csv_rows(&text), rows);
    }

    #[test]
    fn exported_workbook_reads_back_in_store_order() {
        let (_, mut schedules) = seed_data();
        schedules.upsert_shift("cloud", Shift::new("Sunday", "Site 4", "10:00 PM", "6:00 AM"));

        let bytes = write_schedule_workbook(&schedules).unwrap();
        let rows = read_upload("schedule.xlsx", None, &bytes).unwrap();

        assert_eq!(rows, export_rows(&schedules));
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[0].employee.as_deref(), Some("Barret"));
        assert_eq!(rows[5].site.as_deref(), Some("Site 4"));
    }

    #[test]
    fn clock_labels_round_to_minutes() {
        let t = |h, m, s| NaiveTime::from_hms_opt(h, m, s).unwrap();
        assert_eq!(clock_label(t(0, 0, 0)), "12:00 AM");
        assert_eq!(clock_label(t(15, 0, 0)), "3:00 PM");
        assert_eq!(clock_label(t(14, 59, 59)), "3:00 PM");
        assert_eq!(clock_label(t(23, 59, 45)), "12:00 AM");
    }

    #[tokio::test]
    async fn unreachable_source_reports_fetch_error() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let source = PublishedCsvSource::with_url("http://127.0.0.1:9/sheet.csv");
        let err = source.fetch_rows(&http).await.unwrap_err();
        assert!(matches!(err, SourceError::Fetch(_)));
    }
}
