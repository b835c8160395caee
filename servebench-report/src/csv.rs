//! CSV Output
//!
//! Append-only row sink. The first row written to an empty file fixes the
//! header; every later row must carry the same columns in the same order.
//! Reopening an existing report picks its header up from the first line.

use crate::ReportError;
use servebench_core::{ReportRow, RowSink};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Appends report rows to a CSV file
pub struct CsvReportSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    header: Option<Vec<String>>,
    rows_written: usize,
}

impl CsvReportSink {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReportError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let header = existing_header(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        debug!(path = %path.display(), resumed = header.is_some(), "opened CSV report");
        Ok(Self {
            path,
            writer,
            header,
            rows_written: 0,
        })
    }

    /// File being appended to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written through this sink (not counting pre-existing ones)
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Append one row, writing the header first if the file had none.
    pub fn append(&mut self, row: &ReportRow) -> Result<(), ReportError> {
        let columns: Vec<String> = row.columns().map(str::to_string).collect();
        match &self.header {
            Some(header) if *header != columns => {
                return Err(ReportError::ColumnMismatch {
                    expected: header.join(","),
                    got: columns.join(","),
                });
            }
            Some(_) => {}
            None => {
                self.writer.write_record(&columns)?;
                self.header = Some(columns);
            }
        }

        self.writer.write_record(row.values())?;
        self.writer.flush()?;
        self.rows_written += 1;
        Ok(())
    }
}

impl RowSink for CsvReportSink {
    fn write_row(&mut self, row: &ReportRow) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.append(row).map_err(Into::into)
    }
}

fn existing_header(path: &Path) -> Result<Option<Vec<String>>, ReportError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
    let header = reader.headers()?;
    Ok(Some(header.iter().map(str::to_string).collect()))
}

/// Default report file name: `<model>_report_<UTC timestamp>.csv`
pub fn default_report_filename(model_name: &str, now: chrono::DateTime<chrono::Utc>) -> String {
    format!("{}_report_{}.csv", model_name, now.format("%Y%m%dT%H%M%SZ"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(iteration: u32, extra: Option<&str>) -> ReportRow {
        let mut row = ReportRow::new();
        row.push("iteration", iteration);
        row.push("batch_size", iteration * 4 + 1);
        row.push("wait_mean_ms", "");
        if let Some(col) = extra {
            row.push(col, "x");
        }
        row
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("report.csv");
        let mut sink = CsvReportSink::open(&path).unwrap();
        sink.append(&row(1, None)).unwrap();
        sink.append(&row(2, None)).unwrap();
        assert_eq!(sink.rows_written(), 2);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "iteration,batch_size,wait_mean_ms\n1,5,\n2,9,\n");
    }

    #[test]
    fn test_reopen_appends_without_second_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        CsvReportSink::open(&path).unwrap().append(&row(1, None)).unwrap();
        CsvReportSink::open(&path).unwrap().append(&row(2, None)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("iteration").count(), 1);
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn test_column_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvReportSink::open(dir.path().join("report.csv")).unwrap();
        sink.append(&row(1, None)).unwrap();
        let err = sink.append(&row(2, Some("files"))).unwrap_err();
        assert!(matches!(err, ReportError::ColumnMismatch { .. }));
    }

    #[test]
    fn test_reopen_with_different_columns_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        CsvReportSink::open(&path).unwrap().append(&row(1, None)).unwrap();
        let mut sink = CsvReportSink::open(&path).unwrap();
        assert!(sink.append(&row(2, Some("files"))).is_err());
    }

    #[test]
    fn test_usable_as_row_sink() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvReportSink::open(dir.path().join("r.csv")).unwrap();
        let dyn_sink: &mut dyn RowSink = &mut sink;
        dyn_sink.write_row(&row(1, None)).unwrap();
        assert_eq!(sink.rows_written(), 1);
    }

    #[test]
    fn test_default_filename() {
        let now = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        assert_eq!(
            default_report_filename("resnet-18", now),
            "resnet-18_report_20240501T123000Z.csv"
        );
    }
}
