use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use common::{ReportRecord, Result};

/// Consumer of the records a worker produces for reporters downstream.
pub trait ReportSink: Send {
    fn record(&mut self, record: &ReportRecord) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// `{dir}/{name}-group-{id}.report.jsonl`
pub fn report_path(dir: &Path, name: &str, group: usize) -> PathBuf {
    dir.join(format!("{name}-group-{group}.report.jsonl"))
}

/// Appends one JSON object per line.
pub struct JsonLinesReport {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesReport {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReportSink for JsonLinesReport {
    fn record(&mut self, record: &ReportRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Discards everything.
pub struct NullReport;

impl ReportSink for NullReport {
    fn record(&mut self, _record: &ReportRecord) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::{AlertRecord, Severity};

    fn alert(message: &str) -> ReportRecord {
        ReportRecord::Alert(AlertRecord {
            group: 2,
            severity: Severity::Warning,
            source: "test".into(),
            message: message.into(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 9, 30, 0).unwrap(),
        })
    }

    #[test]
    fn path_follows_run_name_and_group() {
        let p = report_path(Path::new("logs"), "demo", 4);
        assert_eq!(p, PathBuf::from("logs/demo-group-4.report.jsonl"));
    }

    #[test]
    fn writes_one_tagged_object_per_line_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = report_path(&dir.path().join("nested"), "demo", 2);

        let mut sink = JsonLinesReport::open(&path).unwrap();
        sink.record(&alert("first")).unwrap();
        sink.flush().unwrap();
        drop(sink);

        let mut sink = JsonLinesReport::open(&path).unwrap();
        sink.record(&alert("second")).unwrap();
        sink.flush().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "alert");
        assert_eq!(first["message"], "first");
        assert_eq!(first["severity"], "warning");
    }
}
