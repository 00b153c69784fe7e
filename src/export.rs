//! Per-channel export of buffered records.
//!
//! Every stop writes a fresh file `<channel>_<YYYYMMDD_HHMMSS>.<ext>`. The
//! content goes to a `.tmp` sibling first and is renamed into place, so a
//! half-written export is never visible under its final name.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::info;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::record::Record;

/// UTF-8 byte-order mark, so spreadsheet tools pick the right encoding.
const BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Comma separated, LF line endings.
    #[default]
    Csv,
    /// Tab separated, CRLF line endings.
    Txt,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Txt => "txt",
        }
    }

    fn writer_builder(self) -> csv::WriterBuilder {
        let mut builder = csv::WriterBuilder::new();
        match self {
            ExportFormat::Csv => {
                builder.delimiter(b',').terminator(csv::Terminator::Any(b'\n'));
            }
            ExportFormat::Txt => {
                builder
                    .delimiter(b'\t')
                    .terminator(csv::Terminator::CRLF)
                    .quote_style(csv::QuoteStyle::Never);
            }
        }
        builder
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "txt" => Ok(ExportFormat::Txt),
            other => Err(Error::Config(format!("unknown export format '{other}'"))),
        }
    }
}

/// Final path for an export of `channel` taken at `at`.
///
/// A second export within the same second gets a numeric suffix instead of
/// overwriting the first.
pub fn export_path(dir: &Path, channel: &str, format: ExportFormat, at: DateTime<Local>) -> PathBuf {
    let stem = format!("{}_{}", sanitize(channel), at.format("%Y%m%d_%H%M%S"));
    let ext = format.extension();
    let mut path = dir.join(format!("{stem}.{ext}"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{stem}_{n}.{ext}"));
        n += 1;
    }
    path
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

/// Copy of `record` whose text fields hold no tab or line break.
///
/// TXT rows are never quoted, so those characters become spaces.
fn unbroken(record: &Record) -> Record {
    let clean = |value: &str| value.replace(['\t', '\r', '\n'], " ");
    Record {
        line: clean(&record.line),
        shift: clean(&record.shift),
        work_order: clean(&record.work_order),
        time: clean(&record.time),
        ..record.clone()
    }
}

/// Write `records` for `channel` into the existing directory `dir`.
/// Returns the file written.
pub fn export_records(
    dir: &Path,
    channel: &str,
    records: &[Record],
    format: ExportFormat,
    at: DateTime<Local>,
) -> Result<PathBuf> {
    let path = export_path(dir, channel, format, at);
    let export_error = |source: io::Error| Error::Export {
        path: path.clone(),
        source,
    };

    write_atomically(&path, |out| {
        out.write_all(BOM)?;
        let mut writer = format.writer_builder().from_writer(out);
        for record in records {
            match format {
                ExportFormat::Csv => writer.serialize(record),
                ExportFormat::Txt => writer.serialize(unbroken(record)),
            }
            .map_err(csv_to_io)?;
        }
        writer.flush()
    })
    .map_err(export_error)?;

    let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    info!(
        "exported {} record(s) of {} to {} ({})",
        records.len(),
        channel,
        path.display(),
        human_size(size)
    );
    Ok(path)
}

fn csv_to_io(e: csv::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

/// Run `fill` against `<path>.tmp`, then rename it to `path`.
///
/// On any failure the temporary file is removed and `path` is untouched.
pub fn write_atomically<F>(path: &Path, fill: F) -> io::Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let tmp = tmp_path(path);
    let result = (|| {
        let mut out = BufWriter::new(File::create(&tmp)?);
        fill(&mut out)?;
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Byte count as shown to the operator, e.g. `1.5 KB`.
pub fn human_size(bytes: u64) -> String {
    let mut n = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if n < 1024.0 {
            return format!("{n:.1} {unit}");
        }
        n /= 1024.0;
    }
    format!("{n:.1} PB")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn record(temp: f64, current: f64) -> Record {
        Record {
            line: "L1".into(),
            shift: "day".into(),
            work_order: "WO-7".into(),
            time: "2025-03-01T08:00:00.000+00:00".into(),
            temperature: temp,
            current,
        }
    }

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 1, 8, 0, 5).unwrap()
    }

    #[test]
    fn csv_export_has_bom_header_and_rows() {
        let dir = tempdir().unwrap();
        let path = export_records(
            dir.path(),
            "L1",
            &[record(21.5, 3.0), record(0.0, 0.0)],
            ExportFormat::Csv,
            at(),
        )
        .unwrap();

        assert_eq!(path.file_name().unwrap(), "L1_20250301_080005.csv");
        let bytes = fs::read(&path).unwrap();
        assert!(bytes.starts_with(BOM));
        let text = String::from_utf8(bytes[BOM.len()..].to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "line,shift,work_order,time,temperature,current");
        assert_eq!(lines[1], "L1,day,WO-7,2025-03-01T08:00:00.000+00:00,21.5,3.0");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn txt_export_is_tab_separated_with_crlf() {
        let dir = tempdir().unwrap();
        let path =
            export_records(dir.path(), "L2", &[record(1.25, 2.0)], ExportFormat::Txt, at()).unwrap();

        assert_eq!(path.extension().unwrap(), "txt");
        let bytes = fs::read(&path).unwrap();
        let text = String::from_utf8(bytes[BOM.len()..].to_vec()).unwrap();
        assert!(text.starts_with("line\tshift\twork_order\ttime\ttemperature\tcurrent\r\n"));
        assert!(text.ends_with("\t1.25\t2.0\r\n"));
    }

    #[test]
    fn txt_fields_cannot_split_columns_or_rows() {
        let dir = tempdir().unwrap();
        let mut messy = record(1.0, 2.0);
        messy.shift = "day\tlate".into();
        messy.work_order = "WO-7\r\nB".into();
        let path = export_records(dir.path(), "L2", &[messy.clone()], ExportFormat::Txt, at()).unwrap();

        let bytes = fs::read(&path).unwrap();
        let text = String::from_utf8(bytes[BOM.len()..].to_vec()).unwrap();
        let rows: Vec<&str> = text.split_terminator("\r\n").collect();
        assert_eq!(rows.len(), 2);
        let fields: Vec<&str> = rows[1].split('\t').collect();
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[1], "day late");
        assert_eq!(fields[2], "WO-7  B");

        // CSV quotes instead and keeps the value as entered.
        let path = export_records(dir.path(), "L2", &[messy.clone()], ExportFormat::Csv, at()).unwrap();
        let bytes = fs::read(&path).unwrap();
        let mut reader = csv::Reader::from_reader(&bytes[BOM.len()..]);
        let back: Record = reader.deserialize().next().unwrap().unwrap();
        assert_eq!(back.work_order, messy.work_order);
    }

    #[test]
    fn missing_directory_is_not_recreated() {
        let dir = tempdir().unwrap();
        let gone = dir.path().join("gone");

        let err = export_records(&gone, "L1", &[record(1.0, 1.0)], ExportFormat::Csv, at())
            .unwrap_err();
        assert!(matches!(err, Error::Export { .. }));
        assert!(!gone.exists());
    }

    #[test]
    fn repeated_exports_never_overwrite() {
        let dir = tempdir().unwrap();
        let first =
            export_records(dir.path(), "L1", &[record(1.0, 1.0)], ExportFormat::Csv, at()).unwrap();
        let second =
            export_records(dir.path(), "L1", &[record(2.0, 2.0)], ExportFormat::Csv, at()).unwrap();
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
    }

    #[test]
    fn interrupted_write_leaves_nothing_at_final_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("L1_20250301_080005.csv");

        let err = write_atomically(&path, |out| {
            out.write_all(b"line,shift\n")?;
            Err(io::Error::new(io::ErrorKind::Other, "disk pulled"))
        })
        .unwrap_err();

        assert_eq!(err.to_string(), "disk pulled");
        assert!(!path.exists());
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn interrupted_write_keeps_previous_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("existing.csv");
        fs::write(&path, "old").unwrap();

        let _ = write_atomically(&path, |out| {
            out.write_all(b"new")?;
            Err(io::Error::new(io::ErrorKind::Other, "boom"))
        });

        assert_eq!(fs::read_to_string(&path).unwrap(), "old");
    }

    #[test]
    fn export_into_unwritable_location_reports_path() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();

        let err = export_records(&blocker, "L1", &[record(1.0, 1.0)], ExportFormat::Csv, at())
            .unwrap_err();
        assert!(matches!(err, Error::Export { .. }));
    }

    #[test]
    fn sizes_are_humanized() {
        assert_eq!(human_size(512), "512.0 B");
        assert_eq!(human_size(1536), "1.5 KB");
    }

    #[test]
    fn format_parses_case_insensitively() {
        assert_eq!("TXT".parse::<ExportFormat>().unwrap(), ExportFormat::Txt);
        assert!("xlsx".parse::<ExportFormat>().is_err());
    }
}
