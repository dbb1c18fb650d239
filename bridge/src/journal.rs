//! Local durable journal: append-only NDJSON per session, with CSV export.
//!
//! Every sample is written as one JSON line and flushed to the OS before the
//! call returns, so a process crash loses at most the sample being written.
//! The file is append-only for the whole session and never rewritten.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::Value;
use tracing::error;

use telemetry_types::TelemetrySample;

pub struct LocalJournal {
    path: PathBuf,
    file: File,
}

impl LocalJournal {
    /// Open (or create) `<spool_dir>/<session_id>.ndjson` for appending.
    pub fn open(spool_dir: &Path, session_id: &str) -> anyhow::Result<Self> {
        fs::create_dir_all(spool_dir)
            .with_context(|| format!("creating spool dir {}", spool_dir.display()))?;
        let path = spool_dir.join(format!("{session_id}.ndjson"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening journal {}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Failures are logged, never fatal — the pipeline
    /// must keep moving even if the disk is unhappy.
    pub fn append(&mut self, sample: &TelemetrySample) {
        let line = match serde_json::to_string(sample) {
            Ok(l) => l,
            Err(e) => {
                error!("journal: failed to serialize record: {e}");
                return;
            }
        };
        if let Err(e) = self
            .file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.write_all(b"\n"))
            .and_then(|_| self.file.flush())
        {
            error!("journal: append failed: {e}");
        }
    }

    /// Read back every parseable record; malformed lines are skipped.
    pub fn iter_records(&self) -> impl Iterator<Item = Value> {
        File::open(&self.path)
            .ok()
            .map(|f| BufReader::new(f).lines())
            .into_iter()
            .flatten()
            .map_while(|line| line.ok())
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() {
                    return None;
                }
                serde_json::from_str::<Value>(line).ok()
            })
    }

    /// Write a CSV with one header row plus one row per journal record.
    /// Missing fields become empty cells. Returns the record count.
    pub fn export_csv(&self, out_path: &Path, field_order: &[&str]) -> anyhow::Result<usize> {
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating export dir {}", parent.display()))?;
        }
        let mut writer = csv::Writer::from_path(out_path)
            .with_context(|| format!("creating {}", out_path.display()))?;
        writer.write_record(field_order)?;

        let mut count = 0usize;
        for record in self.iter_records() {
            let row: Vec<String> = field_order
                .iter()
                .map(|field| cell(record.get(*field)))
                .collect();
            writer.write_record(&row)?;
            count += 1;
        }
        writer.flush()?;
        Ok(count)
    }

    pub fn flush(&mut self) {
        let _ = self.file.flush();
    }
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_types::CSV_FIELD_ORDER;

    fn sample(i: u64) -> TelemetrySample {
        TelemetrySample {
            session_id: "s1".into(),
            session_name: "Test".into(),
            timestamp: format!("2026-08-01T12:00:{:02}Z", i % 60),
            message_id: i,
            speed_ms: i as f64,
            voltage_v: 48.0,
            ..TelemetrySample::default()
        }
    }

    #[test]
    fn append_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = LocalJournal::open(dir.path(), "session-a").unwrap();
        for i in 0..25 {
            journal.append(&sample(i));
        }

        let records: Vec<Value> = journal.iter_records().collect();
        assert_eq!(records.len(), 25);
        assert_eq!(records[7]["message_id"], 7);
        assert_eq!(records[7]["session_id"], "s1");
    }

    #[test]
    fn file_grows_with_each_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = LocalJournal::open(dir.path(), "session-b").unwrap();
        let mut last = 0;
        for i in 0..5 {
            journal.append(&sample(i));
            let size = fs::metadata(journal.path()).unwrap().len();
            assert!(size > last, "journal must grow on every append");
            last = size;
        }
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = LocalJournal::open(dir.path(), "session-c").unwrap();
        journal.append(&sample(1));
        {
            let mut f = OpenOptions::new().append(true).open(journal.path()).unwrap();
            writeln!(f, "{{not json at all").unwrap();
            writeln!(f).unwrap();
        }
        journal.append(&sample(2));

        let records: Vec<Value> = journal.iter_records().collect();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn csv_export_has_header_plus_row_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = LocalJournal::open(dir.path(), "session-d").unwrap();
        for i in 0..1000 {
            journal.append(&sample(i));
        }

        let out = dir.path().join("export/session-d.csv");
        let n = journal.export_csv(&out, &CSV_FIELD_ORDER).unwrap();
        assert_eq!(n, 1000);

        let text = fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1001);
        assert_eq!(lines[0], CSV_FIELD_ORDER.join(","));
        // Every data row has exactly one cell per column.
        assert_eq!(lines[1].split(',').count(), CSV_FIELD_ORDER.len());
    }

    #[test]
    fn csv_missing_fields_become_empty_cells() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = LocalJournal::open(dir.path(), "session-e").unwrap();
        journal.append(&sample(1));

        let out = dir.path().join("partial.csv");
        let n = journal.export_csv(&out, &["message_id", "no_such_field", "speed_ms"]).unwrap();
        assert_eq!(n, 1);
        let text = fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "1,,1.0");
    }
}
