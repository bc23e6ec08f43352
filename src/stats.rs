//! CSV statistics for generation runs

use crate::session::FrameReport;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("row has {got} values, table has {expected} columns")]
    ColumnMismatch { expected: usize, got: usize },
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Columns written by [`frame_row`]
pub const FRAME_COLUMNS: [&str; 9] = [
    "frame",
    "thread_group_size",
    "clipping",
    "normals",
    "workgroups",
    "vertices",
    "indices",
    "dropped_triangles",
    "time_ms",
];

pub fn frame_row(frame: usize, report: &FrameReport) -> Vec<String> {
    vec![
        frame.to_string(),
        report.config.thread_group_size.to_string(),
        report.config.clipping.to_string(),
        report.config.normal_mode.to_string(),
        report.size.workgroups.to_string(),
        report.generated.vertices.to_string(),
        report.generated.indices.to_string(),
        report.generated.dropped_triangles.to_string(),
        format!("{:.4}", report.elapsed.as_secs_f64() * 1000.0),
    ]
}

/// Rows of string values under a fixed header
#[derive(Debug, Clone)]
pub struct StatsTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl StatsTable {
    pub fn new<S: AsRef<str>>(columns: &[S]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.as_ref().to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn for_frames() -> Self {
        Self::new(&FRAME_COLUMNS)
    }

    pub fn add_row(&mut self, values: Vec<String>) -> Result<(), StatsError> {
        if values.len() != self.columns.len() {
            return Err(StatsError::ColumnMismatch {
                expected: self.columns.len(),
                got: values.len(),
            });
        }
        self.rows.push(values);
        Ok(())
    }

    pub fn has_data(&self) -> bool {
        !self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Drop all rows, keeping the header
    pub fn clear(&mut self) {
        self.rows.clear();
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        for line in std::iter::once(&self.columns).chain(&self.rows) {
            let _ = writeln!(out, "{}", line.join(","));
        }
        out
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StatsError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_csv()).map_err(|source| StatsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Wrote {} rows to {}", self.rows.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_layout() {
        let mut table = StatsTable::new(&["a", "b"]);
        assert!(!table.has_data());
        table.add_row(vec!["1".into(), "2".into()]).unwrap();
        table.add_row(vec!["3".into(), "4".into()]).unwrap();
        assert_eq!(table.to_csv(), "a,b\n1,2\n3,4\n");

        table.clear();
        assert_eq!(table.to_csv(), "a,b\n");
    }

    #[test]
    fn test_row_width_is_checked() {
        let mut table = StatsTable::new(&["a", "b"]);
        let result = table.add_row(vec!["1".into()]);
        assert!(matches!(result, Err(StatsError::ColumnMismatch { expected: 2, got: 1 })));
        assert!(table.is_empty());
    }

    #[test]
    fn test_save_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.csv");
        let mut table = StatsTable::for_frames();
        table.add_row(vec!["0".into(); FRAME_COLUMNS.len()]).unwrap();
        table.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("frame,thread_group_size,"));
        assert_eq!(text.lines().count(), 2);
    }
}
