//! Flight recorder
//!
//! Every cycle's full state record goes into a bounded in-memory ring. On
//! error entry (or operator request) the ring is dumped as a JSON-lines file,
//! preserving the cycles leading up to the fault.

use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger};
use chrono::Local;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

pub struct Blackbox {
    records: VecDeque<String>,
    size: usize,
    path: PathBuf,
    logger: StructuredLogger,
}

impl Blackbox {
    pub fn new<P: AsRef<Path>>(size: usize, path: P) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self {
            records: VecDeque::with_capacity(size),
            size,
            path: path.as_ref().to_path_buf(),
            logger: get_logger("blackbox"),
        })
    }

    /// Append one record, evicting the oldest past the configured size
    pub fn push(&mut self, record: &serde_json::Value) {
        if self.records.len() == self.size {
            self.records.pop_front();
        }
        self.records.push_back(record.to_string());
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Current ring content as JSON lines, oldest first
    pub fn lines(&self) -> String {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(record);
            out.push('\n');
        }
        out
    }

    /// Write the ring to `<path>/blackbox-YYYY-MM-DD HHMMSS.jsonl`
    pub fn dump(&self) -> Result<PathBuf> {
        let filename = Local::now()
            .format("blackbox-%Y-%m-%d %H%M%S.jsonl")
            .to_string();
        let target = self.path.join(filename);
        self.logger
            .info(&format!("file dump: {}", target.display()));
        std::fs::write(&target, self.lines())?;
        Ok(target)
    }
}
