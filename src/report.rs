//! # Download Report
//!
//! Appends one JSON line per finished download.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;
use crate::transfer::DownloadSummary;

/// JSONL file of finished downloads
#[derive(Debug)]
pub struct DownloadReport {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl DownloadReport {
    /// Open `path` for appending, creating it and its parent directory
    ///
    /// # Errors
    ///
    /// Returns error if the directory or file cannot be created
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Appending download report to {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one summary and flush
    pub fn append(&mut self, summary: &DownloadSummary) -> Result<()> {
        let line = serde_json::to_string(summary).map_err(std::io::Error::from)?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        Ok(())
    }
}
