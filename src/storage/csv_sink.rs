//! Append-only CSV sink for accelerometer samples

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::{info, warn};

use crate::ble::transport::AccelReading;

const HEADER: &str = "timestamp,x,y,z\n";

/// One CSV file holding the samples of a single streaming session.
///
/// The file is created in an existing output directory, named with a
/// creation timestamp, and owns its handle for the sink's lifetime. Each
/// row is flushed as it is written, so an abandoned handle still has every
/// appended sample on disk.
pub struct CsvSink {
    path: PathBuf,
    writer: BufWriter<std::fs::File>,
    rows: u64,
}

impl CsvSink {
    /// Create a uniquely named sink file in `dir` and write the header.
    ///
    /// The directory must already exist; the sink never creates it.
    pub fn create(dir: &Path) -> io::Result<Self> {
        let name = format!("accel_data_{}.csv", Local::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(HEADER.as_bytes())?;
        writer.flush()?;
        info!("opened sample sink {}", path.display());
        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }

    /// Append one sample row, stamped with the given wall-clock time.
    pub fn append(&mut self, at: DateTime<Local>, reading: &AccelReading) -> io::Result<()> {
        let line = format!(
            "{},{:.4},{:.4},{:.4}\n",
            at.format("%Y-%m-%d %H:%M:%S%.3f"),
            reading.x,
            reading.y,
            reading.z
        );
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    /// Flush and release the file handle.
    pub fn close(mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("failed to flush sink {}: {}", self.path.display(), e);
        }
        info!("closed sample sink {} ({} rows)", self.path.display(), self.rows);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }
}
