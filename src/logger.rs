//! Append-only record logger for per-epoch summaries.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use crate::config::NmtError;

/// Writes one line of space-separated scalars per record, epoch index first.
/// Creating the log file is part of run setup; failure there aborts the run
/// before any batch is consumed.
pub struct RecordLogger {
    writer: BufWriter<File>,
}

impl RecordLogger {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, NmtError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|err| {
            NmtError::initialization(format!(
                "failed to create log file {}: {}",
                path.display(),
                err
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn write(&mut self, fields: &[f64]) -> Result<(), NmtError> {
        let line = fields
            .iter()
            .map(|value| format!("{:.6}", value))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        Ok(())
    }
}
