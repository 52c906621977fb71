//! CSV sink.
//!
//! Columns are fixed by the first non-empty load: the union of payload field names in
//! first-seen order. Null cells are written empty; other values use [`Value::to_text`].

use std::fs::File;
use std::io::Write;
use std::path::Path;

use indexmap::IndexSet;
use tracing::warn;

use crate::error::{TransformError, TransformResult};
use crate::types::{Envelope, Record, Value};

use super::{DEFAULT_BATCH_SIZE, LoadResult, Loader, load_in_batches, not_connected};

pub struct CsvLoader<W: Write> {
    writer: csv::Writer<W>,
    batch_size: usize,
    connected: bool,
    columns: Option<Vec<String>>,
}

impl CsvLoader<File> {
    /// Write to a file at `path`, truncating it.
    pub fn from_path(path: impl AsRef<Path>) -> TransformResult<Self> {
        Ok(Self::from_writer_builder(csv::Writer::from_path(path)?))
    }
}

impl<W: Write> CsvLoader<W> {
    pub fn new(out: W) -> Self {
        Self::from_writer_builder(csv::Writer::from_writer(out))
    }

    fn from_writer_builder(writer: csv::Writer<W>) -> Self {
        Self {
            writer,
            batch_size: DEFAULT_BATCH_SIZE,
            connected: false,
            columns: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Header columns, once the first non-empty load has fixed them.
    pub fn columns(&self) -> Option<&[String]> {
        self.columns.as_deref()
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(self) -> TransformResult<W> {
        self.writer
            .into_inner()
            .map_err(|e| TransformError::Io(e.into_error()))
    }

    fn ensure_header(&mut self, records: &[Envelope]) -> TransformResult<()> {
        if self.columns.is_some() || records.is_empty() {
            return Ok(());
        }
        let columns: IndexSet<&str> = records
            .iter()
            .flat_map(|e| e.data.keys().map(String::as_str))
            .collect();
        let columns: Vec<String> = columns.into_iter().map(str::to_string).collect();
        self.writer.write_record(&columns)?;
        self.columns = Some(columns);
        Ok(())
    }
}

fn write_rows<W: Write>(
    writer: &mut csv::Writer<W>,
    columns: &[String],
    batch: &[&Record],
) -> TransformResult<usize> {
    for row in batch {
        let extra = row.keys().filter(|k| !columns.contains(k)).count();
        if extra > 0 {
            warn!(extra, "csv_row_has_unknown_columns; dropping them");
        }
        let cells = columns.iter().map(|c| match row.get(c) {
            None | Some(Value::Null) => String::new(),
            Some(v) => v.to_text(),
        });
        writer.write_record(cells)?;
    }
    writer.flush()?;
    Ok(batch.len())
}

impl<W: Write> Loader for CsvLoader<W> {
    fn connect(&mut self) -> TransformResult<bool> {
        self.connected = true;
        Ok(true)
    }

    fn load(&mut self, records: &[Envelope]) -> TransformResult<LoadResult> {
        if !self.connected {
            return Err(not_connected());
        }
        self.ensure_header(records)?;
        let columns = self.columns.clone().unwrap_or_default();
        let writer = &mut self.writer;
        Ok(load_in_batches(records, self.batch_size, |batch| {
            write_rows(writer, &columns, batch)
        }))
    }

    fn disconnect(&mut self) -> TransformResult<bool> {
        self.writer.flush()?;
        self.connected = false;
        Ok(true)
    }
}
