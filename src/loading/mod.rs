//! Sink-side boundary: loaders consume transformed envelopes.
//!
//! A loader receives whole envelopes, keeps only their `data` mappings, and writes them to its
//! target in fixed-size sub-batches. A failing sub-batch is reported in the [`LoadResult`]
//! rather than aborting the load.

pub mod csv;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{TransformError, TransformResult};
use crate::types::{Envelope, Record};

pub use self::csv::CsvLoader;

/// Sub-batch size used when a loader is not told otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Outcome of one [`Loader::load`] call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadResult {
    pub success: bool,
    pub records_processed: usize,
    pub records_loaded: usize,
    pub records_failed: usize,
    pub errors: Vec<String>,
    /// `records_loaded / records_processed`, or `0.0` for an empty load.
    pub load_rate: f64,
}

impl LoadResult {
    pub fn new(records_processed: usize, records_loaded: usize, errors: Vec<String>) -> Self {
        let load_rate = if records_processed > 0 {
            records_loaded as f64 / records_processed as f64
        } else {
            0.0
        };
        Self {
            success: errors.is_empty(),
            records_processed,
            records_loaded,
            records_failed: records_processed.saturating_sub(records_loaded),
            errors,
            load_rate,
        }
    }
}

/// A sink for transformed records.
pub trait Loader {
    /// Open the target. Returns whether the target is usable.
    fn connect(&mut self) -> TransformResult<bool>;

    /// Write the `data` of every envelope. Requires a prior successful [`Loader::connect`].
    fn load(&mut self, records: &[Envelope]) -> TransformResult<LoadResult>;

    /// Close the target.
    fn disconnect(&mut self) -> TransformResult<bool>;
}

/// Split `records` into consecutive slices of at most `batch_size` (at least one) records.
pub fn split_batches<T>(records: &[T], batch_size: usize) -> impl Iterator<Item = &[T]> {
    records.chunks(batch_size.max(1))
}

/// Drive `write_batch` over `records` in sub-batches, collecting per-batch failures.
///
/// `write_batch` returns how many rows of the batch it wrote.
pub(crate) fn load_in_batches<F>(
    records: &[Envelope],
    batch_size: usize,
    mut write_batch: F,
) -> LoadResult
where
    F: FnMut(&[&Record]) -> TransformResult<usize>,
{
    let rows: Vec<&Record> = records.iter().map(|e| &e.data).collect();
    let batches = rows.len().div_ceil(batch_size.max(1));
    let mut loaded = 0;
    let mut errors = Vec::new();

    for (i, batch) in split_batches(&rows, batch_size).enumerate() {
        match write_batch(batch) {
            Ok(n) => {
                loaded += n;
                info!(batch = i + 1, batches, rows = n, "batch_loaded");
            }
            Err(e) => {
                let message = format!("failed to load batch {}: {e}", i + 1);
                warn!(batch = i + 1, batches, error = %e, "batch_failed");
                errors.push(message);
            }
        }
    }
    LoadResult::new(rows.len(), loaded, errors)
}

pub(crate) fn not_connected() -> TransformError {
    TransformError::Load {
        message: "not connected; call connect() first".to_string(),
    }
}

/// Collects loaded payloads in memory.
#[derive(Debug, Clone)]
pub struct MemoryLoader {
    batch_size: usize,
    connected: bool,
    /// Reject batches that would grow the store past this many rows.
    capacity: Option<usize>,
    rows: Vec<Record>,
}

impl Default for MemoryLoader {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl MemoryLoader {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            connected: false,
            capacity: None,
            rows: Vec::new(),
        }
    }

    pub fn with_capacity_limit(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Everything loaded so far, in load order.
    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Record> {
        self.rows
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Loader for MemoryLoader {
    fn connect(&mut self) -> TransformResult<bool> {
        self.connected = true;
        Ok(true)
    }

    fn load(&mut self, records: &[Envelope]) -> TransformResult<LoadResult> {
        if !self.connected {
            return Err(not_connected());
        }
        let capacity = self.capacity;
        let rows = &mut self.rows;
        Ok(load_in_batches(records, self.batch_size, |batch| {
            if capacity.is_some_and(|cap| rows.len() + batch.len() > cap) {
                return Err(TransformError::Load {
                    message: format!("capacity of {} rows exceeded", capacity.unwrap_or_default()),
                });
            }
            rows.extend(batch.iter().map(|r| (*r).clone()));
            Ok(batch.len())
        }))
    }

    fn disconnect(&mut self) -> TransformResult<bool> {
        self.connected = false;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metadata, SourceType, record_from_json};
    use serde_json::json;

    fn envelopes(n: usize) -> Vec<Envelope> {
        (0..n)
            .map(|i| {
                Envelope::new(
                    record_from_json(json!({"i": i})).unwrap(),
                    Metadata::new(SourceType::Kafka),
                )
            })
            .collect()
    }

    #[test]
    fn split_batches_covers_everything() {
        let xs = [1, 2, 3, 4, 5];
        let sizes: Vec<_> = split_batches(&xs, 2).map(<[i32]>::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(split_batches(&xs, 0).count(), 5);
    }

    #[test]
    fn memory_loader_requires_connect() {
        let mut loader = MemoryLoader::default();
        assert!(matches!(loader.load(&envelopes(1)), Err(TransformError::Load { .. })));
    }

    #[test]
    fn memory_loader_keeps_data_only() {
        let mut loader = MemoryLoader::new(2);
        assert!(loader.connect().unwrap());
        let result = loader.load(&envelopes(3)).unwrap();
        assert!(result.success);
        assert_eq!(result.records_loaded, 3);
        assert_eq!(result.load_rate, 1.0);
        assert_eq!(loader.rows()[2], record_from_json(json!({"i": 2})).unwrap());
        assert!(loader.disconnect().unwrap());
    }

    #[test]
    fn failed_batches_are_reported_not_raised() {
        let mut loader = MemoryLoader::new(2).with_capacity_limit(3);
        loader.connect().unwrap();
        let result = loader.load(&envelopes(5)).unwrap();
        assert!(!result.success);
        assert_eq!(result.records_processed, 5);
        // Batch 2 would overflow; batch 3 still fits.
        assert_eq!(result.records_loaded, 3);
        assert_eq!(result.records_failed, 2);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("batch 2"));
        assert_eq!(loader.rows().len(), 3);
    }

    #[test]
    fn empty_load_is_successful() {
        let mut loader = MemoryLoader::default();
        loader.connect().unwrap();
        let result = loader.load(&[]).unwrap();
        assert!(result.success);
        assert_eq!(result.load_rate, 0.0);
    }
}
