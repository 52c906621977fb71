//! Raw JSON record reading.
//!
//! Supported inputs:
//! - A JSON array of objects: `[{"a":1}, {"a":2}]`
//! - A single JSON object: `{"a":1}`
//! - Newline-delimited JSON (NDJSON): `{"a":1}\n{"a":2}\n`
//!
//! Records are returned as raw `serde_json::Value`s for a [`super::RecordParser`].

use std::fs;
use std::path::Path;

use crate::error::{TransformError, TransformResult};

/// Read raw records from a file.
pub fn read_raw_records_from_path(
    path: impl AsRef<Path>,
) -> TransformResult<Vec<serde_json::Value>> {
    let text = fs::read_to_string(path)?;
    read_raw_records(&text)
}

/// Read raw records from an in-memory string. Empty input yields no records.
pub fn read_raw_records(input: &str) -> TransformResult<Vec<serde_json::Value>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    // First try parsing as a single JSON value (array or object).
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return match v {
            serde_json::Value::Array(items) => Ok(items),
            serde_json::Value::Object(_) => Ok(vec![v]),
            _ => Err(TransformError::Parse {
                index: 0,
                message: "json must be an object, an array of objects, or NDJSON".to_string(),
            }),
        };
    }

    // Fall back to NDJSON.
    let mut values = Vec::new();
    for (i, line) in trimmed.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let v = serde_json::from_str::<serde_json::Value>(line).map_err(|e| TransformError::Parse {
            index: values.len(),
            message: format!("invalid ndjson at line {}: {}", i + 1, e),
        })?;
        values.push(v);
    }
    Ok(values)
}
