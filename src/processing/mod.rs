//! Record transformation stages.
//!
//! Each stage consumes a whole batch of [`Envelope`]s and returns a new batch of the same
//! length and order. A stage rewrites `data`, carries `metadata` forward, and appends one
//! [`TransformationRecord`] to every record's audit trail.
//!
//! Stages:
//!
//! - [`Cleaner`]: whitespace, null sentinels, email/phone normalization
//! - [`Flattener`]: nested mappings/sequences to a single-level mapping
//! - [`FieldMapper`]: per-source alias tables to canonical field names
//! - [`TypeConverter`]: declared target types with default-value fallback
//! - [`MetadataEnricher`]: timestamps, generated ids, source provenance
//!
//! [`Stage`] is the closed set of these, which is what [`crate::execution::TransformChain`]
//! holds.
//!
//! ## Example: clean then flatten
//!
//! ```rust
//! use record_pipeline::processing::{Cleaner, CleaningOptions, Flattener, FlattenOptions};
//! use record_pipeline::types::{Envelope, Metadata, SourceType, Value, record_from_json};
//! use serde_json::json;
//!
//! let data = record_from_json(json!({"name": "  Ada  ", "address": {"city": "NYC"}})).unwrap();
//! let batch = vec![Envelope::new(data, Metadata::new(SourceType::Kafka))];
//!
//! let cleaner = Cleaner::new(CleaningOptions::default()).unwrap();
//! let flattener = Flattener::new(FlattenOptions::default());
//!
//! let out = flattener.flatten(cleaner.clean(batch).unwrap()).unwrap();
//! assert_eq!(out[0].data.get("name"), Some(&Value::from("Ada")));
//! assert_eq!(out[0].data.get("address.city"), Some(&Value::from("NYC")));
//! assert_eq!(out[0].metadata.transformations().len(), 2);
//! ```

pub mod clean;
pub mod convert;
pub mod enrich;
pub mod field_map;
pub mod flatten;

use std::fmt;

use chrono::Utc;
use serde::Serialize;

use crate::error::TransformResult;
use crate::stats::StageStats;
use crate::types::{Envelope, TransformationRecord};

pub use clean::{Cleaner, CleaningOptions, CleaningRules};
pub use convert::{TargetType, TypeConversionOptions, TypeConverter};
pub use enrich::{DateTimeFormat, EnrichmentOptions, MetadataEnricher};
pub use field_map::{FieldMapper, FieldMappingOptions};
pub use flatten::{ArrayHandling, CustomRule, FlattenOptions, Flattener, NullHandling};

/// Counter every stage maintains.
pub const RECORDS_PROCESSED: &str = "records_processed";

/// Identifies a stage in logs, errors, and audit trails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Cleaning,
    Flattening,
    FieldMapping,
    TypeConversion,
    MetadataEnrichment,
}

impl StageKind {
    /// Default chain order. Mapping runs before conversion because conversion rules key on
    /// post-mapping field names.
    pub const DEFAULT_ORDER: [StageKind; 5] = [
        StageKind::Cleaning,
        StageKind::Flattening,
        StageKind::FieldMapping,
        StageKind::TypeConversion,
        StageKind::MetadataEnrichment,
    ];

    /// Stage name as written to `stage_name` in the audit trail.
    pub fn name(self) -> &'static str {
        match self {
            StageKind::Cleaning => "cleaning",
            StageKind::Flattening => "flattening",
            StageKind::FieldMapping => "field_mapping",
            StageKind::TypeConversion => "type_conversion",
            StageKind::MetadataEnrichment => "metadata_enrichment",
        }
    }

    /// Transformation family as written to `type` in the audit trail.
    pub fn transformation_type(self) -> &'static str {
        match self {
            StageKind::Cleaning => "data_cleaning",
            StageKind::Flattening => "flattening",
            StageKind::FieldMapping => "field_mapping",
            StageKind::TypeConversion => "type_conversion",
            StageKind::MetadataEnrichment => "metadata_enrichment",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of one stage invocation over a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    /// Transformed batch, same length and order as the input.
    pub records: Vec<Envelope>,
    /// Counters aggregated over the whole batch.
    pub stats: StageStats,
}

/// One configured transformation stage.
#[derive(Debug, Clone)]
pub enum Stage {
    Clean(Cleaner),
    Flatten(Flattener),
    MapFields(FieldMapper),
    ConvertTypes(TypeConverter),
    Enrich(MetadataEnricher),
}

impl Stage {
    /// Which stage this is.
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Clean(_) => StageKind::Cleaning,
            Stage::Flatten(_) => StageKind::Flattening,
            Stage::MapFields(_) => StageKind::FieldMapping,
            Stage::ConvertTypes(_) => StageKind::TypeConversion,
            Stage::Enrich(_) => StageKind::MetadataEnrichment,
        }
    }

    /// Apply the stage to a batch.
    pub fn apply(&self, batch: Vec<Envelope>) -> TransformResult<StageOutput> {
        match self {
            Stage::Clean(s) => s.apply(batch),
            Stage::Flatten(s) => s.apply(batch),
            Stage::MapFields(s) => s.apply(batch),
            Stage::ConvertTypes(s) => s.apply(batch),
            Stage::Enrich(s) => s.apply(batch),
        }
    }

    /// Serialized options of the stage.
    pub fn configuration_snapshot(&self) -> serde_json::Value {
        match self {
            Stage::Clean(s) => snapshot(s.options()),
            Stage::Flatten(s) => snapshot(s.options()),
            Stage::MapFields(s) => snapshot(s.options()),
            Stage::ConvertTypes(s) => snapshot(s.options()),
            Stage::Enrich(s) => snapshot(s.options()),
        }
    }
}

impl From<Cleaner> for Stage {
    fn from(s: Cleaner) -> Self {
        Stage::Clean(s)
    }
}

impl From<Flattener> for Stage {
    fn from(s: Flattener) -> Self {
        Stage::Flatten(s)
    }
}

impl From<FieldMapper> for Stage {
    fn from(s: FieldMapper) -> Self {
        Stage::MapFields(s)
    }
}

impl From<TypeConverter> for Stage {
    fn from(s: TypeConverter) -> Self {
        Stage::ConvertTypes(s)
    }
}

impl From<MetadataEnricher> for Stage {
    fn from(s: MetadataEnricher) -> Self {
        Stage::Enrich(s)
    }
}

pub(crate) fn snapshot<T: Serialize>(options: &T) -> serde_json::Value {
    serde_json::to_value(options).unwrap_or_default()
}

/// Collects per-record output and stats for one stage call, then stamps the audit trail.
pub(crate) struct BatchAccumulator {
    kind: StageKind,
    stats: StageStats,
    records: Vec<(Envelope, StageStats)>,
}

impl BatchAccumulator {
    pub(crate) fn new(kind: StageKind, counters: &[&str], capacity: usize) -> Self {
        let mut stats = StageStats::with_counters(&[RECORDS_PROCESSED]);
        stats.merge(&StageStats::with_counters(counters));
        Self {
            kind,
            stats,
            records: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn push(&mut self, record: Envelope, record_stats: StageStats) {
        self.stats.merge(&record_stats);
        self.stats.incr(RECORDS_PROCESSED);
        self.records.push((record, record_stats));
    }

    /// Append one trail entry per record. Every entry carries the batch totals.
    pub(crate) fn finish(self, configuration_snapshot: serde_json::Value) -> StageOutput {
        let timestamp = Utc::now();
        let Self { kind, stats, records } = self;

        let records = records
            .into_iter()
            .map(|(mut record, record_stats)| {
                record.metadata.push_transformation(TransformationRecord {
                    transformation_type: kind.transformation_type().to_string(),
                    timestamp,
                    stage_name: kind.name().to_string(),
                    stats: stats.clone(),
                    record_stats,
                    configuration_snapshot: configuration_snapshot.clone(),
                });
                record
            })
            .collect();

        StageOutput { records, stats }
    }
}
