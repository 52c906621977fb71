//! Metadata-enrichment stage: appends business metadata to the payload.
//!
//! Everything this stage adds goes into `data`. The pipeline's own provenance (`metadata`) is
//! only read, for the source tag and its source-specific attributes.
//!
//! `createdAt` is the moment the enricher was constructed and is identical across every record
//! it touches. `processedAt` is taken per record.

use std::fmt;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{TransformError, TransformResult};
use crate::stats::StageStats;
use crate::types::{Envelope, Metadata, Record, SourceType, Value};

use super::{BatchAccumulator, StageKind, StageOutput};

pub const CREATED_AT_ADDED: &str = "created_at_added";
pub const PROCESSED_AT_ADDED: &str = "processed_at_added";
pub const UNIQUE_IDS_ADDED: &str = "unique_ids_added";
pub const SOURCE_INFO_ADDED: &str = "source_info_added";
pub const ADDITIONAL_FIELDS_ADDED: &str = "additional_fields_added";

const COUNTERS: &[&str] = &[
    CREATED_AT_ADDED,
    PROCESSED_AT_ADDED,
    UNIQUE_IDS_ADDED,
    SOURCE_INFO_ADDED,
    ADDITIONAL_FIELDS_ADDED,
];

pub const DATA_SOURCE_FIELD: &str = "dataSource";
pub const SOURCE_TOPIC_FIELD: &str = "sourceTopic";
pub const SOURCE_DOCUMENT_ID_FIELD: &str = "sourceDocumentId";

/// How the created/processed timestamps are rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DateTimeFormat {
    /// RFC 3339 with microseconds, UTC.
    #[default]
    Iso,
    /// Whole seconds since the Unix epoch, as text.
    Timestamp,
    /// [`EnrichmentOptions::custom_datetime_format`] strftime pattern.
    Custom,
    /// Unrecognized name from configuration; renders like [`DateTimeFormat::Iso`].
    Unknown(String),
}

impl DateTimeFormat {
    pub fn as_str(&self) -> &str {
        match self {
            DateTimeFormat::Iso => "iso",
            DateTimeFormat::Timestamp => "timestamp",
            DateTimeFormat::Custom => "custom",
            DateTimeFormat::Unknown(name) => name,
        }
    }
}

impl From<String> for DateTimeFormat {
    fn from(name: String) -> Self {
        match name.as_str() {
            "iso" => DateTimeFormat::Iso,
            "timestamp" => DateTimeFormat::Timestamp,
            "custom" => DateTimeFormat::Custom,
            _ => DateTimeFormat::Unknown(name),
        }
    }
}

impl From<DateTimeFormat> for String {
    fn from(f: DateTimeFormat) -> Self {
        f.as_str().to_string()
    }
}

impl fmt::Display for DateTimeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for the [`MetadataEnricher`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentOptions {
    pub add_created_at: bool,
    pub add_processed_at: bool,
    pub add_unique_id: bool,
    pub add_source_info: bool,
    pub created_at_field: String,
    pub processed_at_field: String,
    pub id_field: String,
    pub datetime_format: DateTimeFormat,
    pub custom_datetime_format: String,
    /// Generated ids become `<prefix>_<uuid>` when non-empty.
    pub id_prefix: String,
    /// Static fields added to every record that does not already have them.
    pub additional_metadata: IndexMap<String, Value>,
}

impl Default for EnrichmentOptions {
    fn default() -> Self {
        Self {
            add_created_at: true,
            add_processed_at: true,
            add_unique_id: false,
            add_source_info: true,
            created_at_field: "createdAt".to_string(),
            processed_at_field: "processedAt".to_string(),
            id_field: "recordId".to_string(),
            datetime_format: DateTimeFormat::Iso,
            custom_datetime_format: "%Y-%m-%d %H:%M:%S".to_string(),
            id_prefix: String::new(),
            additional_metadata: IndexMap::new(),
        }
    }
}

/// The metadata-enrichment stage.
#[derive(Debug, Clone)]
pub struct MetadataEnricher {
    options: EnrichmentOptions,
    started_at: DateTime<Utc>,
}

impl MetadataEnricher {
    /// Build an enricher. The custom datetime pattern is validated here.
    pub fn new(options: EnrichmentOptions) -> TransformResult<Self> {
        validate_pattern(&options.custom_datetime_format)?;
        if let DateTimeFormat::Unknown(name) = &options.datetime_format {
            warn!(datetime_format = %name, "unknown_datetime_format; falling back to iso");
        }
        Ok(Self {
            options,
            started_at: Utc::now(),
        })
    }

    pub fn options(&self) -> &EnrichmentOptions {
        &self.options
    }

    /// The instant stamped into every record's created-at field.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Add (or replace) a static field.
    pub fn add_metadata_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.options.additional_metadata.insert(key.into(), value.into());
    }

    pub fn remove_metadata_field(&mut self, key: &str) -> Option<Value> {
        self.options.additional_metadata.shift_remove(key)
    }

    /// Switch the timestamp rendering. `custom_pattern` only applies to `"custom"`.
    pub fn set_datetime_format(
        &mut self,
        name: &str,
        custom_pattern: Option<&str>,
    ) -> TransformResult<()> {
        let format = DateTimeFormat::from(name.to_string());
        if let DateTimeFormat::Unknown(name) = format {
            return Err(TransformError::UnknownConfigurationValue {
                key: "datetime_format".to_string(),
                value: name,
            });
        }
        if let (DateTimeFormat::Custom, Some(pattern)) = (&format, custom_pattern) {
            validate_pattern(pattern)?;
            self.options.custom_datetime_format = pattern.to_string();
        }
        self.options.datetime_format = format;
        Ok(())
    }

    /// Fields this enricher may add, in the order it adds them.
    pub fn added_fields(&self) -> Vec<String> {
        let o = &self.options;
        let mut fields = Vec::new();
        if o.add_created_at {
            fields.push(o.created_at_field.clone());
        }
        if o.add_processed_at {
            fields.push(o.processed_at_field.clone());
        }
        if o.add_unique_id {
            fields.push(o.id_field.clone());
        }
        if o.add_source_info {
            let source_fields = [DATA_SOURCE_FIELD, SOURCE_TOPIC_FIELD, SOURCE_DOCUMENT_ID_FIELD];
            fields.extend(source_fields.map(String::from));
        }
        fields.extend(o.additional_metadata.keys().cloned());
        fields
    }

    /// What `record` would look like after enrichment.
    pub fn preview(&self, record: Record, metadata: &Metadata) -> Record {
        self.enrich_record(record, metadata).0
    }

    /// Enrich a batch.
    pub fn enrich(&self, batch: Vec<Envelope>) -> TransformResult<Vec<Envelope>> {
        self.apply(batch).map(|out| out.records)
    }

    /// Enrich a batch and return the aggregated statistics alongside it.
    pub fn apply(&self, batch: Vec<Envelope>) -> TransformResult<StageOutput> {
        let mut acc = BatchAccumulator::new(StageKind::MetadataEnrichment, COUNTERS, batch.len());
        for envelope in batch {
            let (data, stats) = self.enrich_record(envelope.data, &envelope.metadata);
            acc.push(Envelope::new(data, envelope.metadata), stats);
        }
        let out = acc.finish(super::snapshot(&self.options));
        debug!(stage = %StageKind::MetadataEnrichment, stats = %out.stats, "stage_complete");
        Ok(out)
    }

    fn enrich_record(&self, mut record: Record, metadata: &Metadata) -> (Record, StageStats) {
        let o = &self.options;
        let mut stats = StageStats::default();

        if o.add_created_at {
            let created_at = self.format_datetime(self.started_at);
            record.insert(o.created_at_field.clone(), Value::Utf8(created_at));
            stats.incr(CREATED_AT_ADDED);
        }
        if o.add_processed_at {
            let processed_at = self.format_datetime(Utc::now());
            record.insert(o.processed_at_field.clone(), Value::Utf8(processed_at));
            stats.incr(PROCESSED_AT_ADDED);
        }
        if o.add_unique_id {
            record.insert(o.id_field.clone(), Value::Utf8(self.generate_id()));
            stats.incr(UNIQUE_IDS_ADDED);
        }
        if o.add_source_info {
            add_source_info(&mut record, metadata);
            stats.incr(SOURCE_INFO_ADDED);
        }
        for (key, value) in &o.additional_metadata {
            if !record.contains_key(key) {
                record.insert(key.clone(), value.clone());
                stats.incr(ADDITIONAL_FIELDS_ADDED);
            }
        }
        (record, stats)
    }

    pub(crate) fn format_datetime(&self, dt: DateTime<Utc>) -> String {
        match self.options.datetime_format {
            DateTimeFormat::Timestamp => dt.timestamp().to_string(),
            DateTimeFormat::Custom => dt.format(&self.options.custom_datetime_format).to_string(),
            DateTimeFormat::Iso | DateTimeFormat::Unknown(_) => {
                dt.to_rfc3339_opts(SecondsFormat::Micros, true)
            }
        }
    }

    fn generate_id(&self) -> String {
        let id = Uuid::new_v4();
        if self.options.id_prefix.is_empty() {
            id.to_string()
        } else {
            format!("{}_{id}", self.options.id_prefix)
        }
    }
}

fn add_source_info(record: &mut Record, metadata: &Metadata) {
    let source = metadata.source_type();
    record.insert(DATA_SOURCE_FIELD.to_string(), Value::from(source.as_str()));

    let (field, attribute) = match source {
        SourceType::Kafka => (SOURCE_TOPIC_FIELD, "topic"),
        SourceType::MongoDb => (SOURCE_DOCUMENT_ID_FIELD, "document_id"),
        _ => return,
    };
    match metadata.get(attribute) {
        None | Some(Value::Null) => {}
        Some(Value::Utf8(s)) if s.is_empty() => {}
        Some(v) => {
            record.insert(field.to_string(), v.clone());
        }
    }
}

/// Reject strftime patterns chrono cannot render.
fn validate_pattern(pattern: &str) -> TransformResult<()> {
    if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        return Err(TransformError::InvalidConfig {
            message: format!("bad custom_datetime_format '{pattern}'"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::record_from_json;
    use chrono::TimeZone;
    use serde_json::json;

    fn kafka_envelope(data: serde_json::Value) -> Envelope {
        Envelope::new(
            record_from_json(data).unwrap(),
            Metadata::new(SourceType::Kafka).with_attribute("topic", "users"),
        )
    }

    #[test]
    fn default_enrichment_adds_timestamps_and_source() {
        let enricher = MetadataEnricher::new(EnrichmentOptions::default()).unwrap();
        let out = enricher.apply(vec![kafka_envelope(json!({"a": 1}))]).unwrap();
        let data = &out.records[0].data;

        assert!(data.contains_key("createdAt"));
        assert!(data.contains_key("processedAt"));
        assert!(!data.contains_key("recordId"));
        assert_eq!(data.get(DATA_SOURCE_FIELD), Some(&Value::from("kafka")));
        assert_eq!(data.get(SOURCE_TOPIC_FIELD), Some(&Value::from("users")));
        assert_eq!(out.stats.get(CREATED_AT_ADDED), 1);
        assert_eq!(out.stats.get(SOURCE_INFO_ADDED), 1);
        // Provenance is untouched apart from the trail.
        assert_eq!(out.records[0].metadata.source_type(), &SourceType::Kafka);
    }

    #[test]
    fn created_at_is_shared_across_the_batch() {
        let enricher = MetadataEnricher::new(EnrichmentOptions::default()).unwrap();
        let out = enricher
            .enrich(vec![kafka_envelope(json!({})), kafka_envelope(json!({}))])
            .unwrap();
        assert_eq!(out[0].data.get("createdAt"), out[1].data.get("createdAt"));
        assert_eq!(
            out[0].data.get("createdAt"),
            Some(&Value::Utf8(enricher.format_datetime(enricher.started_at())))
        );
    }

    #[test]
    fn document_source_gets_document_id() {
        let enricher = MetadataEnricher::new(EnrichmentOptions::default()).unwrap();
        let metadata = Metadata::new(SourceType::MongoDb).with_attribute("document_id", "abc123");
        let out = enricher.preview(Record::new(), &metadata);
        assert_eq!(out.get(DATA_SOURCE_FIELD), Some(&Value::from("mongodb")));
        assert_eq!(out.get(SOURCE_DOCUMENT_ID_FIELD), Some(&Value::from("abc123")));
        assert!(!out.contains_key(SOURCE_TOPIC_FIELD));
    }

    #[test]
    fn unique_ids_are_prefixed_uuids() {
        let enricher = MetadataEnricher::new(EnrichmentOptions {
            add_unique_id: true,
            id_prefix: "rec".into(),
            ..Default::default()
        })
        .unwrap();
        let out = enricher
            .enrich(vec![kafka_envelope(json!({})), kafka_envelope(json!({}))])
            .unwrap();
        let a = out[0].data.get("recordId").and_then(Value::as_str).unwrap();
        let b = out[1].data.get("recordId").and_then(Value::as_str).unwrap();
        assert_ne!(a, b);
        let uuid = a.strip_prefix("rec_").unwrap();
        assert!(Uuid::parse_str(uuid).is_ok());
    }

    #[test]
    fn additional_metadata_never_overwrites() {
        let mut enricher = MetadataEnricher::new(EnrichmentOptions::default()).unwrap();
        enricher.add_metadata_field("env", "prod");
        enricher.add_metadata_field("team", "data");
        let out = enricher
            .apply(vec![kafka_envelope(json!({"env": "staging"}))])
            .unwrap();
        assert_eq!(out.records[0].data.get("env"), Some(&Value::from("staging")));
        assert_eq!(out.records[0].data.get("team"), Some(&Value::from("data")));
        assert_eq!(out.stats.get(ADDITIONAL_FIELDS_ADDED), 1);

        assert_eq!(enricher.remove_metadata_field("team"), Some(Value::from("data")));
        assert!(!enricher.added_fields().contains(&"team".to_string()));
    }

    #[test]
    fn datetime_formats_render() {
        let mut enricher = MetadataEnricher::new(EnrichmentOptions::default()).unwrap();
        let dt = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        assert_eq!(enricher.format_datetime(dt), "2024-01-15T10:30:00.000000Z");

        enricher.set_datetime_format("timestamp", None).unwrap();
        assert_eq!(enricher.format_datetime(dt), "1705314600");

        enricher.set_datetime_format("custom", Some("%d/%m/%Y")).unwrap();
        assert_eq!(enricher.format_datetime(dt), "15/01/2024");
    }

    #[test]
    fn invalid_format_names_and_patterns_are_rejected() {
        let mut enricher = MetadataEnricher::new(EnrichmentOptions::default()).unwrap();
        assert!(matches!(
            enricher.set_datetime_format("rfc2822", None),
            Err(TransformError::UnknownConfigurationValue { .. })
        ));
        assert!(matches!(
            enricher.set_datetime_format("custom", Some("%Q")),
            Err(TransformError::InvalidConfig { .. })
        ));
        assert_eq!(enricher.options().datetime_format, DateTimeFormat::Iso);
    }

    #[test]
    fn unknown_format_from_config_falls_back_to_iso() {
        let opts: EnrichmentOptions =
            serde_json::from_value(json!({"datetime_format": "epoch_ms"})).unwrap();
        assert_eq!(opts.datetime_format, DateTimeFormat::Unknown("epoch_ms".into()));
        let enricher = MetadataEnricher::new(opts).unwrap();
        let dt = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        assert_eq!(enricher.format_datetime(dt), "2024-01-15T10:30:00.000000Z");
    }

    #[test]
    fn added_fields_lists_configured_names() {
        let enricher = MetadataEnricher::new(EnrichmentOptions {
            add_processed_at: false,
            add_source_info: false,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(enricher.added_fields(), vec!["createdAt".to_string()]);
    }
}
