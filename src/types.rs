//! Core data model: the [`Value`] sum type, payload [`Record`]s, and the [`Envelope`] that
//! carries a payload together with its provenance [`Metadata`] through every stage.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{TransformError, TransformResult};
use crate::stats::StageStats;

/// Format used whenever a [`Value::Timestamp`] is rendered as text.
pub const TIMESTAMP_TEXT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// An insertion-ordered payload mapping.
pub type Record = IndexMap<String, Value>;

/// A single payload value.
///
/// Serializes the way the equivalent JSON would look; timestamps serialize as ISO-8601 text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Missing/empty value.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit float.
    Float64(f64),
    /// UTF-8 string.
    Utf8(String),
    /// Naive date-time produced by datetime conversion.
    Timestamp(NaiveDateTime),
    /// Ordered sequence of values.
    List(Vec<Value>),
    /// Nested mapping.
    Map(Record),
}

impl Value {
    /// Whether this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Utf8(s) => Some(s),
            _ => None,
        }
    }

    /// Scalars are everything except lists and maps.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::List(_) | Value::Map(_))
    }

    /// Short lower-case name of the variant, used in log fields and error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int64(_) => "int",
            Value::Float64(_) => "float",
            Value::Utf8(_) => "str",
            Value::Timestamp(_) => "datetime",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Textual rendering of the value.
    ///
    /// Strings render as-is and timestamps as `YYYY-MM-DDTHH:MM:SS[.fff]`; every other value
    /// renders as compact JSON: `null`, `true`/`false` (lower case), `30.0`, `[1,2]`, `{"a":1}`.
    ///
    /// The `str` conversion target and the `string` flatten rule both use this rendering.
    pub fn to_text(&self) -> String {
        match self {
            Value::Utf8(s) => s.clone(),
            Value::Timestamp(ts) => ts.format(TIMESTAMP_TEXT_FORMAT).to_string(),
            other => other.to_json().to_string(),
        }
    }

    /// Convert into a `serde_json::Value`. Non-finite floats become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int64(n) => serde_json::Value::from(*n),
            Value::Float64(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Utf8(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(ts) => {
                serde_json::Value::String(ts.format(TIMESTAMP_TEXT_FORMAT).to_string())
            }
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int64(i),
                None => Value::Float64(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Utf8(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Utf8(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Utf8(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int64(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float64(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Convert a JSON object into a [`Record`]; `None` if `v` is not an object.
pub fn record_from_json(v: serde_json::Value) -> Option<Record> {
    match v {
        serde_json::Value::Object(map) => {
            Some(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
        }
        _ => None,
    }
}

/// Origin of a record, set once by the parser that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum SourceType {
    /// Message-broker record.
    Kafka,
    /// Document-store document.
    MongoDb,
    /// Absent or explicitly unknown.
    #[default]
    Unknown,
    /// Any other tag, kept verbatim.
    Other(String),
}

impl SourceType {
    /// The tag as it appears in configuration tables and metadata.
    pub fn as_str(&self) -> &str {
        match self {
            SourceType::Kafka => "kafka",
            SourceType::MongoDb => "mongodb",
            SourceType::Unknown => "unknown",
            SourceType::Other(s) => s,
        }
    }
}

impl From<&str> for SourceType {
    fn from(s: &str) -> Self {
        match s {
            "kafka" => SourceType::Kafka,
            "mongodb" => SourceType::MongoDb,
            "unknown" | "" => SourceType::Unknown,
            other => SourceType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SourceType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SourceType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = Option::<String>::deserialize(deserializer)?;
        Ok(tag.as_deref().map(SourceType::from).unwrap_or_default())
    }
}

/// One entry of a record's audit trail, appended by each stage that touched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationRecord {
    /// Transformation family, e.g. `data_cleaning`.
    #[serde(rename = "type")]
    pub transformation_type: String,
    /// When the stage finished the batch.
    pub timestamp: DateTime<Utc>,
    /// Stage that produced the entry, e.g. `cleaning`.
    pub stage_name: String,
    /// Aggregated counters for the whole batch the record was part of.
    pub stats: StageStats,
    /// Counters for this record alone.
    #[serde(default)]
    pub record_stats: StageStats,
    /// Serialized stage options at the time of the run.
    pub configuration_snapshot: serde_json::Value,
}

/// Pipeline-owned provenance for a record.
///
/// The source tag is fixed at construction and the transformation trail is append-only;
/// neither can be rewritten through the public API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    source_type: SourceType,
    #[serde(default)]
    transformations_applied: Vec<TransformationRecord>,
    #[serde(flatten)]
    attributes: Record,
}

impl Metadata {
    /// Create metadata for a record from `source_type`.
    pub fn new(source_type: SourceType) -> Self {
        Self {
            source_type,
            transformations_applied: Vec::new(),
            attributes: Record::new(),
        }
    }

    /// Builder-style attribute insertion, used by parsers.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Source tag of the record.
    pub fn source_type(&self) -> &SourceType {
        &self.source_type
    }

    /// Audit trail, in stage-execution order.
    pub fn transformations(&self) -> &[TransformationRecord] {
        &self.transformations_applied
    }

    /// Source-specific attributes (topic, offset, document id, ...).
    pub fn attributes(&self) -> &Record {
        &self.attributes
    }

    /// Look up a source-specific attribute.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub(crate) fn push_transformation(&mut self, entry: TransformationRecord) {
        self.transformations_applied.push(entry);
    }
}

/// The unit of exchange between stages: a payload plus its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub data: Record,
    pub metadata: Metadata,
}

impl Envelope {
    /// Create an envelope from a payload and metadata.
    pub fn new(data: Record, metadata: Metadata) -> Self {
        Self { data, metadata }
    }

    /// Build the structurally valid stand-in for an input unit that could not be parsed.
    pub fn fallback(
        raw_content: Value,
        parse_error: impl Into<String>,
        metadata: Metadata,
    ) -> Self {
        let mut data = Record::new();
        data.insert("raw_content".to_string(), raw_content);
        data.insert("parse_error".to_string(), Value::Utf8(parse_error.into()));
        data.insert("parsing_status".to_string(), Value::from("failed"));
        Self { data, metadata }
    }

    /// Whether this envelope is a fallback record.
    pub fn is_fallback(&self) -> bool {
        self.data.get("parsing_status").and_then(Value::as_str) == Some("failed")
    }

    /// Validate one raw JSON entry against the envelope contract.
    ///
    /// `index` is the entry's position in its batch and is only used for error reporting.
    pub fn from_json(index: usize, raw: serde_json::Value) -> TransformResult<Self> {
        let mut obj = match raw {
            serde_json::Value::Object(obj) => obj,
            other => {
                let message = format!("expected an object, found {}", json_kind(&other));
                return Err(shape_error(index, message));
            }
        };

        let data = obj
            .remove("data")
            .ok_or_else(|| shape_error(index, "missing 'data'"))?;
        let metadata = obj
            .remove("metadata")
            .ok_or_else(|| shape_error(index, "missing 'metadata'"))?;

        let data_kind = json_kind(&data);
        let data = record_from_json(data).ok_or_else(|| {
            shape_error(index, format!("'data' must be a mapping, found {data_kind}"))
        })?;

        if !metadata.is_object() {
            return Err(shape_error(
                index,
                format!("'metadata' must be a mapping, found {}", json_kind(&metadata)),
            ));
        }
        let metadata: Metadata = serde_json::from_value(metadata)
            .map_err(|e| shape_error(index, format!("malformed 'metadata': {e}")))?;

        Ok(Self { data, metadata })
    }

    /// Validate a whole raw batch. The first violation aborts with its index.
    pub fn batch_from_json(raw: Vec<serde_json::Value>) -> TransformResult<Vec<Self>> {
        raw.into_iter()
            .enumerate()
            .map(|(i, v)| Self::from_json(i, v))
            .collect()
    }

    /// Render the envelope back to JSON.
    pub fn to_json(&self) -> TransformResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn shape_error(index: usize, message: impl Into<String>) -> TransformError {
    TransformError::InvalidInputShape {
        index,
        message: message.into(),
    }
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_accepts_valid_envelope() {
        let env = Envelope::from_json(
            0,
            json!({"data": {"a": 1, "b": "x"}, "metadata": {"source_type": "kafka", "topic": "t"}}),
        )
        .unwrap();
        assert_eq!(env.data.get("a"), Some(&Value::Int64(1)));
        assert_eq!(env.metadata.source_type(), &SourceType::Kafka);
        assert_eq!(env.metadata.get("topic"), Some(&Value::from("t")));
        assert!(env.metadata.transformations().is_empty());
    }

    #[test]
    fn from_json_rejects_non_mapping_data() {
        let err = Envelope::from_json(3, json!({"data": [1, 2], "metadata": {}})).unwrap_err();
        assert!(err.is_shape_violation());
        let msg = err.to_string();
        assert!(msg.contains("record 3"));
        assert!(msg.contains("'data' must be a mapping"));
    }

    #[test]
    fn from_json_rejects_missing_metadata() {
        let err = Envelope::from_json(0, json!({"data": {}})).unwrap_err();
        assert!(err.to_string().contains("missing 'metadata'"));
    }

    #[test]
    fn batch_from_json_reports_first_bad_index() {
        let err = Envelope::batch_from_json(vec![
            json!({"data": {}, "metadata": {}}),
            json!("nope"),
        ])
        .unwrap_err();
        assert!(matches!(err, TransformError::InvalidInputShape { index: 1, .. }));
    }

    #[test]
    fn absent_or_null_source_type_is_unknown() {
        let raw = json!({"data": {}, "metadata": {"source_type": null}});
        let env = Envelope::from_json(0, raw).unwrap();
        assert_eq!(env.metadata.source_type(), &SourceType::Unknown);
        let raw = json!({"data": {}, "metadata": {"source_type": "s3"}});
        let env = Envelope::from_json(0, raw).unwrap();
        assert_eq!(env.metadata.source_type().as_str(), "s3");
    }

    #[test]
    fn to_text_renders_scalars_and_containers() {
        assert_eq!(Value::from("abc").to_text(), "abc");
        assert_eq!(Value::Null.to_text(), "null");
        assert_eq!(Value::Float64(30.0).to_text(), "30.0");
        assert_eq!(Value::Bool(true).to_text(), "true");
        assert_eq!(Value::from(serde_json::json!([1, "a"])).to_text(), r#"[1,"a"]"#);
        let ts = NaiveDateTime::parse_from_str("2024-01-15 10:30:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(Value::Timestamp(ts).to_text(), "2024-01-15T10:30:00");
    }

    #[test]
    fn fallback_record_is_flagged() {
        let env =
            Envelope::fallback(Value::from("{oops"), "bad json", Metadata::new(SourceType::Kafka));
        assert!(env.is_fallback());
        assert_eq!(env.data.get("parse_error"), Some(&Value::from("bad json")));
    }
}
