//! Document-store parser.
//!
//! Documents arrive as JSON objects, possibly in extended-JSON form. Object ids are
//! `{"$oid": "<hex>"}`. Dates are `{"$date": <iso text | epoch millis>}` or
//! `{"$date": {"$numberLong": "<ms>"}}`.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TransformResult;
use crate::types::{Envelope, Metadata, Record, SourceType, TIMESTAMP_TEXT_FORMAT, Value};

use super::RecordParser;

const ID_FIELD: &str = "_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentParserOptions {
    /// Render `{"$oid": ...}` ids as plain strings.
    pub convert_objectid: bool,
    /// Render `{"$date": ...}` as ISO text; otherwise keep a timestamp value.
    pub convert_datetime: bool,
    /// Keep the `_id` field in the payload.
    pub preserve_id_field: bool,
}

impl Default for DocumentParserOptions {
    fn default() -> Self {
        Self {
            convert_objectid: true,
            convert_datetime: true,
            preserve_id_field: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DocumentParser {
    options: DocumentParserOptions,
}

impl DocumentParser {
    pub fn new(options: DocumentParserOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DocumentParserOptions {
        &self.options
    }

    fn clean_document(
        &self,
        doc: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Record, String> {
        let mut cleaned = Record::with_capacity(doc.len());
        for (key, value) in doc {
            if key == ID_FIELD {
                if self.options.preserve_id_field {
                    let id = if self.options.convert_objectid {
                        Value::Utf8(id_text(value))
                    } else {
                        Value::from(value.clone())
                    };
                    cleaned.insert(key.clone(), id);
                }
                continue;
            }
            cleaned.insert(key.clone(), self.clean_value(value)?);
        }
        Ok(cleaned)
    }

    fn clean_value(&self, value: &serde_json::Value) -> Result<Value, String> {
        match value {
            serde_json::Value::Object(obj) => {
                if let Some(date) = obj.get("$date").filter(|_| obj.len() == 1) {
                    let ts = decode_date(date)?;
                    return Ok(if self.options.convert_datetime {
                        Value::Utf8(ts.format(TIMESTAMP_TEXT_FORMAT).to_string())
                    } else {
                        Value::Timestamp(ts)
                    });
                }
                if let Some(oid) = object_id(obj) {
                    return Ok(if self.options.convert_objectid {
                        Value::from(oid)
                    } else {
                        Value::from(value.clone())
                    });
                }
                self.clean_document(obj).map(Value::Map)
            }
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| self.clean_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            other => Ok(Value::from(other.clone())),
        }
    }
}

fn object_id(obj: &serde_json::Map<String, serde_json::Value>) -> Option<&str> {
    match obj.get("$oid") {
        Some(serde_json::Value::String(hex)) if obj.len() == 1 => Some(hex),
        _ => None,
    }
}

/// Text form of an `_id`, whatever its shape.
fn id_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(obj) => match object_id(obj) {
            Some(hex) => hex.to_string(),
            None => value.to_string(),
        },
        other => other.to_string(),
    }
}

fn id_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Object(obj) if object_id(obj).is_some() => "ObjectId",
        serde_json::Value::String(_) => "str",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        serde_json::Value::Number(_) => "float",
        serde_json::Value::Object(_) => "dict",
        serde_json::Value::Array(_) => "list",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Null => "NoneType",
    }
}

fn decode_date(date: &serde_json::Value) -> Result<NaiveDateTime, String> {
    let millis = match date {
        serde_json::Value::String(text) => {
            return DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.naive_utc())
                .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
                .map_err(|e| format!("bad $date '{text}': {e}"));
        }
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::Object(obj) => obj
            .get("$numberLong")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| s.parse::<i64>().ok()),
        _ => None,
    };
    millis
        .and_then(DateTime::from_timestamp_millis)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| format!("bad $date value {date}"))
}

fn document_metadata(doc: &serde_json::Map<String, serde_json::Value>) -> Metadata {
    let id = doc.get(ID_FIELD);
    let mut metadata = Metadata::new(SourceType::MongoDb)
        .with_attribute("document_id", id.map(|v| Value::Utf8(id_text(v))).unwrap_or(Value::Null))
        .with_attribute("field_count", doc.len() as i64)
        .with_attribute(
            "has_nested_objects",
            doc.values().any(|v| v.is_object() || v.is_array()),
        );
    if let Some(id) = id {
        metadata = metadata.with_attribute("original_id_type", id_type(id));
    }
    metadata
}

impl RecordParser for DocumentParser {
    fn source_type(&self) -> SourceType {
        SourceType::MongoDb
    }

    fn parse_record(
        &self,
        index: usize,
        raw: serde_json::Map<String, serde_json::Value>,
    ) -> TransformResult<Envelope> {
        let metadata = document_metadata(&raw);
        match self.clean_document(&raw) {
            Ok(data) => Ok(Envelope::new(data, metadata)),
            Err(message) => {
                warn!(index, error = %message, "parse_fallback");
                let raw_content = Value::from(serde_json::Value::Object(raw));
                Ok(Envelope::fallback(raw_content, message, metadata))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unwraps_extended_json() {
        let out = DocumentParser::default()
            .parse(vec![json!({
                "_id": {"$oid": "65a1b2c3d4e5f6a7b8c9d0e1"},
                "name": "Ann",
                "created": {"$date": "2024-01-15T10:30:00Z"},
                "tags": [{"$date": {"$numberLong": "0"}}],
                "owner": {"ref": {"$oid": "abc"}}
            })])
            .unwrap();
        let env = &out[0];
        assert_eq!(env.data.get("_id"), Some(&Value::from("65a1b2c3d4e5f6a7b8c9d0e1")));
        assert_eq!(env.data.get("created"), Some(&Value::from("2024-01-15T10:30:00")));
        assert_eq!(
            env.data.get("tags"),
            Some(&Value::List(vec![Value::from("1970-01-01T00:00:00")]))
        );
        assert_eq!(env.data.get("owner"), Some(&Value::from(json!({"ref": "abc"}))));

        assert_eq!(env.metadata.source_type(), &SourceType::MongoDb);
        assert_eq!(env.metadata.get("document_id"), Some(&Value::from("65a1b2c3d4e5f6a7b8c9d0e1")));
        assert_eq!(env.metadata.get("field_count"), Some(&Value::Int64(5)));
        assert_eq!(env.metadata.get("has_nested_objects"), Some(&Value::Bool(true)));
        assert_eq!(env.metadata.get("original_id_type"), Some(&Value::from("ObjectId")));
    }

    #[test]
    fn keeps_timestamps_and_drops_id_when_configured() {
        let parser = DocumentParser::new(DocumentParserOptions {
            convert_datetime: false,
            preserve_id_field: false,
            ..Default::default()
        });
        let out = parser
            .parse(vec![json!({"_id": 7, "at": {"$date": 1705314600000i64}})])
            .unwrap();
        assert!(!out[0].data.contains_key("_id"));
        assert!(matches!(out[0].data.get("at"), Some(Value::Timestamp(_))));
        assert_eq!(out[0].metadata.get("document_id"), Some(&Value::from("7")));
    }

    #[test]
    fn undecodable_date_becomes_fallback() {
        let out = DocumentParser::default()
            .parse(vec![json!({"_id": "x", "at": {"$date": true}})])
            .unwrap();
        assert!(out[0].is_fallback());
        assert_eq!(out[0].metadata.get("document_id"), Some(&Value::from("x")));
    }

    #[test]
    fn flat_document_has_no_nested_objects() {
        let out = DocumentParser::default().parse(vec![json!({"a": 1})]).unwrap();
        assert_eq!(out[0].metadata.get("has_nested_objects"), Some(&Value::Bool(false)));
        assert_eq!(out[0].metadata.get("document_id"), Some(&Value::Null));
    }
}
