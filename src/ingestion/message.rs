//! Message-broker record parser.
//!
//! A raw record looks like `{topic, partition, offset, timestamp, key, headers, raw_value}`;
//! `raw_value` is JSON text (or an already-decoded JSON value) holding the payload.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{TransformError, TransformResult};
use crate::types::{Envelope, Metadata, Record, SourceType, Value, record_from_json};

use super::RecordParser;

/// Message attributes copied into [`Metadata`].
const ATTRIBUTES: &[&str] = &["topic", "partition", "offset", "timestamp", "key"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageParserOptions {
    /// Fail the parse instead of emitting a fallback record.
    pub strict_mode: bool,
    /// Wrap undecodable payloads as `{"raw_text": ...}` instead of treating them as failures.
    pub handle_malformed: bool,
}

impl Default for MessageParserOptions {
    fn default() -> Self {
        Self {
            strict_mode: false,
            handle_malformed: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageParser {
    options: MessageParserOptions,
}

impl MessageParser {
    pub fn new(options: MessageParserOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MessageParserOptions {
        &self.options
    }

    fn decode_payload(&self, raw_value: serde_json::Value) -> Result<Record, String> {
        let text = match raw_value {
            serde_json::Value::String(text) => text,
            serde_json::Value::Null => {
                return Err("no 'raw_value' field found in record".to_string());
            }
            decoded => {
                return record_from_json(decoded)
                    .ok_or_else(|| "raw_value is not a JSON object".to_string());
            }
        };

        let decoded = match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(v) => v,
            Err(_) if self.options.handle_malformed => return Ok(raw_text(text)),
            Err(e) => return Err(format!("invalid JSON format: {e}")),
        };
        match record_from_json(decoded) {
            Some(record) => Ok(record),
            None if self.options.handle_malformed => Ok(raw_text(text)),
            None => Err("raw_value is not a JSON object".to_string()),
        }
    }
}

fn raw_text(text: String) -> Record {
    let mut record = Record::new();
    record.insert("raw_text".to_string(), Value::Utf8(text));
    record
}

fn message_metadata(raw: &serde_json::Map<String, serde_json::Value>) -> Metadata {
    let mut metadata = Metadata::new(SourceType::Kafka);
    for &attr in ATTRIBUTES {
        let v = raw.get(attr).cloned().unwrap_or_default();
        metadata = metadata.with_attribute(attr, Value::from(v));
    }
    let headers = raw
        .get("headers")
        .filter(|h| !h.is_null())
        .cloned()
        .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
    metadata.with_attribute("headers", Value::from(headers))
}

impl RecordParser for MessageParser {
    fn source_type(&self) -> SourceType {
        SourceType::Kafka
    }

    fn parse_record(
        &self,
        index: usize,
        mut raw: serde_json::Map<String, serde_json::Value>,
    ) -> TransformResult<Envelope> {
        let metadata = message_metadata(&raw);
        let raw_value = raw.remove("raw_value").unwrap_or_default();

        match self.decode_payload(raw_value.clone()) {
            Ok(data) => Ok(Envelope::new(data, metadata)),
            Err(message) if self.options.strict_mode => {
                Err(TransformError::Parse { index, message })
            }
            Err(message) => {
                warn!(index, error = %message, "parse_fallback");
                Ok(Envelope::fallback(Value::from(raw_value), message, metadata))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(raw_value: serde_json::Value) -> serde_json::Value {
        json!({"topic": "users", "partition": 0, "offset": 42, "key": "k1", "raw_value": raw_value})
    }

    #[test]
    fn decodes_json_text_and_copies_attributes() {
        let out = MessageParser::default()
            .parse(vec![message(json!(r#"{"firstName": "Ann", "age": 3}"#))])
            .unwrap();
        let env = &out[0];
        assert_eq!(env.data.get("firstName"), Some(&Value::from("Ann")));
        assert_eq!(env.metadata.source_type(), &SourceType::Kafka);
        assert_eq!(env.metadata.get("topic"), Some(&Value::from("users")));
        assert_eq!(env.metadata.get("offset"), Some(&Value::Int64(42)));
        assert_eq!(env.metadata.get("timestamp"), Some(&Value::Null));
        assert_eq!(env.metadata.get("headers"), Some(&Value::Map(Record::new())));
    }

    #[test]
    fn already_decoded_payload_is_accepted() {
        let out = MessageParser::default().parse(vec![message(json!({"a": 1}))]).unwrap();
        assert_eq!(out[0].data.get("a"), Some(&Value::Int64(1)));
    }

    #[test]
    fn malformed_text_is_wrapped_when_handled() {
        let out = MessageParser::default().parse(vec![message(json!("not json"))]).unwrap();
        assert_eq!(out[0].data.get("raw_text"), Some(&Value::from("not json")));
        assert!(!out[0].is_fallback());
    }

    #[test]
    fn malformed_text_becomes_fallback_when_not_handled() {
        let parser = MessageParser::new(MessageParserOptions {
            handle_malformed: false,
            ..Default::default()
        });
        let out = parser.parse(vec![message(json!("{oops")), message(json!("{}"))]).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_fallback());
        assert_eq!(out[0].data.get("raw_content"), Some(&Value::from("{oops")));
        assert_eq!(out[0].metadata.get("topic"), Some(&Value::from("users")));
        assert!(!out[1].is_fallback());
    }

    #[test]
    fn missing_raw_value_fails_in_strict_mode() {
        let parser = MessageParser::new(MessageParserOptions {
            strict_mode: true,
            ..Default::default()
        });
        let err = parser.parse(vec![message(json!("{}")), json!({"topic": "t"})]).unwrap_err();
        assert!(matches!(err, TransformError::Parse { index: 1, .. }));
    }

    #[test]
    fn non_object_entry_is_a_shape_violation() {
        let err = MessageParser::default().parse(vec![json!([1, 2])]).unwrap_err();
        assert!(err.is_shape_violation());
    }
}
