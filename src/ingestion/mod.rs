//! Parsers that turn raw source records into [`Envelope`]s.
//!
//! - [`MessageParser`]: message-broker records carrying a JSON `raw_value`
//! - [`DocumentParser`]: document-store documents, extended JSON unwrapped
//!
//! Raw records are plain `serde_json::Value`s, read with [`read_raw_records`] or handed over by
//! an extractor. A unit that cannot be parsed becomes a fallback record (see
//! [`Envelope::fallback`]) unless the parser runs in strict mode.

pub mod document;
pub mod json;
pub mod message;

use tracing::debug;

use crate::error::{TransformError, TransformResult};
use crate::types::{Envelope, SourceType};

pub use document::{DocumentParser, DocumentParserOptions};
pub use json::{read_raw_records, read_raw_records_from_path};
pub use message::{MessageParser, MessageParserOptions};

/// Common interface of the source parsers.
pub trait RecordParser {
    /// Source tag stamped on every envelope this parser produces.
    fn source_type(&self) -> SourceType;

    /// Parse one raw record. `index` is its position in the batch.
    fn parse_record(
        &self,
        index: usize,
        raw: serde_json::Map<String, serde_json::Value>,
    ) -> TransformResult<Envelope>;

    /// Parse a batch, preserving order. A non-object entry fails the whole batch.
    fn parse(&self, raw: Vec<serde_json::Value>) -> TransformResult<Vec<Envelope>> {
        let total = raw.len();
        let out = raw
            .into_iter()
            .enumerate()
            .map(|(index, value)| match value {
                serde_json::Value::Object(obj) => self.parse_record(index, obj),
                _ => Err(TransformError::InvalidInputShape {
                    index,
                    message: "raw record is not a JSON object".to_string(),
                }),
            })
            .collect::<TransformResult<Vec<_>>>()?;

        let fallbacks = out.iter().filter(|e| e.is_fallback()).count();
        debug!(source = %self.source_type(), records = total, fallbacks, "parse_complete");
        Ok(out)
    }
}

/// Parser selected by source tag.
#[derive(Debug, Clone)]
pub enum SourceParser {
    Message(MessageParser),
    Document(DocumentParser),
}

impl SourceParser {
    /// Parser with default options for `source`; `None` for sources without one.
    pub fn for_source(source: &SourceType) -> Option<Self> {
        match source {
            SourceType::Kafka => Some(SourceParser::Message(MessageParser::default())),
            SourceType::MongoDb => Some(SourceParser::Document(DocumentParser::default())),
            _ => None,
        }
    }
}

impl RecordParser for SourceParser {
    fn source_type(&self) -> SourceType {
        match self {
            SourceParser::Message(p) => p.source_type(),
            SourceParser::Document(p) => p.source_type(),
        }
    }

    fn parse_record(
        &self,
        index: usize,
        raw: serde_json::Map<String, serde_json::Value>,
    ) -> TransformResult<Envelope> {
        match self {
            SourceParser::Message(p) => p.parse_record(index, raw),
            SourceParser::Document(p) => p.parse_record(index, raw),
        }
    }
}
