//! Configuration documents.
//!
//! [`ChainConfig`] is the `transformations` section: one entry per stage, each
//! `{ "enabled": bool, "config": { ...stage options... } }`. Missing sections, and missing keys
//! inside a section, fall back to defaults; unknown keys are ignored. [`PipelineConfig`] wraps it
//! together with the source and pipeline sections.
//!
//! ```rust
//! use record_pipeline::config::ChainConfig;
//! use record_pipeline::processing::StageKind;
//!
//! let cfg = ChainConfig::from_json_str(r#"{
//!     "flattener": {"config": {"separator": "_"}},
//!     "metadata_enricher": {"enabled": false}
//! }"#).unwrap();
//! let chain = cfg.build_chain().unwrap();
//! assert_eq!(chain.stage_kinds().len(), 4);
//! assert!(!chain.stage_kinds().contains(&StageKind::MetadataEnrichment));
//! ```

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{TransformError, TransformResult};
use crate::execution::TransformChain;
use crate::ingestion::{DocumentParser, MessageParser, SourceParser};
use crate::loading::DEFAULT_BATCH_SIZE;
use crate::processing::{
    Cleaner, CleaningOptions, EnrichmentOptions, FieldMapper, FieldMappingOptions, FlattenOptions,
    Flattener, MetadataEnricher, StageKind, TypeConversionOptions, TypeConverter,
};
use crate::types::SourceType;

fn enabled_by_default() -> bool {
    true
}

/// One stage entry of the `transformations` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned + Default"))]
pub struct StageSection<T> {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub config: T,
}

impl<T: Default> Default for StageSection<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            config: T::default(),
        }
    }
}

/// The `transformations` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub data_cleaner: StageSection<CleaningOptions>,
    pub flattener: StageSection<FlattenOptions>,
    pub field_mapper: StageSection<FieldMappingOptions>,
    pub type_converter: StageSection<TypeConversionOptions>,
    pub metadata_enricher: StageSection<EnrichmentOptions>,
}

impl ChainConfig {
    pub fn from_json_str(text: &str) -> TransformResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> TransformResult<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    fn is_enabled(&self, kind: StageKind) -> bool {
        match kind {
            StageKind::Cleaning => self.data_cleaner.enabled,
            StageKind::Flattening => self.flattener.enabled,
            StageKind::FieldMapping => self.field_mapper.enabled,
            StageKind::TypeConversion => self.type_converter.enabled,
            StageKind::MetadataEnrichment => self.metadata_enricher.enabled,
        }
    }

    /// Build the enabled stages in the default order.
    pub fn build_chain(&self) -> TransformResult<TransformChain> {
        let mut chain = TransformChain::new();
        for kind in StageKind::DEFAULT_ORDER {
            if !self.is_enabled(kind) {
                continue;
            }
            match kind {
                StageKind::Cleaning => chain.push(Cleaner::new(self.data_cleaner.config.clone())?),
                StageKind::Flattening => chain.push(Flattener::new(self.flattener.config.clone())),
                StageKind::FieldMapping => {
                    chain.push(FieldMapper::new(self.field_mapper.config.clone()))
                }
                StageKind::TypeConversion => {
                    chain.push(TypeConverter::new(self.type_converter.config.clone()))
                }
                StageKind::MetadataEnrichment => {
                    chain.push(MetadataEnricher::new(self.metadata_enricher.config.clone())?)
                }
            }
        }
        info!(stages = ?chain.stage_kinds(), "chain_built");
        Ok(chain)
    }
}

/// The `source` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    /// Options of the parser for `source_type`.
    pub parser: serde_json::Map<String, serde_json::Value>,
}

/// The `pipeline` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Sub-batch size handed to loaders.
    pub batch_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// A whole pipeline configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub transformations: ChainConfig,
    pub pipeline: PipelineSettings,
}

impl PipelineConfig {
    pub fn from_json_str(text: &str) -> TransformResult<Self> {
        let cfg: Self = serde_json::from_str(text)?;
        if cfg.pipeline.batch_size == 0 {
            return Err(TransformError::InvalidConfig {
                message: "pipeline.batch_size must be > 0".to_string(),
            });
        }
        Ok(cfg)
    }

    pub fn from_path(path: impl AsRef<Path>) -> TransformResult<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    /// Parser for the configured source type.
    pub fn build_parser(&self) -> TransformResult<SourceParser> {
        let options = serde_json::Value::Object(self.source.parser.clone());
        match &self.source.source_type {
            SourceType::Kafka => Ok(SourceParser::Message(MessageParser::new(
                serde_json::from_value(options)?,
            ))),
            SourceType::MongoDb => Ok(SourceParser::Document(DocumentParser::new(
                serde_json::from_value(options)?,
            ))),
            other => Err(TransformError::UnknownConfigurationValue {
                key: "source.type".to_string(),
                value: other.to_string(),
            }),
        }
    }

    pub fn build_chain(&self) -> TransformResult<TransformChain> {
        self.transformations.build_chain()
    }
}
