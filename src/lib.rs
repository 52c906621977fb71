//! `record-pipeline` is a small library for moving records from a source system into a target
//! store through a chain of composable transformation stages.
//!
//! Every record travels as an [`types::Envelope`]: a `data` payload plus `metadata` carrying the
//! source tag and an append-only audit trail. Each stage rewrites the payload, appends one entry
//! to the trail, and reports aggregated [`stats::StageStats`] for the batch.
//!
//! ## Stages (default order)
//!
//! - [`processing::Cleaner`]: trim strings, standardize null sentinels, validate emails/phones
//! - [`processing::Flattener`]: collapse nested objects and lists into path-keyed fields
//! - [`processing::FieldMapper`]: rename fields through per-source alias tables
//! - [`processing::TypeConverter`]: coerce named fields to `int`/`float`/`bool`/`str`/`datetime`
//! - [`processing::MetadataEnricher`]: add timestamps, ids and source provenance fields
//!
//! [`execution::TransformChain`] runs the stages over a whole batch, in order, and reports
//! progress to an optional [`execution::ChainObserver`].
//!
//! ## Quick example: run the default chain
//!
//! ```rust
//! use record_pipeline::execution::TransformChain;
//! use serde_json::json;
//!
//! # fn main() -> Result<(), record_pipeline::TransformError> {
//! let chain = TransformChain::with_default_stages()?;
//! let out = chain.run_json(vec![json!({
//!     "data": {"name": "  Ann  ", "user": {"city": "Oslo"}, "tags": ["a", "b"]},
//!     "metadata": {"source_type": "kafka", "topic": "users"}
//! })])?;
//!
//! let data = &out[0].data;
//! assert_eq!(data["name"].as_str(), Some("Ann"));
//! assert_eq!(data["user.city"].as_str(), Some("Oslo"));
//! assert_eq!(data["tags[1]"].as_str(), Some("b"));
//! assert_eq!(data["sourceTopic"].as_str(), Some("users"));
//! assert_eq!(out[0].metadata.transformations().len(), 5);
//! # Ok(())
//! # }
//! ```
//!
//! ## Around the chain
//!
//! - [`ingestion`]: parsers turning message-broker records and document-store documents into
//!   envelopes, plus a JSON/NDJSON raw-record reader
//! - [`loading`]: the [`loading::Loader`] sink boundary with in-memory and CSV loaders
//! - [`pipeline`]: [`pipeline::EtlPipeline`], one extract → parse → transform → load run
//! - [`config`]: JSON configuration documents for the chain and the pipeline
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod config;
pub mod error;
pub mod execution;
pub mod ingestion;
pub mod loading;
pub mod pipeline;
pub mod processing;
pub mod stats;
pub mod types;

pub use error::{TransformError, TransformResult};
