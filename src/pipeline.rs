//! One-shot extract → parse → transform → load driver.
//!
//! [`EtlPipeline::run`] never fails outright: a failing step ends the run early and is reported
//! in the returned [`PipelineReport`]. Source and sink are always disconnected once they have
//! been connected, whether the step succeeded or not.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{TransformError, TransformResult};
use crate::execution::TransformChain;
use crate::ingestion::{RecordParser, read_raw_records, read_raw_records_from_path};
use crate::loading::{LoadResult, Loader};
use crate::processing::StageKind;
use crate::stats::StageStats;
use crate::types::Envelope;

/// How many records a dry run keeps from each step.
pub const DRY_RUN_SAMPLE: usize = 3;

/// A source of raw records.
pub trait Extractor {
    /// Open the source. Returns whether the source is usable.
    fn connect(&mut self) -> TransformResult<bool>;

    /// Pull raw records, at most `limit` when given.
    fn extract(&mut self, limit: Option<usize>) -> TransformResult<Vec<serde_json::Value>>;

    fn disconnect(&mut self) -> TransformResult<bool>;
}

/// Serves a fixed set of raw records.
#[derive(Debug, Clone, Default)]
pub struct MemoryExtractor {
    records: Vec<serde_json::Value>,
    connected: bool,
}

impl MemoryExtractor {
    pub fn new(records: Vec<serde_json::Value>) -> Self {
        Self {
            records,
            connected: false,
        }
    }

    /// Records from a JSON array, a single object or NDJSON text.
    pub fn from_json_str(text: &str) -> TransformResult<Self> {
        Ok(Self::new(read_raw_records(text)?))
    }

    pub fn from_path(path: impl AsRef<Path>) -> TransformResult<Self> {
        Ok(Self::new(read_raw_records_from_path(path)?))
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Extractor for MemoryExtractor {
    fn connect(&mut self) -> TransformResult<bool> {
        self.connected = true;
        Ok(true)
    }

    fn extract(&mut self, limit: Option<usize>) -> TransformResult<Vec<serde_json::Value>> {
        if !self.connected {
            return Err(TransformError::Extract {
                message: "not connected; call connect() first".to_string(),
            });
        }
        let n = limit.unwrap_or(self.records.len()).min(self.records.len());
        Ok(self.records[..n].to_vec())
    }

    fn disconnect(&mut self) -> TransformResult<bool> {
        self.connected = false;
        Ok(true)
    }
}

/// Outcome of [`EtlPipeline::run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub success: bool,
    pub records_extracted: usize,
    pub records_parsed: usize,
    pub records_transformed: usize,
    pub records_loaded: usize,
    pub duration: Duration,
    pub errors: Vec<String>,
    pub load_result: Option<LoadResult>,
    /// Aggregated statistics of every stage that ran.
    pub stage_stats: Vec<(StageKind, StageStats)>,
}

/// Outcome of [`EtlPipeline::dry_run`]: counts plus a few samples from each step.
#[derive(Debug, Clone, Default)]
pub struct DryRunReport {
    pub success: bool,
    pub records_extracted: usize,
    pub records_parsed: usize,
    pub records_transformed: usize,
    pub sample_raw: Vec<serde_json::Value>,
    pub sample_parsed: Vec<Envelope>,
    pub sample_transformed: Vec<Envelope>,
    pub error: Option<String>,
}

pub struct EtlPipeline<E, P, L> {
    extractor: E,
    parser: P,
    chain: TransformChain,
    loader: L,
}

impl<E, P, L> EtlPipeline<E, P, L>
where
    E: Extractor,
    P: RecordParser,
    L: Loader,
{
    pub fn new(extractor: E, parser: P, chain: TransformChain, loader: L) -> Self {
        Self {
            extractor,
            parser,
            chain,
            loader,
        }
    }

    pub fn chain(&self) -> &TransformChain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut TransformChain {
        &mut self.chain
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn into_parts(self) -> (E, P, TransformChain, L) {
        (self.extractor, self.parser, self.chain, self.loader)
    }

    /// Run every step once over everything the extractor yields.
    pub fn run(&mut self) -> PipelineReport {
        let start = Instant::now();
        info!(
            source = %self.parser.source_type(),
            stages = self.chain.stages().len(),
            "pipeline_started"
        );

        let mut report = PipelineReport::default();
        let outcome = self.run_steps(&mut report);
        report.duration = start.elapsed();

        match outcome {
            Ok(()) => {
                report.success = true;
                info!(
                    extracted = report.records_extracted,
                    loaded = report.records_loaded,
                    duration_ms = report.duration.as_millis() as u64,
                    "pipeline_success"
                );
            }
            Err(e) => {
                error!(
                    error = %e,
                    duration_ms = report.duration.as_millis() as u64,
                    "pipeline_failure"
                );
                report.errors.push(e.to_string());
            }
        }
        report
    }

    fn run_steps(&mut self, report: &mut PipelineReport) -> TransformResult<()> {
        let raw = self.extract(None)?;
        report.records_extracted = raw.len();

        let parsed = self.parser.parse(raw)?;
        report.records_parsed = parsed.len();

        let out = self.chain.run_with_stats(parsed)?;
        report.records_transformed = out.records.len();
        report.stage_stats = out.stage_stats;

        let load = self.load(&out.records)?;
        report.records_loaded = load.records_loaded;
        report.errors.extend(load.errors.iter().cloned());
        report.load_result = Some(load);
        Ok(())
    }

    /// Extract, parse and transform at most `max_records` records without loading them.
    pub fn dry_run(&mut self, max_records: usize) -> DryRunReport {
        let mut report = DryRunReport::default();
        match self.dry_run_steps(max_records, &mut report) {
            Ok(()) => report.success = true,
            Err(e) => {
                warn!(error = %e, "dry_run_failure");
                report.error = Some(e.to_string());
            }
        }
        report
    }

    fn dry_run_steps(
        &mut self,
        max_records: usize,
        report: &mut DryRunReport,
    ) -> TransformResult<()> {
        let raw = self.extract(Some(max_records))?;
        report.records_extracted = raw.len();
        report.sample_raw = raw.iter().take(DRY_RUN_SAMPLE).cloned().collect();

        let parsed = self.parser.parse(raw)?;
        report.records_parsed = parsed.len();
        report.sample_parsed = parsed.iter().take(DRY_RUN_SAMPLE).cloned().collect();

        let transformed = self.chain.run(parsed)?;
        report.records_transformed = transformed.len();
        report.sample_transformed = transformed.into_iter().take(DRY_RUN_SAMPLE).collect();
        Ok(())
    }

    fn extract(&mut self, limit: Option<usize>) -> TransformResult<Vec<serde_json::Value>> {
        if !self.extractor.connect()? {
            return Err(TransformError::Extract {
                message: "failed to connect to data source".to_string(),
            });
        }
        let result = self.extractor.extract(limit);
        if let Err(e) = self.extractor.disconnect() {
            warn!(error = %e, "extractor_disconnect_failed");
        }
        let raw = result?;
        info!(records = raw.len(), "extract_complete");
        Ok(raw)
    }

    fn load(&mut self, records: &[Envelope]) -> TransformResult<LoadResult> {
        if !self.loader.connect()? {
            return Err(TransformError::Load {
                message: "failed to connect to data target".to_string(),
            });
        }
        let result = self.loader.load(records);
        if let Err(e) = self.loader.disconnect() {
            warn!(error = %e, "loader_disconnect_failed");
        }
        let load = result?;
        info!(
            loaded = load.records_loaded,
            failed = load.records_failed,
            "load_complete"
        );
        Ok(load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::MessageParser;
    use crate::loading::MemoryLoader;
    use crate::processing::{FieldMapper, FieldMappingOptions, FlattenOptions, Flattener};
    use crate::types::Value;
    use serde_json::json;

    fn messages() -> Vec<serde_json::Value> {
        (0..5)
            .map(|i| {
                json!({
                    "topic": "users",
                    "offset": i,
                    "raw_value": format!(r#"{{"user": {{"firstName": "u{i}"}}}}"#),
                })
            })
            .collect()
    }

    fn chain() -> TransformChain {
        let mut mapping = FieldMappingOptions::default();
        mapping
            .field_mappings
            .entry("kafka".to_string())
            .or_default()
            .insert("first_name".to_string(), vec!["user.firstName".to_string()]);
        TransformChain::new()
            .with_stage(Flattener::new(FlattenOptions::default()))
            .with_stage(FieldMapper::new(mapping))
    }

    /// Refuses to connect.
    struct Unreachable;

    impl Loader for Unreachable {
        fn connect(&mut self) -> TransformResult<bool> {
            Ok(false)
        }
        fn load(&mut self, _: &[Envelope]) -> TransformResult<LoadResult> {
            unreachable!("never connected")
        }
        fn disconnect(&mut self) -> TransformResult<bool> {
            Ok(true)
        }
    }

    #[test]
    fn run_moves_every_record_through() {
        let mut pipeline = EtlPipeline::new(
            MemoryExtractor::new(messages()),
            MessageParser::default(),
            chain(),
            MemoryLoader::new(2),
        );
        let report = pipeline.run();
        assert!(report.success, "{:?}", report.errors);
        assert_eq!(report.records_extracted, 5);
        assert_eq!(report.records_parsed, 5);
        assert_eq!(report.records_transformed, 5);
        assert_eq!(report.records_loaded, 5);
        assert_eq!(report.stage_stats.len(), 2);

        let rows = pipeline.loader().rows();
        assert_eq!(rows[4].get("first_name"), Some(&Value::from("u4")));
        assert!(!pipeline.loader().is_connected());
    }

    #[test]
    fn sink_that_refuses_connection_is_reported() {
        let mut pipeline = EtlPipeline::new(
            MemoryExtractor::new(messages()),
            MessageParser::default(),
            chain(),
            Unreachable,
        );
        let report = pipeline.run();
        assert!(!report.success);
        assert_eq!(report.records_transformed, 5);
        assert_eq!(report.records_loaded, 0);
        assert!(report.errors[0].contains("failed to connect to data target"));
        assert!(report.load_result.is_none());
    }

    #[test]
    fn shape_violation_stops_before_loading() {
        let mut raw = messages();
        raw.push(json!("not an object"));
        let mut pipeline = EtlPipeline::new(
            MemoryExtractor::new(raw),
            MessageParser::default(),
            chain(),
            MemoryLoader::default(),
        );
        let report = pipeline.run();
        assert!(!report.success);
        assert_eq!(report.records_extracted, 6);
        assert_eq!(report.records_parsed, 0);
        assert!(pipeline.loader().rows().is_empty());
    }

    #[test]
    fn dry_run_samples_without_loading() {
        let mut pipeline = EtlPipeline::new(
            MemoryExtractor::new(messages()),
            MessageParser::default(),
            chain(),
            MemoryLoader::default(),
        );
        let report = pipeline.dry_run(4);
        assert!(report.success);
        assert_eq!(report.records_extracted, 4);
        assert_eq!(report.records_transformed, 4);
        assert_eq!(report.sample_raw.len(), DRY_RUN_SAMPLE);
        assert_eq!(
            report.sample_transformed[0].data.get("first_name"),
            Some(&Value::from("u0"))
        );
        assert!(pipeline.loader().rows().is_empty());
    }

    #[test]
    fn extractor_reads_ndjson() {
        let mut ex = MemoryExtractor::from_json_str("{\"a\":1}\n{\"a\":2}\n").unwrap();
        assert!(ex.extract(None).is_err());
        ex.connect().unwrap();
        assert_eq!(ex.extract(Some(1)).unwrap(), vec![json!({"a": 1})]);
        assert_eq!(ex.extract(Some(10)).unwrap().len(), 2);
    }
}
