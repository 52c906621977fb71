//! Chain orchestrator: runs an ordered list of stages over one batch.
//!
//! This module sits "above" [`crate::processing`] and provides:
//!
//! - strict in-order application of stages, each over the whole batch
//! - abort-on-first-failure (no partial output, no rollback)
//! - real-time metrics + observer hooks for monitoring
//!
//! Execution is single-threaded and synchronous; a run owns its batch exclusively.

mod observer;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::info_span;

use crate::error::TransformResult;
use crate::processing::{
    Cleaner, CleaningOptions, EnrichmentOptions, FieldMapper, FieldMappingOptions, FlattenOptions,
    Flattener, MetadataEnricher, Stage, StageKind, TypeConversionOptions, TypeConverter,
};
use crate::stats::StageStats;
use crate::types::Envelope;

pub use observer::{
    ChainEvent, ChainMetrics, ChainMetricsSnapshot, ChainObserver, TracingChainObserver,
};

/// Output of [`TransformChain::run_with_stats`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutput {
    pub records: Vec<Envelope>,
    /// Aggregated statistics per stage, in execution order.
    pub stage_stats: Vec<(StageKind, StageStats)>,
}

/// An ordered list of stages applied to whole batches.
#[derive(Default)]
pub struct TransformChain {
    stages: Vec<Stage>,
    observer: Option<Arc<dyn ChainObserver>>,
    metrics: Arc<ChainMetrics>,
}

impl fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformChain")
            .field("stages", &self.stage_kinds())
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}

impl TransformChain {
    /// An empty chain. Running it returns the batch unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// All five stages with default options, in the default order.
    pub fn with_default_stages() -> TransformResult<Self> {
        Ok(Self::new()
            .with_stage(Cleaner::new(CleaningOptions::default())?)
            .with_stage(Flattener::new(FlattenOptions::default()))
            .with_stage(FieldMapper::new(FieldMappingOptions::default()))
            .with_stage(TypeConverter::new(TypeConversionOptions::default()))
            .with_stage(MetadataEnricher::new(EnrichmentOptions::default())?))
    }

    /// Attach an observer for chain events.
    pub fn with_observer(mut self, observer: Arc<dyn ChainObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Append a stage.
    pub fn with_stage(mut self, stage: impl Into<Stage>) -> Self {
        self.push(stage);
        self
    }

    /// Append a stage.
    pub fn push(&mut self, stage: impl Into<Stage>) {
        self.stages.push(stage.into());
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(Stage::kind).collect()
    }

    /// First stage of the given kind, for its mutation entry points.
    ///
    /// Must not be called concurrently with a run.
    pub fn stage_mut(&mut self, kind: StageKind) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| s.kind() == kind)
    }

    /// Get a handle to real-time chain metrics.
    pub fn metrics(&self) -> Arc<ChainMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Apply every stage in order.
    pub fn run(&self, batch: Vec<Envelope>) -> TransformResult<Vec<Envelope>> {
        self.run_with_stats(batch).map(|out| out.records)
    }

    /// Validate raw JSON entries against the envelope contract, then run.
    pub fn run_json(&self, raw: Vec<serde_json::Value>) -> TransformResult<Vec<Envelope>> {
        self.run(Envelope::batch_from_json(raw)?)
    }

    /// Apply every stage in order, keeping each stage's aggregated statistics.
    ///
    /// The first failing stage aborts the run; its error is returned and nothing else.
    pub fn run_with_stats(&self, batch: Vec<Envelope>) -> TransformResult<ChainOutput> {
        let start = Instant::now();
        self.metrics.begin_run(batch.len());
        let run_id = self.metrics.snapshot().run_id;
        let _span = info_span!("transform_chain", run_id).entered();

        self.emit(ChainEvent::RunStarted {
            records: batch.len(),
            stages: self.stages.len(),
        });

        let mut records = batch;
        let mut stage_stats = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let kind = stage.kind();
            let stage_start = Instant::now();
            self.metrics.on_stage_start();
            self.emit(ChainEvent::StageStarted {
                stage: kind,
                records: records.len(),
            });

            let out = match stage.apply(records) {
                Ok(out) => out,
                Err(e) => {
                    self.metrics.on_stage_failed();
                    self.emit(ChainEvent::StageFailed {
                        stage: kind,
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            };

            self.metrics.on_stage_end();
            self.emit(ChainEvent::StageFinished {
                stage: kind,
                elapsed: stage_start.elapsed(),
                stats: out.stats.clone(),
            });
            stage_stats.push((kind, out.stats));
            records = out.records;
        }

        self.metrics.end_run(start.elapsed(), records.len());
        self.emit(ChainEvent::RunFinished {
            elapsed: start.elapsed(),
            metrics: self.metrics.snapshot(),
        });

        Ok(ChainOutput { records, stage_stats })
    }

    fn emit(&self, event: ChainEvent) {
        if let Some(o) = &self.observer {
            o.on_event(&event);
        }
    }
}
