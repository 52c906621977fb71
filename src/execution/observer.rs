use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::processing::StageKind;
use crate::stats::StageStats;

/// Events emitted by a [`super::TransformChain`] run.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    RunStarted { records: usize, stages: usize },
    StageStarted { stage: StageKind, records: usize },
    StageFinished {
        stage: StageKind,
        elapsed: Duration,
        stats: StageStats,
    },
    StageFailed { stage: StageKind, error: String },
    RunFinished {
        elapsed: Duration,
        metrics: ChainMetricsSnapshot,
    },
}

/// Observer hook for chain events.
pub trait ChainObserver: Send + Sync {
    fn on_event(&self, event: &ChainEvent);
}

/// Forwards chain events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingChainObserver;

impl ChainObserver for TracingChainObserver {
    fn on_event(&self, event: &ChainEvent) {
        match event {
            ChainEvent::RunStarted { records, stages } => {
                info!(records, stages, "chain_run_started");
            }
            ChainEvent::StageStarted { stage, records } => {
                debug!(stage = %stage, records, "stage_started");
            }
            ChainEvent::StageFinished { stage, elapsed, stats } => {
                let elapsed_ms = elapsed.as_millis() as u64;
                info!(stage = %stage, elapsed_ms, stats = %stats, "stage_finished");
            }
            ChainEvent::StageFailed { stage, error } => {
                warn!(stage = %stage, error = %error, "stage_failed");
            }
            ChainEvent::RunFinished { elapsed, metrics } => {
                let elapsed_ms = elapsed.as_millis() as u64;
                info!(elapsed_ms, metrics = %metrics, "chain_run_finished");
            }
        }
    }
}

/// Real-time counters for the most recent chain run.
///
/// The chain updates these while it runs; callers can snapshot them at any time.
#[derive(Debug, Default)]
pub struct ChainMetrics {
    run_id: AtomicU64,
    elapsed_ns: AtomicU64,

    records_in: AtomicU64,
    records_out: AtomicU64,
    stages_started: AtomicU64,
    stages_finished: AtomicU64,
    stages_failed: AtomicU64,
}

impl ChainMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_run(&self, records: usize) {
        let _ = self.run_id.fetch_add(1, Ordering::SeqCst);
        self.elapsed_ns.store(0, Ordering::SeqCst);
        self.records_in.store(records as u64, Ordering::SeqCst);
        self.records_out.store(0, Ordering::SeqCst);
        self.stages_started.store(0, Ordering::SeqCst);
        self.stages_finished.store(0, Ordering::SeqCst);
        self.stages_failed.store(0, Ordering::SeqCst);
    }

    pub fn end_run(&self, elapsed: Duration, records_out: usize) {
        self.elapsed_ns
            .store(elapsed.as_nanos().min(u64::MAX as u128) as u64, Ordering::SeqCst);
        self.records_out.store(records_out as u64, Ordering::SeqCst);
    }

    pub fn on_stage_start(&self) {
        let _ = self.stages_started.fetch_add(1, Ordering::SeqCst);
    }

    pub fn on_stage_end(&self) {
        let _ = self.stages_finished.fetch_add(1, Ordering::SeqCst);
    }

    pub fn on_stage_failed(&self) {
        let _ = self.stages_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ChainMetricsSnapshot {
        let elapsed_ns = self.elapsed_ns.load(Ordering::SeqCst);
        ChainMetricsSnapshot {
            run_id: self.run_id.load(Ordering::SeqCst),
            elapsed: (elapsed_ns > 0).then(|| Duration::from_nanos(elapsed_ns)),
            records_in: self.records_in.load(Ordering::SeqCst),
            records_out: self.records_out.load(Ordering::SeqCst),
            stages_started: self.stages_started.load(Ordering::SeqCst),
            stages_finished: self.stages_finished.load(Ordering::SeqCst),
            stages_failed: self.stages_failed.load(Ordering::SeqCst),
        }
    }
}

/// Immutable snapshot of [`ChainMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainMetricsSnapshot {
    pub run_id: u64,
    /// `None` until a run has finished successfully.
    pub elapsed: Option<Duration>,
    pub records_in: u64,
    pub records_out: u64,
    pub stages_started: u64,
    pub stages_finished: u64,
    pub stages_failed: u64,
}

impl fmt::Display for ChainMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run_id={}, records={}/{}, stages={}/{}, failed={}, elapsed={:?}",
            self.run_id,
            self.records_out,
            self.records_in,
            self.stages_finished,
            self.stages_started,
            self.stages_failed,
            self.elapsed
        )
    }
}
