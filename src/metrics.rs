use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for one run, written into the provenance sidecar.
#[derive(Debug)]
pub struct RunMetrics {
    pub records_total: AtomicU64,
    pub records_resumed: AtomicU64,
    pub records_completed: AtomicU64,
    pub generation_calls: AtomicU64,
    pub samples_generated: AtomicU64,
    pub store_saves: AtomicU64,
    pub scorers_run: AtomicU64,
    pub generation_ms: AtomicU64,
    pub scoring_ms: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub records_total: u64,
    pub records_resumed: u64,
    pub records_completed: u64,
    pub generation_calls: u64,
    pub samples_generated: u64,
    pub store_saves: u64,
    pub scorers_run: u64,
    pub generation_ms: u64,
    pub scoring_ms: u64,
}

impl RunMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records_total: AtomicU64::new(0),
            records_resumed: AtomicU64::new(0),
            records_completed: AtomicU64::new(0),
            generation_calls: AtomicU64::new(0),
            samples_generated: AtomicU64::new(0),
            store_saves: AtomicU64::new(0),
            scorers_run: AtomicU64::new(0),
            generation_ms: AtomicU64::new(0),
            scoring_ms: AtomicU64::new(0),
        })
    }

    pub fn start_generation(&self, records: usize) {
        self.records_total
            .store(records as u64, Ordering::Relaxed);
    }

    /// A record that was already fully generated before this run.
    pub fn record_resumed(&self) {
        self.records_resumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.records_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generation_call(&self, samples: usize, duration_ms: u64) {
        self.generation_calls.fetch_add(1, Ordering::Relaxed);
        self.samples_generated
            .fetch_add(samples as u64, Ordering::Relaxed);
        self.generation_ms.fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn store_saved(&self) {
        self.store_saves.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scorer_finished(&self, duration_ms: u64) {
        self.scorers_run.fetch_add(1, Ordering::Relaxed);
        self.scoring_ms.fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_total: self.records_total.load(Ordering::Relaxed),
            records_resumed: self.records_resumed.load(Ordering::Relaxed),
            records_completed: self.records_completed.load(Ordering::Relaxed),
            generation_calls: self.generation_calls.load(Ordering::Relaxed),
            samples_generated: self.samples_generated.load(Ordering::Relaxed),
            store_saves: self.store_saves.load(Ordering::Relaxed),
            scorers_run: self.scorers_run.load(Ordering::Relaxed),
            generation_ms: self.generation_ms.load(Ordering::Relaxed),
            scoring_ms: self.scoring_ms.load(Ordering::Relaxed),
        }
    }
}
