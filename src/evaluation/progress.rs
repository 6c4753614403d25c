use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Pending,
    Generating,
    Scoring,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: RunPhase,
    pub to: RunPhase,
    pub elapsed_ms: u64,
}

/// Step counter for one phase of a run, logged as `[done/total]`.
pub struct RunProgress {
    run_id: uuid::Uuid,
    phase: RunPhase,
    started_at: Instant,
    last_transition: Instant,
    transitions: Vec<PhaseTransition>,
    total_steps: usize,
    completed_steps: usize,
}

impl RunProgress {
    pub fn new(run_id: uuid::Uuid) -> Self {
        let now = Instant::now();
        debug!(run_id = %run_id, "Starting run progress tracking");
        Self {
            run_id,
            phase: RunPhase::Pending,
            started_at: now,
            last_transition: now,
            transitions: Vec::new(),
            total_steps: 0,
            completed_steps: 0,
        }
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_steps == 0 {
            return if self.phase == RunPhase::Completed { 100.0 } else { 0.0 };
        }
        (self.completed_steps as f64 / self.total_steps as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Enter `phase` with a fresh step counter.
    pub fn begin(&mut self, phase: RunPhase, total_steps: usize) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_transition).as_millis() as u64;
        debug!(
            run_id = %self.run_id,
            from = ?self.phase,
            to = ?phase,
            elapsed_ms = %elapsed,
            "Phase transition"
        );
        self.transitions.push(PhaseTransition {
            from: self.phase,
            to: phase,
            elapsed_ms: elapsed,
        });
        self.phase = phase;
        self.last_transition = now;
        self.total_steps = total_steps;
        self.completed_steps = 0;
    }

    pub fn step(&mut self, label: &str) {
        self.completed_steps += 1;
        info!(
            phase = ?self.phase,
            "[{}/{}] {} ({:.0}%)",
            self.completed_steps,
            self.total_steps,
            label,
            self.progress_percent()
        );
    }

    pub fn complete(&mut self) {
        self.begin(RunPhase::Completed, 0);
        info!(run_id = %self.run_id, elapsed_ms = %self.elapsed_ms(), "Run completed");
    }

    pub fn fail(&mut self) {
        let completed = self.completed_steps;
        self.begin(RunPhase::Failed, 0);
        warn!(
            run_id = %self.run_id,
            elapsed_ms = %self.elapsed_ms(),
            steps_completed = %completed,
            "Run failed"
        );
    }
}
